//! Per-step and per-sample result records.

use crate::interfaces::{ParserStats, TokenCounts};
use pe_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub output_key: String,
    pub output_value: Option<Value>,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub skipped: bool,
    pub execution_time_ms: u64,
    pub token_counts: TokenCounts,
    pub parser_stats: Option<ParserStats>,
}

impl StepResult {
    pub fn not_reached(step_id: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            output_key: output_key.into(),
            output_value: None,
            success: false,
            error_message: Some("not reached".to_string()),
            error_kind: Some("DependencyFailure".to_string()),
            skipped: true,
            execution_time_ms: 0,
            token_counts: TokenCounts::default(),
            parser_stats: None,
        }
    }

    pub fn dependency_skip(step_id: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            output_key: output_key.into(),
            output_value: None,
            success: false,
            error_message: Some("required dependency failed".to_string()),
            error_kind: Some("DependencyFailure".to_string()),
            skipped: true,
            execution_time_ms: 0,
            token_counts: TokenCounts::default(),
            parser_stats: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleResult {
    pub sample_id: String,
    pub variant: String,
    pub step_results: Vec<StepResult>,
    pub final_outputs: HashMap<String, Value>,
    pub total_time_ms: u64,
    pub token_counts: TokenCounts,
    pub parser_stats: Option<ParserStats>,
    pub error_message: Option<String>,
}

impl SampleResult {
    pub fn is_successful(&self) -> bool {
        self.error_message.is_none()
    }

    pub fn get_failed_steps(&self) -> Vec<&StepResult> {
        self.step_results
            .iter()
            .filter(|s| !s.success && !s.skipped)
            .collect()
    }

    pub fn get_skipped_steps(&self) -> Vec<&StepResult> {
        self.step_results.iter().filter(|s| s.skipped).collect()
    }

    pub fn get_successful_steps(&self) -> Vec<&StepResult> {
        self.step_results.iter().filter(|s| s.success).collect()
    }
}
