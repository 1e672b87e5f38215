//! Consumed external interfaces: agent/flow invocation, sandboxed code
//! runners, and output parsers. The engine treats all three as pure
//! interfaces; implementations are an external collaborator's concern.

use pe_core::Value;
use pe_dag::CodeLanguage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Token accounting for one AgentFlow invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl std::ops::Add for TokenCounts {
    type Output = TokenCounts;

    fn add(self, rhs: TokenCounts) -> TokenCounts {
        TokenCounts {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
            total: self.total + rhs.total,
        }
    }
}

impl std::iter::Sum for TokenCounts {
    fn sum<I: Iterator<Item = TokenCounts>>(iter: I) -> Self {
        iter.fold(TokenCounts::default(), |a, b| a + b)
    }
}

/// Output-parser statistics, produced by a stateful parser and carried
/// unchanged into `StepResult`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_retry_count: u64,
    pub success_rate: f64,
    pub average_retries: f64,
}

impl ParserStats {
    /// Sum two stats snapshots and recompute the derived rates, used when
    /// aggregating a batch step's per-item parser stats (§4.D).
    pub fn combined(&self, other: &ParserStats) -> ParserStats {
        let success_count = self.success_count + other.success_count;
        let failure_count = self.failure_count + other.failure_count;
        let total_retry_count = self.total_retry_count + other.total_retry_count;
        let total = success_count + failure_count;
        let success_rate = if total == 0 {
            0.0
        } else {
            success_count as f64 / total as f64
        };
        let average_retries = if total == 0 {
            0.0
        } else {
            total_retry_count as f64 / total as f64
        };
        ParserStats {
            success_count,
            failure_count,
            total_retry_count,
            success_rate,
            average_retries,
        }
    }
}

/// An error surfaced by an external collaborator. Kept as data (a short
/// kind plus a message) rather than a typed hierarchy, per the "values,
/// not types" framing of step-level error kinds.
#[derive(Debug, Clone)]
pub struct FlowError {
    pub kind: String,
    pub message: String,
}

impl FlowError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Invokes an external LLM agent/flow. Implementations may be network
/// bound; the engine does not require idempotence.
pub trait AgentRunner: Send + Sync {
    fn run_flow(
        &self,
        flow_name: &str,
        vars: &HashMap<String, Value>,
        agent_id: &str,
        model_override: Option<&str>,
    ) -> Result<(String, TokenCounts, Option<ParserStats>), FlowError>;
}

/// The body of a code-node or custom-aggregation step, either inline or a
/// path to load from disk.
pub enum CodeBody<'a> {
    Inline(&'a str),
    File(&'a str),
}

#[derive(Debug, Clone)]
pub struct CodeRunResult {
    pub output: Value,
    pub success: bool,
    pub error: Option<String>,
    pub stderr: Option<String>,
    pub stacktrace: Option<String>,
    pub timed_out: bool,
}

/// Runs a short user-supplied script in a sandbox. Must be stateless per
/// call (or at least sandboxed); the engine passes no secrets into `env`
/// beyond what the step config sets.
pub trait CodeRunner: Send + Sync {
    fn run_code(
        &self,
        language: CodeLanguage,
        body: CodeBody<'_>,
        inputs: &HashMap<String, Value>,
        timeout_ms: u64,
        env: &HashMap<String, String>,
    ) -> CodeRunResult;
}

/// Stateful post-processor for an AgentFlow step's raw text output.
pub trait OutputParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<Value, String>;
    fn statistics(&self) -> ParserStats;
}
