//! Declarative step and pipeline descriptors.
//!
//! `StepSpec`/`PipelineSpec` are immutable once constructed; the "step kind"
//! and "aggregation strategy" are closed sum types with an exhaustive match
//! at the dispatch site, not an open capability interface — the set of
//! kinds is fixed and config-validated up front.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AgentFlow,
    CodeNode,
    BatchAggregator,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::AgentFlow => write!(f, "agent_flow"),
            StepKind::CodeNode => write!(f, "code_node"),
            StepKind::BatchAggregator => write!(f, "batch_aggregator"),
        }
    }
}

/// Scripting language a code-node or custom-aggregation body runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Python,
    Js,
}

/// Fields specific to an `AgentFlow` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFlowSpec {
    pub flow_name: String,
    pub agent_id: String,
    #[serde(default)]
    pub model_override: Option<String>,
}

/// Exactly one of `code` or `code_file` must be set; `timeout_ms` must be
/// greater than zero. Validated by `StepSpec::validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeNodeSpec {
    pub language: CodeLanguage,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_file: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The batch-aggregator's reduction strategy, plus its per-strategy
/// parameters. Kept as one enum rather than a bag of optional fields so the
/// dispatch in the step executor is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AggregationStrategy {
    Concat {
        #[serde(default = "default_separator")]
        separator: String,
    },
    Stats {
        fields: Vec<String>,
    },
    Filter {
        condition: String,
    },
    Group {
        group_by: String,
    },
    Summary {
        summary_fields: Vec<String>,
    },
    Custom {
        aggregation_code: String,
        aggregation_language: CodeLanguage,
    },
}

fn default_separator() -> String {
    "\n".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAggregatorSpec {
    pub strategy: AggregationStrategy,
}

/// Immutable step descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the pipeline.
    pub id: String,
    pub kind: StepKind,

    /// parameter-name -> context-key.
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    /// Where this step's result is written in Context.
    pub output_key: String,
    /// Explicit dependency ids, beyond what `input_mapping` implies.
    #[serde(default)]
    pub explicit_deps: Vec<String>,
    /// Whether the sample aborts if this step fails. Defaults to true.
    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default)]
    pub batch_mode: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrent_batch")]
    pub concurrent_batch: bool,
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,

    #[serde(default)]
    pub concurrent_group: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub agent_flow: Option<AgentFlowSpec>,
    #[serde(default)]
    pub code_node: Option<CodeNodeSpec>,
    #[serde(default)]
    pub aggregator: Option<BatchAggregatorSpec>,
}

fn default_required() -> bool {
    true
}
fn default_batch_size() -> usize {
    10
}
fn default_concurrent_batch() -> bool {
    true
}
fn default_batch_workers() -> usize {
    4
}

/// Errors caught at construction, before the dependency analyzer ever runs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpecError {
    #[error("step '{0}': duplicate id")]
    DuplicateId(String),
    #[error("duplicate output_key '{key}' produced by both '{first}' and '{second}'")]
    DuplicateOutputKey {
        key: String,
        first: String,
        second: String,
    },
    #[error("step '{0}': kind {1} requires its matching *_spec field to be set")]
    MissingKindConfig(String, StepKind),
    #[error("step '{0}': code_node must set exactly one of code or code_file")]
    CodeNodeBodyAmbiguous(String),
    #[error("step '{0}': timeout_ms must be greater than zero")]
    InvalidTimeout(String),
    #[error("step '{0}': batch_size must be at least 1")]
    InvalidBatchSize(String),
    #[error("step '{0}': batch_workers must be at least 1")]
    InvalidBatchWorkers(String),
    #[error("pipeline has no steps")]
    EmptySteps,
    #[error("unknown variant '{0}'")]
    UnknownVariant(String),
}

impl StepSpec {
    fn validate(&self) -> Result<(), SpecError> {
        if let Some(ms) = self.timeout_ms {
            if ms == 0 {
                return Err(SpecError::InvalidTimeout(self.id.clone()));
            }
        }
        if self.batch_size == 0 {
            return Err(SpecError::InvalidBatchSize(self.id.clone()));
        }
        if self.batch_workers == 0 {
            return Err(SpecError::InvalidBatchWorkers(self.id.clone()));
        }
        match self.kind {
            StepKind::AgentFlow => {
                if self.agent_flow.is_none() {
                    return Err(SpecError::MissingKindConfig(self.id.clone(), self.kind));
                }
            }
            StepKind::CodeNode => {
                let Some(code) = &self.code_node else {
                    return Err(SpecError::MissingKindConfig(self.id.clone(), self.kind));
                };
                let has_code = code.code.is_some();
                let has_file = code.code_file.is_some();
                if has_code == has_file {
                    return Err(SpecError::CodeNodeBodyAmbiguous(self.id.clone()));
                }
            }
            StepKind::BatchAggregator => {
                if self.aggregator.is_none() {
                    return Err(SpecError::MissingKindConfig(self.id.clone(), self.kind));
                }
            }
        }
        Ok(())
    }
}

/// Per-step overrides for a named variant: substitute the flow or model a
/// step would otherwise use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOverride {
    #[serde(default)]
    pub flow_name: Option<String>,
    #[serde(default)]
    pub model_override: Option<String>,
}

/// Immutable pipeline descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub declared_inputs: Vec<String>,
    #[serde(default)]
    pub declared_outputs: Vec<String>,
    #[serde(default)]
    pub evaluation_target: Option<String>,
    #[serde(default)]
    pub baseline_overrides: HashMap<String, StepOverride>,
    #[serde(default)]
    pub variant_overrides: HashMap<String, HashMap<String, StepOverride>>,
}

impl PipelineSpec {
    /// Validate construction-time invariants: non-empty, unique ids, unique
    /// output keys, and each step's own `validate`.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.steps.is_empty() {
            return Err(SpecError::EmptySteps);
        }
        let mut seen_ids = HashMap::new();
        let mut seen_outputs: HashMap<&str, &str> = HashMap::new();
        for step in &self.steps {
            if seen_ids.insert(step.id.as_str(), ()).is_some() {
                return Err(SpecError::DuplicateId(step.id.clone()));
            }
            if let Some(first) = seen_outputs.insert(step.output_key.as_str(), step.id.as_str()) {
                return Err(SpecError::DuplicateOutputKey {
                    key: step.output_key.clone(),
                    first: first.to_string(),
                    second: step.id.clone(),
                });
            }
            step.validate()?;
        }
        Ok(())
    }

    /// Resolve the override table for a variant name. `"baseline"` selects
    /// `baseline_overrides`; any other name must be a key of
    /// `variant_overrides`, else `UnknownVariant`.
    pub fn resolve_variant(&self, variant: &str) -> Result<&HashMap<String, StepOverride>, SpecError> {
        if variant == "baseline" {
            Ok(&self.baseline_overrides)
        } else {
            self.variant_overrides
                .get(variant)
                .ok_or_else(|| SpecError::UnknownVariant(variant.to_string()))
        }
    }
}
