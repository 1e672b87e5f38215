//! Step executor (§4.C): dispatches one step by kind, resolving its inputs
//! from Context and reporting a `StepResult`. Failures are captured as
//! data; this function never panics or raises on a step body's behalf.

use crate::batch::run_batch_agent_flow;
use crate::interfaces::{AgentRunner, CodeBody, CodeRunner, FlowError, OutputParser, TokenCounts};
use crate::result::StepResult;
use pe_core::{Context, Value};
use pe_dag::{AggregationStrategy, StepKind, StepOverride, StepSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

pub struct Runners {
    pub agent: Arc<dyn AgentRunner>,
    pub code: Arc<dyn CodeRunner>,
    pub parser: Option<Arc<dyn OutputParser>>,
}

fn resolve_inputs(step: &StepSpec, context: &Context) -> HashMap<String, Value> {
    step.input_mapping
        .iter()
        .map(|(param, key)| (param.clone(), context.get(key)))
        .collect()
}

/// Layer a step's effective `(flow_name, model_override)`: a named
/// variant's override wins, then the baseline override, then the step's
/// own `agent_flow` field.
fn effective_agent_fields(
    step: &StepSpec,
    baseline_overrides: &HashMap<String, StepOverride>,
    variant_overrides: Option<&HashMap<String, StepOverride>>,
) -> (String, String, Option<String>) {
    let own = step
        .agent_flow
        .as_ref()
        .expect("AgentFlow step missing agent_flow config");

    let variant = variant_overrides.and_then(|m| m.get(&step.id));
    let baseline = baseline_overrides.get(&step.id);

    let flow_name = variant
        .and_then(|o| o.flow_name.clone())
        .or_else(|| baseline.and_then(|o| o.flow_name.clone()))
        .unwrap_or_else(|| own.flow_name.clone());
    let model_override = variant
        .and_then(|o| o.model_override.clone())
        .or_else(|| baseline.and_then(|o| o.model_override.clone()))
        .or_else(|| own.model_override.clone());

    (flow_name, own.agent_id.clone(), model_override)
}

#[instrument(skip(step, context, runners, baseline_overrides, variant_overrides))]
pub fn execute_step(
    step: &StepSpec,
    context: &Context,
    baseline_overrides: &HashMap<String, StepOverride>,
    variant_overrides: Option<&HashMap<String, StepOverride>>,
    runners: &Runners,
) -> StepResult {
    let resolved_inputs = resolve_inputs(step, context);
    let start = Instant::now();

    let mut result = match step.kind {
        StepKind::AgentFlow => execute_agent_flow(
            step,
            &resolved_inputs,
            baseline_overrides,
            variant_overrides,
            runners,
        ),
        StepKind::CodeNode => execute_code_node(step, &resolved_inputs, runners),
        StepKind::BatchAggregator => execute_batch_aggregator(step, &resolved_inputs, runners),
    };
    result.execution_time_ms = start.elapsed().as_millis() as u64;
    result
}

fn execute_agent_flow(
    step: &StepSpec,
    resolved_inputs: &HashMap<String, Value>,
    baseline_overrides: &HashMap<String, StepOverride>,
    variant_overrides: Option<&HashMap<String, StepOverride>>,
    runners: &Runners,
) -> StepResult {
    let (flow_name, agent_id, model_override) =
        effective_agent_fields(step, baseline_overrides, variant_overrides);

    if step.batch_mode {
        let (output, tokens, parser_stats) = run_batch_agent_flow(
            resolved_inputs,
            &flow_name,
            &agent_id,
            model_override.as_deref(),
            step.batch_size,
            step.concurrent_batch,
            step.batch_workers,
            runners.agent.clone(),
            runners.parser.clone(),
        );
        return StepResult {
            step_id: step.id.clone(),
            output_key: step.output_key.clone(),
            output_value: Some(output),
            success: true,
            error_message: None,
            error_kind: None,
            skipped: false,
            execution_time_ms: 0,
            token_counts: tokens,
            parser_stats,
        };
    }

    match runners
        .agent
        .run_flow(&flow_name, resolved_inputs, &agent_id, model_override.as_deref())
    {
        Ok((text, tokens, stats)) => {
            let (value, parser_stats) = match &runners.parser {
                Some(p) => match p.parse(&text) {
                    Ok(v) => (v, stats.or_else(|| Some(p.statistics()))),
                    Err(e) => {
                        return StepResult {
                            step_id: step.id.clone(),
                            output_key: step.output_key.clone(),
                            output_value: None,
                            success: false,
                            error_message: Some(format!("parse error: {e}")),
                            error_kind: Some("ParseError".to_string()),
                            skipped: false,
                            execution_time_ms: 0,
                            token_counts: tokens,
                            parser_stats: stats,
                        }
                    }
                },
                None => (Value::String(text), stats),
            };
            StepResult {
                step_id: step.id.clone(),
                output_key: step.output_key.clone(),
                output_value: Some(value),
                success: true,
                error_message: None,
                error_kind: None,
                skipped: false,
                execution_time_ms: 0,
                token_counts: tokens,
                parser_stats,
            }
        }
        Err(FlowError { kind, message }) => StepResult {
            step_id: step.id.clone(),
            output_key: step.output_key.clone(),
            output_value: None,
            success: false,
            error_message: Some(message),
            error_kind: Some(kind),
            skipped: false,
            execution_time_ms: 0,
            token_counts: TokenCounts::default(),
            parser_stats: None,
        },
    }
}

fn execute_code_node(
    step: &StepSpec,
    resolved_inputs: &HashMap<String, Value>,
    runners: &Runners,
) -> StepResult {
    let cfg = step
        .code_node
        .as_ref()
        .expect("CodeNode step missing code_node config");
    let body = match (&cfg.code, &cfg.code_file) {
        (Some(code), _) => CodeBody::Inline(code),
        (None, Some(file)) => CodeBody::File(file),
        (None, None) => {
            return StepResult {
                step_id: step.id.clone(),
                output_key: step.output_key.clone(),
                output_value: None,
                success: false,
                error_message: Some("code_node has neither code nor code_file set".to_string()),
                error_kind: Some("ConfigError".to_string()),
                skipped: false,
                execution_time_ms: 0,
                token_counts: TokenCounts::default(),
                parser_stats: None,
            }
        }
    };

    let timeout_ms = step.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
    let run = runners
        .code
        .run_code(cfg.language, body, resolved_inputs, timeout_ms, &cfg.env);

    to_step_result_from_code_run(step, run)
}

fn to_step_result_from_code_run(
    step: &StepSpec,
    run: crate::interfaces::CodeRunResult,
) -> StepResult {
    if run.success {
        StepResult {
            step_id: step.id.clone(),
            output_key: step.output_key.clone(),
            output_value: Some(run.output),
            success: true,
            error_message: None,
            error_kind: None,
            skipped: false,
            execution_time_ms: 0,
            token_counts: TokenCounts::default(),
            parser_stats: None,
        }
    } else {
        let error_kind = if run.timed_out {
            "TimeoutError"
        } else {
            "CodeExecutionError"
        };
        StepResult {
            step_id: step.id.clone(),
            output_key: step.output_key.clone(),
            output_value: None,
            success: false,
            error_message: run.error.or(run.stderr).or(Some("code execution failed".to_string())),
            error_kind: Some(error_kind.to_string()),
            skipped: false,
            execution_time_ms: 0,
            token_counts: TokenCounts::default(),
            parser_stats: None,
        }
    }
}

fn execute_batch_aggregator(
    step: &StepSpec,
    resolved_inputs: &HashMap<String, Value>,
    runners: &Runners,
) -> StepResult {
    let Some(items_value) = resolved_inputs.get("items") else {
        return config_error_result(step, "batch_aggregator requires an 'items' input");
    };
    let Some(items) = items_value.as_list() else {
        return config_error_result(step, "batch_aggregator 'items' input must be a list");
    };

    let cfg = step
        .aggregator
        .as_ref()
        .expect("BatchAggregator step missing aggregator config");

    let output = match &cfg.strategy {
        AggregationStrategy::Concat { separator } => {
            let joined = items
                .iter()
                .map(|v| v.to_display_string())
                .collect::<Vec<_>>()
                .join(separator);
            Value::String(joined)
        }
        AggregationStrategy::Stats { fields } => crate::aggregate::compute_stats(items, fields),
        AggregationStrategy::Filter { condition } => crate::aggregate::filter_items(items, condition),
        AggregationStrategy::Group { group_by } => crate::aggregate::group_items(items, group_by),
        AggregationStrategy::Summary { summary_fields } => {
            crate::aggregate::summarize_items(items, summary_fields)
        }
        AggregationStrategy::Custom {
            aggregation_code,
            aggregation_language,
        } => {
            let mut inputs = HashMap::new();
            inputs.insert("items".to_string(), items_value.clone());
            let run = runners.code.run_code(
                *aggregation_language,
                CodeBody::Inline(aggregation_code),
                &inputs,
                DEFAULT_TIMEOUT_MS,
                &HashMap::new(),
            );
            return to_step_result_from_code_run(step, run);
        }
    };

    StepResult {
        step_id: step.id.clone(),
        output_key: step.output_key.clone(),
        output_value: Some(output),
        success: true,
        error_message: None,
        error_kind: None,
        skipped: false,
        execution_time_ms: 0,
        token_counts: TokenCounts::default(),
        parser_stats: None,
    }
}

fn config_error_result(step: &StepSpec, message: &str) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        output_key: step.output_key.clone(),
        output_value: None,
        success: false,
        error_message: Some(message.to_string()),
        error_kind: Some("ConfigError".to_string()),
        skipped: false,
        execution_time_ms: 0,
        token_counts: TokenCounts::default(),
        parser_stats: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{CodeRunResult, ParserStats};
    use pe_dag::{AgentFlowSpec, CodeLanguage};

    struct EchoAgent;
    impl AgentRunner for EchoAgent {
        fn run_flow(
            &self,
            flow_name: &str,
            vars: &HashMap<String, Value>,
            _agent_id: &str,
            _model_override: Option<&str>,
        ) -> Result<(String, TokenCounts, Option<ParserStats>), FlowError> {
            Ok((
                format!("{flow_name}:{}", vars.get("v").map(Value::to_display_string).unwrap_or_default()),
                TokenCounts {
                    input: 1,
                    output: 1,
                    total: 2,
                },
                None,
            ))
        }
    }

    struct FailingAgent;
    impl AgentRunner for FailingAgent {
        fn run_flow(
            &self,
            _flow_name: &str,
            _vars: &HashMap<String, Value>,
            _agent_id: &str,
            _model_override: Option<&str>,
        ) -> Result<(String, TokenCounts, Option<ParserStats>), FlowError> {
            Err(FlowError::new("ValueError", "boom"))
        }
    }

    struct NoopCode;
    impl CodeRunner for NoopCode {
        fn run_code(
            &self,
            _language: CodeLanguage,
            _body: CodeBody<'_>,
            _inputs: &HashMap<String, Value>,
            _timeout_ms: u64,
            _env: &HashMap<String, String>,
        ) -> CodeRunResult {
            CodeRunResult {
                output: Value::Null,
                success: true,
                error: None,
                stderr: None,
                stacktrace: None,
                timed_out: false,
            }
        }
    }

    fn runners(agent: Arc<dyn AgentRunner>) -> Runners {
        Runners {
            agent,
            code: Arc::new(NoopCode),
            parser: None,
        }
    }

    fn agent_step(id: &str, output_key: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            kind: StepKind::AgentFlow,
            input_mapping: [("v".to_string(), "x".to_string())].into_iter().collect(),
            output_key: output_key.to_string(),
            explicit_deps: vec![],
            required: true,
            batch_mode: false,
            batch_size: 10,
            concurrent_batch: true,
            batch_workers: 4,
            concurrent_group: None,
            timeout_ms: None,
            agent_flow: Some(AgentFlowSpec {
                flow_name: "default_flow".to_string(),
                agent_id: "agent1".to_string(),
                model_override: None,
            }),
            code_node: None,
            aggregator: None,
        }
    }

    #[test]
    fn test_agent_flow_success() {
        let step = agent_step("a", "out");
        let mut ctx = Context::new();
        ctx.set("x", Value::from("hello"));
        let result = execute_step(&step, &ctx, &HashMap::new(), None, &runners(Arc::new(EchoAgent)));
        assert!(result.success);
        assert_eq!(
            result.output_value,
            Some(Value::String("default_flow:hello".to_string()))
        );
        assert_eq!(result.token_counts.total, 2);
    }

    #[test]
    fn test_agent_flow_failure_captured_as_data() {
        let step = agent_step("a", "out");
        let ctx = Context::new();
        let result = execute_step(&step, &ctx, &HashMap::new(), None, &runners(Arc::new(FailingAgent)));
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("ValueError"));
        assert_eq!(result.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_variant_override_wins_over_baseline() {
        let step = agent_step("a", "out");
        let mut baseline = HashMap::new();
        baseline.insert(
            "a".to_string(),
            StepOverride {
                flow_name: Some("baseline_flow".to_string()),
                model_override: None,
            },
        );
        let mut variant = HashMap::new();
        variant.insert(
            "a".to_string(),
            StepOverride {
                flow_name: Some("variant_flow".to_string()),
                model_override: None,
            },
        );
        let mut ctx = Context::new();
        ctx.set("x", Value::from("hi"));
        let result = execute_step(&step, &ctx, &baseline, Some(&variant), &runners(Arc::new(EchoAgent)));
        assert_eq!(
            result.output_value,
            Some(Value::String("variant_flow:hi".to_string()))
        );
    }

    #[test]
    fn test_missing_items_is_config_error() {
        let step = StepSpec {
            id: "agg".to_string(),
            kind: StepKind::BatchAggregator,
            input_mapping: HashMap::new(),
            output_key: "out".to_string(),
            explicit_deps: vec![],
            required: true,
            batch_mode: false,
            batch_size: 10,
            concurrent_batch: true,
            batch_workers: 4,
            concurrent_group: None,
            timeout_ms: None,
            agent_flow: None,
            code_node: None,
            aggregator: Some(pe_dag::BatchAggregatorSpec {
                strategy: AggregationStrategy::Concat {
                    separator: ",".to_string(),
                },
            }),
        };
        let ctx = Context::new();
        let result = execute_step(&step, &ctx, &HashMap::new(), None, &runners(Arc::new(EchoAgent)));
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("ConfigError"));
    }
}
