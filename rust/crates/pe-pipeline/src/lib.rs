//! Pipeline orchestration: step kinds, batch fan-out, aggregation
//! strategies, and the per-sample scheduler sitting on top of `pe-exec`'s
//! bounded concurrent executor.

mod aggregate;
mod batch;
mod interfaces;
mod result;
mod scheduler;
mod step_executor;

pub use batch::run_batch_agent_flow;
pub use interfaces::{
    AgentRunner, CodeBody, CodeRunResult, CodeRunner, FlowError, OutputParser, ParserStats,
    TokenCounts,
};
pub use result::{SampleResult, StepResult};
pub use scheduler::{execute_sample, execute_sample_sequential};
pub use step_executor::{execute_step, Runners};

#[cfg(test)]
mod tests {
    use super::*;
    use pe_core::Value;
    use pe_dag::{
        AgentFlowSpec, AggregationStrategy, BatchAggregatorSpec, PipelineSpec, StepKind, StepSpec,
    };
    use std::collections::HashMap;
    use std::sync::Arc;

    struct EchoAgent;
    impl AgentRunner for EchoAgent {
        fn run_flow(
            &self,
            flow_name: &str,
            vars: &HashMap<String, Value>,
            _agent_id: &str,
            _model_override: Option<&str>,
        ) -> Result<(String, TokenCounts, Option<ParserStats>), FlowError> {
            let v = vars.get("in").map(Value::to_display_string).unwrap_or_default();
            Ok((
                format!("{flow_name}:{v}"),
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
            Err(FlowError::new("ValueError", "agent exploded"))
        }
    }

    struct NoopCode;
    impl CodeRunner for NoopCode {
        fn run_code(
            &self,
            _language: pe_dag::CodeLanguage,
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

    fn runners(agent: Arc<dyn AgentRunner>) -> Arc<Runners> {
        Arc::new(Runners {
            agent,
            code: Arc::new(NoopCode),
            parser: None,
        })
    }

    fn agent_step(
        id: &str,
        output_key: &str,
        input_mapping: HashMap<String, String>,
        required: bool,
    ) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            kind: StepKind::AgentFlow,
            input_mapping,
            output_key: output_key.to_string(),
            explicit_deps: vec![],
            required,
            batch_mode: false,
            batch_size: 10,
            concurrent_batch: true,
            batch_workers: 4,
            concurrent_group: None,
            timeout_ms: None,
            agent_flow: Some(AgentFlowSpec {
                flow_name: format!("flow_{id}"),
                agent_id: "agent1".to_string(),
                model_override: None,
            }),
            code_node: None,
            aggregator: None,
        }
    }

    fn pipeline(steps: Vec<StepSpec>, declared_outputs: Vec<String>) -> PipelineSpec {
        PipelineSpec {
            steps,
            declared_inputs: vec![],
            declared_outputs,
            evaluation_target: None,
            baseline_overrides: HashMap::new(),
            variant_overrides: HashMap::new(),
        }
    }

    fn sample(fields: &[(&str, &str)]) -> HashMap<String, Value> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_linear_chain_propagates_outputs() {
        let steps = vec![
            agent_step("a", "out_a", [("in".to_string(), "seed".to_string())].into(), true),
            agent_step("b", "out_b", [("in".to_string(), "out_a".to_string())].into(), true),
        ];
        let spec = pipeline(steps, vec!["out_b".to_string()]);
        let result = execute_sample(
            &spec,
            "s1",
            sample(&[("seed", "v0")]),
            "baseline",
            runners(Arc::new(EchoAgent)),
            2,
        )
        .unwrap();

        assert!(result.is_successful());
        assert_eq!(
            result.final_outputs["out_b"],
            Value::String("flow_b:flow_a:v0".to_string())
        );
        assert_eq!(result.token_counts.total, 4);
    }

    #[test]
    fn test_diamond_waves_both_branches_run() {
        let steps = vec![
            agent_step("root", "out_root", [("in".to_string(), "seed".to_string())].into(), true),
            agent_step("left", "out_left", [("in".to_string(), "out_root".to_string())].into(), true),
            agent_step("right", "out_right", [("in".to_string(), "out_root".to_string())].into(), true),
            agent_step(
                "join",
                "out_join",
                [("in".to_string(), "out_left".to_string())].into(),
                true,
            ),
        ];
        let spec = pipeline(steps, vec!["out_join".to_string(), "out_right".to_string()]);
        let result = execute_sample(
            &spec,
            "s1",
            sample(&[("seed", "v0")]),
            "baseline",
            runners(Arc::new(EchoAgent)),
            4,
        )
        .unwrap();

        assert!(result.is_successful());
        assert_eq!(result.get_successful_steps().len(), 4);
    }

    #[test]
    fn test_optional_failure_does_not_stop_sample() {
        struct Flaky;
        impl AgentRunner for Flaky {
            fn run_flow(
                &self,
                flow_name: &str,
                vars: &HashMap<String, Value>,
                _agent_id: &str,
                _model_override: Option<&str>,
            ) -> Result<(String, TokenCounts, Option<ParserStats>), FlowError> {
                if flow_name == "flow_opt" {
                    return Err(FlowError::new("ValueError", "optional step broke"));
                }
                let v = vars.get("in").map(Value::to_display_string).unwrap_or_default();
                Ok((format!("{flow_name}:{v}"), TokenCounts::default(), None))
            }
        }

        let steps = vec![
            agent_step("seedstep", "out_seed", [("in".to_string(), "seed".to_string())].into(), true),
            agent_step("opt", "out_opt", [("in".to_string(), "out_seed".to_string())].into(), false),
            agent_step("tail", "out_tail", [("in".to_string(), "out_seed".to_string())].into(), true),
        ];
        let spec = pipeline(steps, vec!["out_tail".to_string()]);
        let result = execute_sample(
            &spec,
            "s1",
            sample(&[("seed", "v0")]),
            "baseline",
            runners(Arc::new(Flaky)),
            4,
        )
        .unwrap();

        assert!(result.is_successful());
        assert_eq!(result.get_failed_steps().len(), 1);
        assert_eq!(result.get_failed_steps()[0].step_id, "opt");
    }

    #[test]
    fn test_required_failure_stops_sample_and_skips_dependents() {
        let steps = vec![
            agent_step("seedstep", "out_seed", [("in".to_string(), "seed".to_string())].into(), true),
            agent_step("fails", "out_fails", [("in".to_string(), "out_seed".to_string())].into(), true),
            agent_step("never", "out_never", [("in".to_string(), "out_fails".to_string())].into(), true),
        ];
        let spec = pipeline(steps, vec!["out_never".to_string()]);
        let result = execute_sample(
            &spec,
            "s1",
            sample(&[("seed", "v0")]),
            "baseline",
            runners(Arc::new(FailingAgent)),
            4,
        )
        .unwrap();

        assert!(!result.is_successful());
        let never = result
            .step_results
            .iter()
            .find(|s| s.step_id == "never")
            .unwrap();
        assert!(never.skipped);
    }

    #[test]
    fn test_batch_aggregator_step_runs_after_batch_producer() {
        let mut batch_step = agent_step(
            "batch",
            "out_batch",
            [("in".to_string(), "seed".to_string())].into(),
            true,
        );
        batch_step.batch_mode = true;

        let agg_step = StepSpec {
            id: "agg".to_string(),
            kind: StepKind::BatchAggregator,
            input_mapping: [("items".to_string(), "out_batch".to_string())].into(),
            output_key: "out_agg".to_string(),
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
            aggregator: Some(BatchAggregatorSpec {
                strategy: AggregationStrategy::Concat {
                    separator: ",".to_string(),
                },
            }),
        };

        let spec = pipeline(vec![batch_step, agg_step], vec!["out_agg".to_string()]);
        let mut seed = HashMap::new();
        seed.insert(
            "seed".to_string(),
            Value::List(vec!["x".into(), "y".into()]),
        );
        let result = execute_sample(&spec, "s1", seed, "baseline", runners(Arc::new(EchoAgent)), 4).unwrap();

        assert!(result.is_successful());
        assert!(result.final_outputs["out_agg"].as_str().unwrap().contains("flow_batch"));
    }

    #[test]
    fn test_sequential_matches_concurrent_outcome() {
        let steps = vec![
            agent_step("a", "out_a", [("in".to_string(), "seed".to_string())].into(), true),
            agent_step("b", "out_b", [("in".to_string(), "out_a".to_string())].into(), true),
        ];
        let spec = pipeline(steps, vec!["out_b".to_string()]);
        let seq = execute_sample_sequential(
            &spec,
            "s1",
            sample(&[("seed", "v0")]),
            "baseline",
            runners(Arc::new(EchoAgent)),
        )
        .unwrap();
        let conc = execute_sample(
            &spec,
            "s1",
            sample(&[("seed", "v0")]),
            "baseline",
            runners(Arc::new(EchoAgent)),
            2,
        )
        .unwrap();

        assert_eq!(seq.final_outputs["out_b"], conc.final_outputs["out_b"]);
    }

    #[test]
    fn test_unknown_variant_is_config_error() {
        let steps = vec![agent_step("a", "out_a", HashMap::new(), true)];
        let spec = pipeline(steps, vec!["out_a".to_string()]);
        let err = execute_sample(
            &spec,
            "s1",
            HashMap::new(),
            "nightly",
            runners(Arc::new(EchoAgent)),
            2,
        )
        .unwrap_err();
        assert!(matches!(err, pe_core::EngineError::Config(_)));
    }
}
