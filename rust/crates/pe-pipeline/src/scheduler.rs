//! Pipeline scheduler (§4.E): for one sample, analyze → wave-loop →
//! per-wave parallel dispatch via the bounded executor → propagate outputs
//! into Context → enforce required/optional → collect results.

use crate::result::{SampleResult, StepResult};
use crate::step_executor::{execute_step, Runners};
use pe_core::{Context, EngineError, Value};
use pe_dag::{Graph, PipelineSpec, StepOverride, StepSpec};
use pe_exec::Task;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Whether a step's live dependencies have already failed in a way that
/// forces it to be skipped before it's ever submitted.
fn blocked_by_failed_required_dependency(
    step_id: &str,
    graph: &Graph,
    required_of: &HashMap<String, bool>,
    settled: &HashMap<String, StepResult>,
) -> bool {
    graph.dependencies_of(step_id).iter().any(|dep| {
        settled
            .get(dep)
            .map(|r| !r.success && required_of.get(dep).copied().unwrap_or(true))
            .unwrap_or(false)
    })
}

fn resolve_override_tables<'a>(
    pipeline: &'a PipelineSpec,
    variant: &str,
) -> Result<(&'a HashMap<String, StepOverride>, Option<&'a HashMap<String, StepOverride>>), EngineError> {
    pipeline
        .resolve_variant(variant)
        .map_err(|e| EngineError::Config(e.to_string()))?;
    let baseline = &pipeline.baseline_overrides;
    let variant_table = if variant == "baseline" {
        None
    } else {
        pipeline.variant_overrides.get(variant)
    };
    Ok((baseline, variant_table))
}

/// Run one step and produce its `StepResult`, timing the dispatch body.
fn run_step_task(
    step: StepSpec,
    context_snapshot: Context,
    baseline: HashMap<String, StepOverride>,
    variant_table: Option<HashMap<String, StepOverride>>,
    runners: std::sync::Arc<Runners>,
) -> StepResult {
    execute_step(
        &step,
        &context_snapshot,
        &baseline,
        variant_table.as_ref(),
        &runners,
    )
}

/// `execute_sample(pipeline, sample, variant) -> SampleResult`, wave-based.
#[instrument(skip(pipeline, sample_fields, runners))]
pub fn execute_sample(
    pipeline: &PipelineSpec,
    sample_id: &str,
    sample_fields: HashMap<String, Value>,
    variant: &str,
    runners: std::sync::Arc<Runners>,
    workers: usize,
) -> Result<SampleResult, EngineError> {
    let start = Instant::now();
    let (baseline, variant_table) = resolve_override_tables(pipeline, variant)?;

    let graph = pe_dag::analyze(&pipeline.steps)?;
    let waves = pe_dag::waves(&graph);
    let required_of: HashMap<String, bool> = pipeline
        .steps
        .iter()
        .map(|s| (s.id.clone(), s.required))
        .collect();
    let steps_by_id: HashMap<String, &StepSpec> =
        pipeline.steps.iter().map(|s| (s.id.clone(), s)).collect();

    let mut context = Context::from_sample(sample_fields);
    let mut settled: HashMap<String, StepResult> = HashMap::new();
    let mut sample_error: Option<String> = None;

    'waves: for wave in &waves {
        let mut to_run: Vec<&StepSpec> = Vec::new();

        for step_id in wave {
            let step = steps_by_id[step_id];
            if blocked_by_failed_required_dependency(step_id, &graph, &required_of, &settled) {
                let result = StepResult::dependency_skip(step_id.clone(), step.output_key.clone());
                warn!(step_id = %step_id, "skipped: required dependency failed");
                settled.insert(step_id.clone(), result);
            } else {
                to_run.push(step);
            }
        }

        if to_run.is_empty() {
            continue;
        }

        let tasks: Vec<Task<StepResult>> = to_run
            .iter()
            .map(|step| {
                let step_owned = (*step).clone();
                let ctx_snapshot = context.clone();
                let baseline_owned = baseline.clone();
                let variant_owned = variant_table.cloned();
                let runners = runners.clone();
                let required = step.required;
                Task::new(step.id.clone(), move || {
                    Ok::<StepResult, pe_exec::TaskFailure>(run_step_task(
                        step_owned,
                        ctx_snapshot,
                        baseline_owned,
                        variant_owned,
                        runners,
                    ))
                })
                .required(required)
            })
            .collect();

        info!(wave_size = tasks.len(), "dispatching wave");
        let results = pe_exec::run(tasks, workers.max(1), None)?;

        for task_result in results {
            let step_result = task_result.output.expect("step tasks never fail the body");
            if step_result.success {
                if let Some(v) = &step_result.output_value {
                    context.set(step_result.output_key.clone(), v.clone());
                }
            }
            let required = required_of.get(&step_result.step_id).copied().unwrap_or(true);
            let failed_required = required && !step_result.success && !step_result.skipped;
            if failed_required {
                sample_error = Some(format!(
                    "required step '{}' failed: {}",
                    step_result.step_id,
                    step_result.error_message.as_deref().unwrap_or("unknown error")
                ));
            }
            settled.insert(step_result.step_id.clone(), step_result);
            if sample_error.is_some() {
                break 'waves;
            }
        }
    }

    // Reconstruct the ordered StepResult list over every declared step;
    // steps that never ran (because a fatal required failure stopped the
    // wave loop early) appear as "not reached".
    let step_results: Vec<StepResult> = pipeline
        .steps
        .iter()
        .map(|s| {
            settled
                .remove(&s.id)
                .unwrap_or_else(|| StepResult::not_reached(s.id.clone(), s.output_key.clone()))
        })
        .collect();

    let final_outputs = context.project(&pipeline.declared_outputs);
    let token_counts = step_results
        .iter()
        .filter(|s| s.success)
        .map(|s| s.token_counts)
        .sum();
    let parser_stats = step_results
        .iter()
        .filter(|s| s.success)
        .filter_map(|s| s.parser_stats)
        .reduce(|a, b| a.combined(&b));

    Ok(SampleResult {
        sample_id: sample_id.to_string(),
        variant: variant.to_string(),
        step_results,
        final_outputs,
        total_time_ms: start.elapsed().as_millis() as u64,
        token_counts,
        parser_stats,
        error_message: sample_error,
    })
}

/// Sequential fallback: same semantics as `execute_sample`, but steps run
/// one at a time in topological order instead of wave-parallel. Must be
/// observably identical except for timing and interleaving.
#[instrument(skip(pipeline, sample_fields, runners))]
pub fn execute_sample_sequential(
    pipeline: &PipelineSpec,
    sample_id: &str,
    sample_fields: HashMap<String, Value>,
    variant: &str,
    runners: std::sync::Arc<Runners>,
) -> Result<SampleResult, EngineError> {
    let start = Instant::now();
    let (baseline, variant_table) = resolve_override_tables(pipeline, variant)?;

    let graph = pe_dag::analyze(&pipeline.steps)?;
    let order = pe_dag::topo_sort(&graph);
    let required_of: HashMap<String, bool> = pipeline
        .steps
        .iter()
        .map(|s| (s.id.clone(), s.required))
        .collect();
    let steps_by_id: HashMap<String, &StepSpec> =
        pipeline.steps.iter().map(|s| (s.id.clone(), s)).collect();

    let mut context = Context::from_sample(sample_fields);
    let mut settled: HashMap<String, StepResult> = HashMap::new();
    let mut sample_error: Option<String> = None;

    for step_id in &order {
        if sample_error.is_some() {
            break;
        }
        let step = steps_by_id[step_id];
        if blocked_by_failed_required_dependency(step_id, &graph, &required_of, &settled) {
            settled.insert(
                step_id.clone(),
                StepResult::dependency_skip(step_id.clone(), step.output_key.clone()),
            );
            continue;
        }

        let result = execute_step(step, &context, &baseline, variant_table, &runners);
        if result.success {
            if let Some(v) = &result.output_value {
                context.set(result.output_key.clone(), v.clone());
            }
        }
        let required = required_of.get(step_id).copied().unwrap_or(true);
        if required && !result.success && !result.skipped {
            sample_error = Some(format!(
                "required step '{}' failed: {}",
                step_id,
                result.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
        settled.insert(step_id.clone(), result);
    }

    let step_results: Vec<StepResult> = pipeline
        .steps
        .iter()
        .map(|s| {
            settled
                .remove(&s.id)
                .unwrap_or_else(|| StepResult::not_reached(s.id.clone(), s.output_key.clone()))
        })
        .collect();

    let final_outputs = context.project(&pipeline.declared_outputs);
    let token_counts = step_results
        .iter()
        .filter(|s| s.success)
        .map(|s| s.token_counts)
        .sum();
    let parser_stats = step_results
        .iter()
        .filter(|s| s.success)
        .filter_map(|s| s.parser_stats)
        .reduce(|a, b| a.combined(&b));

    Ok(SampleResult {
        sample_id: sample_id.to_string(),
        variant: variant.to_string(),
        step_results,
        final_outputs,
        total_time_ms: start.elapsed().as_millis() as u64,
        token_counts,
        parser_stats,
        error_message: sample_error,
    })
}
