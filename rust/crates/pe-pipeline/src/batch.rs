//! Batch sub-executor (§4.D): fans a batch-mode AgentFlow step over a
//! list-valued input, rejoins per-item outputs, and sums token/parser
//! stats.

use crate::interfaces::{AgentRunner, FlowError, OutputParser, ParserStats, TokenCounts};
use pe_core::Value;
use pe_exec::{Task, TaskFailure};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

struct ItemOutcome {
    output: Value,
    token_counts: TokenCounts,
    parser_stats: Option<ParserStats>,
    error: Option<String>,
}

/// Find the batch axis: the single list-valued entry in resolved inputs,
/// repeated across every other entry. If none is found, the whole input
/// map is treated as a single-item batch.
fn find_batch_axis(resolved_inputs: &HashMap<String, Value>) -> (Option<String>, Vec<Value>) {
    let mut keys: Vec<&String> = resolved_inputs.keys().collect();
    keys.sort();
    for key in keys {
        if let Value::List(items) = &resolved_inputs[key] {
            return (Some(key.clone()), items.clone());
        }
    }
    (None, vec![Value::Map(resolved_inputs.clone())])
}

/// Run a batch-mode AgentFlow step. Returns the per-item outputs (in input
/// order, as a single list-valued step output), the summed token counts,
/// and recombined parser stats.
#[instrument(skip(resolved_inputs, agent, parser))]
pub fn run_batch_agent_flow(
    resolved_inputs: &HashMap<String, Value>,
    flow_name: &str,
    agent_id: &str,
    model_override: Option<&str>,
    batch_size: usize,
    concurrent_batch: bool,
    batch_workers: usize,
    agent: Arc<dyn AgentRunner>,
    parser: Option<Arc<dyn OutputParser>>,
) -> (Value, TokenCounts, Option<ParserStats>) {
    let (batch_key, items) = find_batch_axis(resolved_inputs);
    let n = items.len();
    let chunk_size = batch_size.max(1);
    let workers = if concurrent_batch { batch_workers.max(1) } else { 1 };

    let mut outcomes: Vec<ItemOutcome> = Vec::with_capacity(n);

    let mut chunk_start = 0;
    while chunk_start < n {
        let chunk_end = (chunk_start + chunk_size).min(n);
        let mut tasks: Vec<Task<ItemOutcome>> = Vec::with_capacity(chunk_end - chunk_start);

        for idx in chunk_start..chunk_end {
            let item = items[idx].clone();
            let mut item_inputs = resolved_inputs.clone();
            if let Some(k) = &batch_key {
                item_inputs.insert(k.clone(), item);
            }
            let flow_name = flow_name.to_string();
            let agent_id = agent_id.to_string();
            let model_override = model_override.map(|s| s.to_string());
            let agent = agent.clone();
            let parser = parser.clone();

            tasks.push(Task::new(format!("item-{idx}"), move || {
                let outcome = agent.run_flow(
                    &flow_name,
                    &item_inputs,
                    &agent_id,
                    model_override.as_deref(),
                );
                let result = match outcome {
                    Ok((text, tokens, stats)) => {
                        let (value, parsed_stats) = match &parser {
                            Some(p) => match p.parse(&text) {
                                Ok(v) => (v, stats.or_else(|| Some(p.statistics()))),
                                Err(e) => {
                                    return Ok::<ItemOutcome, TaskFailure>(ItemOutcome {
                                        output: Value::Null,
                                        token_counts: tokens,
                                        parser_stats: stats,
                                        error: Some(format!("parse error: {e}")),
                                    })
                                }
                            },
                            None => (Value::String(text), stats),
                        };
                        ItemOutcome {
                            output: value,
                            token_counts: tokens,
                            parser_stats: parsed_stats,
                            error: None,
                        }
                    }
                    Err(FlowError { message, .. }) => ItemOutcome {
                        output: Value::Null,
                        token_counts: TokenCounts::default(),
                        parser_stats: None,
                        error: Some(message),
                    },
                };
                // Per-item failures never raise; they are carried as data.
                Ok(result)
            }));
        }

        let results = pe_exec::run(tasks, workers, None)
            .expect("batch item tasks carry no dependency configuration");
        for r in results {
            outcomes.push(r.output.expect("batch task bodies never fail"));
        }

        chunk_start = chunk_end;
    }

    let output = Value::List(outcomes.iter().map(|o| o.output.clone()).collect());
    let token_counts: TokenCounts = outcomes.iter().map(|o| o.token_counts).sum();
    let parser_stats = outcomes
        .iter()
        .filter_map(|o| o.parser_stats)
        .reduce(|a, b| a.combined(&b));

    (output, token_counts, parser_stats)
}
