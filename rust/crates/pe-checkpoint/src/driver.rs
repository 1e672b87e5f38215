//! Resumable driver (§4.F): runs a sample list through the scheduler with
//! checkpointing, crash-resume, and per-sample retry.

use crate::record::CheckpointRecord;
use crate::store::CheckpointStore;
use pe_core::Value;
use pe_dag::PipelineSpec;
use pe_pipeline::{Runners, SampleResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    pub root_dir: String,
    pub auto_resume: bool,
    pub max_retries: u32,
    pub keep_latest_n: usize,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            root_dir: ".pipeline_runs".to_string(),
            auto_resume: true,
            max_retries: 3,
            keep_latest_n: 5,
        }
    }
}

pub struct ResumableDriver {
    store: CheckpointStore,
    pipeline_id: String,
    opts: CheckpointOptions,
}

impl ResumableDriver {
    pub fn new(pipeline_id: impl Into<String>, opts: CheckpointOptions) -> Self {
        Self {
            store: CheckpointStore::new(&opts.root_dir),
            pipeline_id: pipeline_id.into(),
            opts,
        }
    }

    /// Run every sample through the scheduler, checkpointing after each, and
    /// resuming a prior in-flight run when the options allow it.
    #[instrument(skip(self, pipeline, samples, runners))]
    pub fn execute(
        &self,
        pipeline: &PipelineSpec,
        samples: Vec<HashMap<String, Value>>,
        variant: &str,
        runners: Arc<Runners>,
        workers: usize,
    ) -> Vec<SampleResult> {
        let resumed = if self.opts.auto_resume {
            self.store.find_resumable(&self.pipeline_id, variant)
        } else {
            None
        };

        let (mut record, mut results, start_index) = match resumed {
            Some(existing) if existing.matches_samples(&samples) => {
                info!(
                    checkpoint_id = %existing.id,
                    completed = existing.completed_count,
                    "resuming checkpoint"
                );
                let start = existing.completed_results.len();
                let results = existing.completed_results.clone();
                (existing, results, start)
            }
            Some(existing) => {
                warn!(
                    checkpoint_id = %existing.id,
                    "sample set does not match existing checkpoint, starting fresh"
                );
                (CheckpointRecord::new(self.pipeline_id.clone(), variant, &samples), Vec::new(), 0)
            }
            None => (CheckpointRecord::new(self.pipeline_id.clone(), variant, &samples), Vec::new(), 0),
        };

        self.persist(&record);

        let mut fatal = false;
        for (i, sample) in samples.iter().enumerate().skip(start_index) {
            let sample_id = format!("sample_{i}");
            let outcome = self.execute_with_retries(pipeline, sample_id, sample.clone(), variant, &runners, workers);
            match outcome {
                Ok(result) => {
                    record.record_sample(result.clone());
                    results.push(result);
                }
                Err(message) => {
                    warn!(sample_index = i, error = %message, "sample exhausted retries");
                    let failed = SampleResult {
                        sample_id: format!("sample_{i}"),
                        variant: variant.to_string(),
                        step_results: Vec::new(),
                        final_outputs: HashMap::new(),
                        total_time_ms: 0,
                        token_counts: Default::default(),
                        parser_stats: None,
                        error_message: Some(message),
                    };
                    record.record_sample(failed.clone());
                    results.push(failed);
                    fatal = true;
                }
            }
            self.persist(&record);
        }

        record.finish(!fatal);
        self.persist(&record);
        self.store.cleanup_old(&self.pipeline_id, self.opts.keep_latest_n);

        results
    }

    /// Save with best-effort semantics: a failure to persist a checkpoint
    /// is logged and never aborts the run.
    fn persist(&self, record: &CheckpointRecord) {
        if let Err(e) = self.store.save(record) {
            warn!(error = %e, "failed to persist checkpoint");
        }
    }

    /// Attempt `execute_sample` up to `max_retries + 1` times. Only
    /// scheduler-level errors (config, cycle, executor) count as attempts;
    /// per-step failures are already captured inside a successful
    /// `Ok(SampleResult)` and never retried here.
    fn execute_with_retries(
        &self,
        pipeline: &PipelineSpec,
        sample_id: String,
        sample: HashMap<String, Value>,
        variant: &str,
        runners: &Arc<Runners>,
        workers: usize,
    ) -> Result<SampleResult, String> {
        let attempts = self.opts.max_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match pe_pipeline::execute_sample(pipeline, &sample_id, sample.clone(), variant, runners.clone(), workers) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_error = format!("{sample_id} failed (attempt {attempt}/{attempts}): {e}");
                    warn!(sample_id = %sample_id, attempt = attempt, attempts = attempts, error = %e, "scheduler-level failure");
                }
            }
        }
        Err(last_error)
    }
}
