//! Live progress snapshot and error summary.
//!
//! Snapshots are taken under the executor's single bookkeeping mutex;
//! derived properties below are pure functions of a snapshot, computed
//! without holding any lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub pending: usize,
    pub start_time: Instant,
    pub now: Instant,
}

impl ProgressSnapshot {
    pub fn elapsed(&self) -> Duration {
        self.now.saturating_duration_since(self.start_time)
    }

    /// Fraction of tasks that have left the pending/running state.
    pub fn completion_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed + self.failed + self.skipped) as f64 / self.total as f64
    }

    /// Fraction of settled tasks (completed+failed+skipped) that succeeded.
    pub fn success_rate(&self) -> f64 {
        let settled = self.completed + self.failed + self.skipped;
        if settled == 0 {
            return 1.0;
        }
        self.completed as f64 / settled as f64
    }

    /// Estimated remaining wall time, extrapolated from throughput so far.
    /// `None` until at least one task has settled.
    pub fn eta(&self) -> Option<Duration> {
        let settled = self.completed + self.failed + self.skipped;
        if settled == 0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let rate = settled as f64 / elapsed;
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total.saturating_sub(settled) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }
}

/// Aggregate error accounting across a run of `run`/`run_with_deps`.
#[derive(Debug, Clone, Default)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub failed_task_ids: Vec<String>,
    pub skipped_task_ids: Vec<String>,
    pub error_kind_counts: HashMap<String, usize>,
    /// Failures on tasks that were themselves `required`.
    pub failing_required_task_ids: Vec<String>,
}

impl ErrorSummary {
    pub fn record_failure(&mut self, task_id: &str, error_kind: &str, required: bool) {
        self.total_errors += 1;
        self.failed_task_ids.push(task_id.to_string());
        *self.error_kind_counts.entry(error_kind.to_string()).or_insert(0) += 1;
        if required {
            self.failing_required_task_ids.push(task_id.to_string());
        }
    }

    pub fn record_skipped(&mut self, task_id: &str) {
        self.skipped_task_ids.push(task_id.to_string());
    }

    pub fn has_critical_errors(&self) -> bool {
        !self.failing_required_task_ids.is_empty()
    }
}
