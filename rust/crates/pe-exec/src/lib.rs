//! Bounded concurrent executor.
//!
//! `run` executes a set of independent tasks on a pool of at most `W`
//! workers, returning results in input order. `run_with_deps` additionally
//! honors a `dependencies` field per task, stratifying into waves and
//! propagating required-dependency failures as skips.

mod executor;
mod progress;
mod task;

pub use executor::{run, run_with_deps, ProgressCallback};
pub use progress::{ErrorSummary, ProgressSnapshot};
pub use task::{Task, TaskFailure, TaskResult};
