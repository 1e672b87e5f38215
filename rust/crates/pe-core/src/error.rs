//! Error types for the pipeline engine.
//!
//! Most step-level failures are carried as *data* (an `error_kind: String`
//! field on `StepResult`, mirroring the original Python's
//! `error_type = type(e).__name__` capture) rather than as Rust error types,
//! since they need to be recorded and continue the run rather than unwind it.
//! `EngineError` covers the handful of kinds that are genuinely fatal to the
//! component raising them: a bad config, a cyclic dependency graph, or an
//! executor that cannot make progress.

/// Result type alias using the engine's error type.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("executor error: {0}")]
    Executor(String),
}
