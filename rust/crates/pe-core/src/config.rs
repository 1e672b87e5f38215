//! Configuration for the pipeline engine.
//!
//! Loaded once at construction time and threaded through explicitly, rather
//! than read from module-level globals — the engine has no hidden
//! singletons. Library crates never initialize `tracing-subscriber` or read
//! `EngineConfig` themselves; that belongs to the host binary that links
//! them, which is out of scope here.

use serde::Deserialize;

/// Root configuration for a pipeline engine run.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Directory pipeline runs, checkpoints, and artifacts are rooted under.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// Default worker count for sample-level concurrent execution, when a
    /// pipeline or step does not override it.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Default worker count for batch-mode step execution.
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,

    /// Checkpoint configuration.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Default retry budget for a failed sample under a resumable driver.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// How many checkpoint files to retain per pipeline/variant; older ones
    /// are pruned after a successful completion.
    #[serde(default = "default_keep_latest_n")]
    pub keep_latest_n: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            keep_latest_n: default_keep_latest_n(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_root_dir() -> String {
    ".pipeline_runs".to_string()
}
fn default_max_workers() -> usize {
    4
}
fn default_batch_workers() -> usize {
    4
}
fn default_keep_latest_n() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl EngineConfig {
    /// Load configuration from environment (and an optional `.env` file).
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .set_default("root_dir", default_root_dir())?
            .set_default("max_workers", default_max_workers() as i64)?
            .set_default("batch_workers", default_batch_workers() as i64)?
            .set_default("max_retries", default_max_retries() as i64)?
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_config_default() {
        let cfg = CheckpointConfig::default();
        assert_eq!(cfg.keep_latest_n, 5);
    }

    #[test]
    fn test_log_config_default() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.format, "pretty");
    }
}
