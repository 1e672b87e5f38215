//! On-disk checkpoint persistence: one JSON file per run under
//! `<root_dir>/runs/checkpoints/`. Access is serialized by the resumable
//! driver (single writer); this module itself is not thread-safe.

use crate::record::{CheckpointRecord, CheckpointStatus};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create checkpoint directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to read checkpoint file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct CheckpointStore {
    checkpoint_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            checkpoint_dir: root_dir.as_ref().join("runs").join("checkpoints"),
        }
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.checkpoint_dir)
            .map_err(|e| StoreError::CreateDir(self.checkpoint_dir.clone(), e))
    }

    fn file_path(&self, pipeline_id: &str, variant: &str, timestamp_segment: &str) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{pipeline_id}_{variant}_{timestamp_segment}.json"))
    }

    /// Save (overwrite) a checkpoint's current state. Write failures are
    /// logged and swallowed: checkpoint I/O is best-effort, never a reason
    /// to abort the run.
    pub fn save(&self, record: &CheckpointRecord) -> Result<(), StoreError> {
        self.ensure_dir()?;
        let path = self.file_path(&record.pipeline_id, &record.variant, &record.timestamp_segment());
        let body = serde_json::to_string_pretty(record)?;
        if let Err(e) = fs::write(&path, body) {
            warn!(path = %path.display(), error = %e, "failed to persist checkpoint, continuing");
        }
        Ok(())
    }

    /// Files directly under the checkpoint dir whose name starts with
    /// `prefix` and ends in `.json`, newest modified-time first.
    fn matching_files_by_mtime(&self, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.checkpoint_dir) else {
            return Vec::new();
        };
        let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .filter_map(|p| {
                let mtime = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                Some((p, mtime))
            })
            .collect();
        files.sort_by(|a, b| b.1.cmp(&a.1));
        files.into_iter().map(|(p, _)| p).collect()
    }

    /// The most recently written `Running` checkpoint for `(pipeline, variant)`,
    /// if any.
    pub fn find_resumable(&self, pipeline_id: &str, variant: &str) -> Option<CheckpointRecord> {
        let prefix = format!("{pipeline_id}_{variant}_");
        for path in self.matching_files_by_mtime(&prefix) {
            match load_file(&path) {
                Ok(record) if record.status == CheckpointStatus::Running => return Some(record),
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read checkpoint, skipping");
                }
            }
        }
        None
    }

    /// Delete all but the `keep_latest_n` most recently written checkpoint
    /// files for a pipeline (across all variants).
    pub fn cleanup_old(&self, pipeline_id: &str, keep_latest_n: usize) {
        let prefix = format!("{pipeline_id}_");
        for stale in self.matching_files_by_mtime(&prefix).into_iter().skip(keep_latest_n) {
            if let Err(e) = fs::remove_file(&stale) {
                warn!(path = %stale.display(), error = %e, "failed to remove stale checkpoint");
            }
        }
    }
}

fn load_file(path: &Path) -> Result<CheckpointRecord, StoreError> {
    let body = fs::read_to_string(path).map_err(|e| StoreError::Read(path.to_path_buf(), e))?;
    Ok(serde_json::from_str(&body)?)
}
