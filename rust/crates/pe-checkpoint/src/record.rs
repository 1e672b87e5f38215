//! Checkpoint record and sample-content hashing (§4.F).

use chrono::{DateTime, Utc};
use pe_core::CheckpointId;
use pe_core::Value;
use pe_pipeline::SampleResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: CheckpointId,
    pub pipeline_id: String,
    pub variant: String,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub sample_content_hashes: Vec<String>,
    pub completed_results: Vec<SampleResult>,
    pub last_error: Option<String>,
    pub error_count: u32,
}

impl CheckpointRecord {
    pub fn new(pipeline_id: impl Into<String>, variant: impl Into<String>, samples: &[HashMap<String, Value>]) -> Self {
        let now = Utc::now();
        Self {
            id: CheckpointId::new(),
            pipeline_id: pipeline_id.into(),
            variant: variant.into(),
            status: CheckpointStatus::Running,
            created_at: now,
            updated_at: now,
            total: samples.len(),
            completed_count: 0,
            failed_count: 0,
            sample_content_hashes: samples.iter().map(sample_content_hash).collect(),
            completed_results: Vec::new(),
            last_error: None,
            error_count: 0,
        }
    }

    /// Record one sample's outcome and bump `updated_at`.
    pub fn record_sample(&mut self, result: SampleResult) {
        self.updated_at = Utc::now();
        if result.is_successful() {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
            if let Some(msg) = &result.error_message {
                self.last_error = Some(msg.clone());
                self.error_count += 1;
            }
        }
        self.completed_results.push(result);
    }

    pub fn finish(&mut self, success: bool) {
        self.status = if success {
            CheckpointStatus::Completed
        } else {
            CheckpointStatus::Failed
        };
        self.updated_at = Utc::now();
    }

    /// The filename timestamp segment: `YYYYMMDD_HHMMSS_mmm`, matching the
    /// original's `strftime("%Y%m%d_%H%M%S")` with milliseconds appended so
    /// two checkpoints created within the same second don't collide on disk
    /// (see DESIGN.md).
    pub fn timestamp_segment(&self) -> String {
        format!(
            "{}_{:03}",
            self.created_at.format("%Y%m%d_%H%M%S"),
            self.created_at.timestamp_subsec_millis()
        )
    }

    /// Whether `samples`'s content hashes agree pairwise with this
    /// checkpoint's stored hashes (same length, same hash at each index).
    pub fn matches_samples(&self, samples: &[HashMap<String, Value>]) -> bool {
        if samples.len() != self.sample_content_hashes.len() {
            return false;
        }
        samples
            .iter()
            .zip(&self.sample_content_hashes)
            .all(|(s, h)| &sample_content_hash(s) == h)
    }
}

/// Deterministic content hash: sha256 of the sample's canonical (sorted-key)
/// JSON form, hex-encoded. Used only to detect that the caller hasn't
/// silently swapped the test set between runs, never as a security digest.
pub fn sample_content_hash(sample: &HashMap<String, Value>) -> String {
    let mut keys: Vec<&String> = sample.keys().collect();
    keys.sort();
    let ordered: Vec<(&String, &Value)> = keys.into_iter().map(|k| (k, &sample[k])).collect();
    let canonical = serde_json::to_string(&ordered).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fields: &[(&str, &str)]) -> HashMap<String, Value> {
        fields.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = sample(&[("x", "1"), ("y", "2")]);
        let b = sample(&[("y", "2"), ("x", "1")]);
        assert_eq!(sample_content_hash(&a), sample_content_hash(&b));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = sample(&[("x", "1")]);
        let b = sample(&[("x", "2")]);
        assert_ne!(sample_content_hash(&a), sample_content_hash(&b));
    }

    #[test]
    fn test_matches_samples_detects_mismatch() {
        let samples = vec![sample(&[("x", "1")]), sample(&[("x", "2")])];
        let record = CheckpointRecord::new("p1", "baseline", &samples);
        assert!(record.matches_samples(&samples));

        let swapped = vec![sample(&[("x", "9")]), sample(&[("x", "2")])];
        assert!(!record.matches_samples(&swapped));
    }
}
