//! Crash-recoverable pipeline runs (§4.F): checkpoint records, on-disk
//! persistence, and the resumable driver that wraps `pe_pipeline::execute_sample`
//! with checkpointing and retry.

mod driver;
mod record;
mod store;

pub use driver::{CheckpointOptions, ResumableDriver};
pub use record::{sample_content_hash, CheckpointRecord, CheckpointStatus};
pub use store::{CheckpointStore, StoreError};
