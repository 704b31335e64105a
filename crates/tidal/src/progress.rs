//! Batch progress snapshot
//!
//! A shared, serializable view of where every job in the current batch is.
//! Job runners publish stage transitions; the CLI reads it to log progress.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job progress entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub id: String,
    pub reference: String,
    pub processed: String,
    /// Current stage name (`pending`, `probing`, ..., `succeeded`, `failed`)
    pub stage: String,
    pub vmaf_mean: Option<f64>,
    pub failure: Option<String>,
}

impl JobProgress {
    pub fn is_running(&self) -> bool {
        matches!(self.stage.as_str(), "probing" | "reconciling" | "scoring")
    }
}

/// Snapshot of the whole batch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobProgress>,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub succeeded_jobs: usize,
    pub failed_jobs: usize,
}

impl ProgressSnapshot {
    /// Insert or replace the entry for `job.id` and refresh the counters.
    pub fn upsert(&mut self, job: JobProgress) {
        if let Some(existing) = self.jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job;
        } else {
            self.jobs.push(job);
        }
        self.recount();
    }

    /// Move an existing job to `stage`. Unknown ids are ignored.
    pub fn set_stage(&mut self, id: &str, stage: &str) {
        if let Some(existing) = self.jobs.iter_mut().find(|j| j.id == id) {
            existing.stage = stage.to_string();
            self.recount();
        }
    }

    fn recount(&mut self) {
        self.pending_jobs = self.jobs.iter().filter(|j| j.stage == "pending").count();
        self.running_jobs = self.jobs.iter().filter(|j| j.is_running()).count();
        self.succeeded_jobs = self.jobs.iter().filter(|j| j.stage == "succeeded").count();
        self.failed_jobs = self.jobs.iter().filter(|j| j.stage == "failed").count();
        self.timestamp_unix_ms = timestamp_ms();
    }

    /// Forget every job, ready for a new batch.
    pub fn reset(&mut self) {
        self.jobs.clear();
        self.recount();
    }

    pub fn finished_jobs(&self) -> usize {
        self.succeeded_jobs + self.failed_jobs
    }
}

/// Shared progress state for concurrent access across job runners
pub type SharedProgress = Arc<RwLock<ProgressSnapshot>>;

/// Creates a new SharedProgress instance with no jobs
pub fn new_shared_progress() -> SharedProgress {
    Arc::new(RwLock::new(ProgressSnapshot::default()))
}

/// Get current timestamp in milliseconds
fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
