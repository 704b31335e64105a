//! Batch coordination
//!
//! Fans jobs out to a [`JobRunner`] under a semaphore and collects exactly
//! one outcome per job, in input order.

use crate::job::{ComparisonJob, FailureKind, JobFailure, JobOutcome, JobRunner, JobState};
use crate::progress::SharedProgress;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Aggregate result of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// One outcome per input job, in input order
    pub outcomes: Vec<JobOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
    pub concurrency_limit: usize,
}

impl BatchResult {
    fn from_outcomes(outcomes: Vec<JobOutcome>, elapsed_secs: f64, concurrency_limit: usize) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            failed: outcomes.len() - succeeded,
            succeeded,
            outcomes,
            elapsed_secs,
            concurrency_limit,
        }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Runs many jobs with bounded concurrency
pub struct BatchCoordinator {
    runner: Arc<JobRunner>,
}

impl BatchCoordinator {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    pub fn progress(&self) -> SharedProgress {
        self.runner.progress()
    }

    /// Run every job, at most `concurrency_limit` at a time (0 is treated as 1).
    ///
    /// Cancelling `cancel` kills in-flight tools; jobs that have not started
    /// yet are reported as cancelled. Dropping the returned future cancels
    /// the batch the same way. The progress snapshot is reset on entry.
    pub async fn run_batch(
        &self,
        jobs: Vec<ComparisonJob>,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let started = Instant::now();
        let limit = concurrency_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        // Tasks watch a child token that also fires if this future is dropped,
        // so detached tasks never keep tools running.
        let batch_cancel = cancel.child_token();
        let _drop_guard = batch_cancel.clone().drop_guard();

        tracing::info!(jobs = jobs.len(), concurrency = limit, "starting batch");
        self.runner.progress().write().await.reset();
        let mut ids = HashSet::new();
        for job in &jobs {
            if !ids.insert(job.id.as_str()) {
                tracing::warn!(job_id = %job.id, "duplicate job id, progress entries will be merged");
            }
            self.runner.mark_pending(job).await;
        }

        let handles: Vec<_> = jobs
            .iter()
            .cloned()
            .map(|job| {
                let runner = self.runner.clone();
                let semaphore = semaphore.clone();
                let cancel = batch_cancel.clone();
                tokio::spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let _permit = match permit {
                        Some(permit) if !cancel.is_cancelled() => permit,
                        _ => {
                            let outcome = JobOutcome::Failed(JobFailure::cancelled_before_start(&job.id));
                            runner.publish(&job, &outcome).await;
                            return outcome;
                        }
                    };
                    runner.run(&job, &cancel).await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (job, handle) in jobs.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let reason = panic_message(join_err);
                    let stage = self
                        .runner
                        .last_stage(&job.id)
                        .await
                        .unwrap_or(JobState::Pending);
                    let outcome = JobOutcome::Failed(JobFailure::new(
                        &job.id,
                        FailureKind::Internal,
                        stage,
                        format!("job task aborted: {reason}"),
                        false,
                    ));
                    self.runner.publish(job, &outcome).await;
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        let result = BatchResult::from_outcomes(outcomes, started.elapsed().as_secs_f64(), limit);
        tracing::info!(
            total = result.total(),
            succeeded = result.succeeded,
            failed = result.failed,
            elapsed = result.elapsed_secs,
            "batch complete"
        );
        result
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
