//! Job runner
//!
//! Takes one (reference, processed) pair through probe, reconcile and score,
//! and turns every failure along the way into a [`JobFailure`]. `run` never
//! returns an error: the outcome is the result.

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::probe::{MediaDescriptor, MediaProber, ProbeError};
use crate::progress::{JobProgress, SharedProgress};
use crate::reconcile::{reconcile, TargetOverride, Tolerances};
use crate::score::{QualityReport, QualityScorer, ScoreError, ScoreOptions};
use crate::tool::{ToolError, ToolRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One comparison to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonJob {
    pub id: String,
    pub reference: PathBuf,
    pub processed: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetOverride>,
    /// Whole-job budget in seconds, fractions allowed; the runner default
    /// applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl ComparisonJob {
    pub fn new(id: impl Into<String>, reference: impl Into<PathBuf>, processed: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            reference: reference.into(),
            processed: processed.into(),
            target: None,
            timeout_secs: None,
        }
    }

    pub fn with_target(mut self, target: TargetOverride) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// The job's own budget, when it carries a usable one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    fn progress_entry(&self, state: JobState) -> JobProgress {
        JobProgress {
            id: self.id.clone(),
            reference: self.reference.to_string_lossy().to_string(),
            processed: self.processed.to_string_lossy().to_string(),
            stage: state.as_str().to_string(),
            vmaf_mean: None,
            failure: None,
        }
    }
}

/// Job state representing the current stage in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Probing,
    Reconciling,
    Scoring,
    Succeeded,
    Failed,
}

impl JobState {
    /// Convert state to string for progress reporting
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Probing => "probing",
            JobState::Reconciling => "reconciling",
            JobState::Scoring => "scoring",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    /// Inverse of [`JobState::as_str`]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(JobState::Pending),
            "probing" => Some(JobState::Probing),
            "reconciling" => Some(JobState::Reconciling),
            "scoring" => Some(JobState::Scoring),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Probe,
    IncompatibleMedia,
    ScoreParse,
    Timeout,
    ToolInvocation,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Probe => "probe",
            FailureKind::IncompatibleMedia => "incompatible_media",
            FailureKind::ScoreParse => "score_parse",
            FailureKind::Timeout => "timeout",
            FailureKind::ToolInvocation => "tool_invocation",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: String,
    pub kind: FailureKind,
    /// Stage the job was in when it failed
    pub stage: JobState,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_media: Option<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_media: Option<MediaDescriptor>,
}

impl JobFailure {
    /// Build a failure; the message gets a transient/permanent suffix.
    pub fn new(
        job_id: impl Into<String>,
        kind: FailureKind,
        stage: JobState,
        message: impl fmt::Display,
        retryable: bool,
    ) -> Self {
        let suffix = if retryable {
            "transient, may succeed on retry"
        } else {
            "permanent"
        };
        Self {
            job_id: job_id.into(),
            kind,
            stage,
            message: format!("{message} ({suffix})"),
            retryable,
            reference_media: None,
            processed_media: None,
        }
    }

    fn with_media(
        mut self,
        reference: Option<MediaDescriptor>,
        processed: Option<MediaDescriptor>,
    ) -> Self {
        self.reference_media = reference;
        self.processed_media = processed;
        self
    }

    /// Outcome for a job the batch never started because it was cancelled.
    pub fn cancelled_before_start(job_id: impl Into<String>) -> Self {
        Self::new(
            job_id,
            FailureKind::Cancelled,
            JobState::Pending,
            "batch cancelled before the job started",
            true,
        )
    }
}

/// Final result of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(QualityReport),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutcome::Succeeded(report) => &report.job_id,
            JobOutcome::Failed(failure) => &failure.job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded(_))
    }

    pub fn report(&self) -> Option<&QualityReport> {
        match self {
            JobOutcome::Succeeded(report) => Some(report),
            JobOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            JobOutcome::Succeeded(_) => None,
            JobOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// Map a tool error to (kind, retryable) when the tool itself is at fault.
fn classify_tool(err: &ToolError, nonzero_exit: FailureKind) -> (FailureKind, bool) {
    let kind = match err {
        ToolError::TimedOut { .. } => FailureKind::Timeout,
        ToolError::Cancelled { .. } => FailureKind::Cancelled,
        ToolError::Exited { .. } => nonzero_exit,
        ToolError::Signaled { .. } | ToolError::Spawn { .. } | ToolError::Io { .. } => {
            FailureKind::ToolInvocation
        }
    };
    (kind, err.is_transient())
}

fn classify_probe(err: &ProbeError) -> (FailureKind, bool) {
    match err {
        ProbeError::Tool(tool) => classify_tool(tool, FailureKind::Probe),
        _ => (FailureKind::Probe, false),
    }
}

fn classify_score(err: &ScoreError) -> (FailureKind, bool) {
    match err {
        ScoreError::Tool(tool) => classify_tool(tool, FailureKind::ToolInvocation),
        ScoreError::Parse(_) => (FailureKind::ScoreParse, false),
        ScoreError::Scratch { .. } => (FailureKind::Internal, false),
    }
}

/// Timeouts applied by the runner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerTimeouts {
    /// Upper bound for a single ffprobe call
    pub probe: Duration,
    /// Whole-job budget unless the job sets its own
    pub job: Duration,
}

impl RunnerTimeouts {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            probe: Duration::from_secs(cfg.batch.probe_timeout_secs),
            job: Duration::from_secs(cfg.batch.job_timeout_secs),
        }
    }
}

/// Runs single comparison jobs end to end
pub struct JobRunner {
    prober: MediaProber,
    scorer: QualityScorer,
    tolerances: Tolerances,
    timeouts: RunnerTimeouts,
    progress: SharedProgress,
}

impl JobRunner {
    /// Wire a runner from configuration; all tools go through `tools`.
    pub fn new(
        tools: Arc<dyn ToolRunner>,
        cfg: &Config,
        plan: &ConcurrencyPlan,
        progress: SharedProgress,
    ) -> Self {
        Self {
            prober: MediaProber::new(tools.clone(), &cfg.tools.ffprobe),
            scorer: QualityScorer::new(tools, &cfg.tools.ffmpeg, ScoreOptions::from_config(cfg, plan)),
            tolerances: Tolerances::from_config(&cfg.reconcile),
            timeouts: RunnerTimeouts::from_config(cfg),
            progress,
        }
    }

    pub fn with_parts(
        prober: MediaProber,
        scorer: QualityScorer,
        tolerances: Tolerances,
        timeouts: RunnerTimeouts,
        progress: SharedProgress,
    ) -> Self {
        Self {
            prober,
            scorer,
            tolerances,
            timeouts,
            progress,
        }
    }

    pub fn progress(&self) -> SharedProgress {
        self.progress.clone()
    }

    /// Register a job as pending in the progress snapshot.
    pub async fn mark_pending(&self, job: &ComparisonJob) {
        self.progress
            .write()
            .await
            .upsert(job.progress_entry(JobState::Pending));
    }

    async fn enter(&self, job: &ComparisonJob, state: JobState) {
        tracing::debug!(job_id = %job.id, state = %state, "job state change");
        let mut progress = self.progress.write().await;
        if progress.jobs.iter().any(|j| j.id == job.id) {
            progress.set_stage(&job.id, state.as_str());
        } else {
            progress.upsert(job.progress_entry(state));
        }
    }

    /// Last non-terminal stage published for `id`, if any.
    pub async fn last_stage(&self, id: &str) -> Option<JobState> {
        let progress = self.progress.read().await;
        let entry = progress.jobs.iter().find(|j| j.id == id)?;
        JobState::from_name(&entry.stage).filter(|state| !state.is_terminal())
    }

    /// Record a terminal outcome in the progress snapshot and the log.
    pub async fn publish(&self, job: &ComparisonJob, outcome: &JobOutcome) {
        let mut entry = match outcome {
            JobOutcome::Succeeded(_) => job.progress_entry(JobState::Succeeded),
            JobOutcome::Failed(_) => job.progress_entry(JobState::Failed),
        };
        match outcome {
            JobOutcome::Succeeded(report) => {
                tracing::info!(
                    job_id = %job.id,
                    vmaf_mean = report.vmaf.mean,
                    rating = %report.rating,
                    elapsed = report.elapsed_secs,
                    "job succeeded"
                );
                entry.vmaf_mean = Some(report.vmaf.mean);
            }
            JobOutcome::Failed(failure) => {
                tracing::warn!(
                    job_id = %job.id,
                    kind = %failure.kind,
                    stage = %failure.stage,
                    retryable = failure.retryable,
                    error = %failure.message,
                    "job failed"
                );
                entry.failure = Some(format!("{}: {}", failure.kind, failure.message));
            }
        }
        self.progress.write().await.upsert(entry);
    }

    /// Run one job to its outcome.
    pub async fn run(&self, job: &ComparisonJob, cancel: &CancellationToken) -> JobOutcome {
        let outcome = self.execute(job, cancel).await;
        self.publish(job, &outcome).await;
        outcome
    }

    async fn execute(&self, job: &ComparisonJob, cancel: &CancellationToken) -> JobOutcome {
        let started = Instant::now();
        let budget = job.timeout().unwrap_or(self.timeouts.job);
        let deadline = started + budget;

        self.enter(job, JobState::Probing).await;
        let probe_timeout = self.timeouts.probe.min(budget);
        let (reference, processed) = tokio::join!(
            self.prober.probe(&job.reference, probe_timeout, cancel),
            self.prober.probe(&job.processed, probe_timeout, cancel),
        );

        let (reference, processed) = match (reference, processed) {
            (Ok(r), Ok(p)) => (r, p),
            (Err(err), other) => {
                let (kind, retryable) = classify_probe(&err);
                let message = format!("probing reference: {err}");
                return JobOutcome::Failed(
                    JobFailure::new(&job.id, kind, JobState::Probing, message, retryable)
                        .with_media(None, other.ok().map(|(d, _)| d)),
                );
            }
            (Ok((r, _)), Err(err)) => {
                let (kind, retryable) = classify_probe(&err);
                let message = format!("probing processed: {err}");
                return JobOutcome::Failed(
                    JobFailure::new(&job.id, kind, JobState::Probing, message, retryable)
                        .with_media(Some(r), None),
                );
            }
        };
        let ((reference, reference_record), (processed, processed_record)) = (reference, processed);

        self.enter(job, JobState::Reconciling).await;
        let plan = match reconcile(&reference, &processed, &self.tolerances, job.target.as_ref()) {
            Ok(plan) => plan,
            Err(err) => {
                return JobOutcome::Failed(
                    JobFailure::new(
                        &job.id,
                        FailureKind::IncompatibleMedia,
                        JobState::Reconciling,
                        err,
                        false,
                    )
                    .with_media(Some(reference), Some(processed)),
                );
            }
        };
        if !plan.is_noop() {
            tracing::info!(job_id = %job.id, adjustments = ?plan.adjustments, "reconciling formats");
        }

        self.enter(job, JobState::Scoring).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return JobOutcome::Failed(
                JobFailure::new(
                    &job.id,
                    FailureKind::Timeout,
                    JobState::Scoring,
                    format!("job budget of {budget:?} exhausted before scoring"),
                    true,
                )
                .with_media(Some(reference), Some(processed)),
            );
        }

        match self
            .scorer
            .score(&job.id, &reference, &processed, &plan, remaining, cancel)
            .await
        {
            Ok(mut report) => {
                report.invocations.insert(0, processed_record);
                report.invocations.insert(0, reference_record);
                report.elapsed_secs = started.elapsed().as_secs_f64();
                JobOutcome::Succeeded(report)
            }
            Err(err) => {
                let (kind, retryable) = classify_score(&err);
                JobOutcome::Failed(
                    JobFailure::new(&job.id, kind, JobState::Scoring, err, retryable)
                        .with_media(Some(reference), Some(processed)),
                )
            }
        }
    }
}
