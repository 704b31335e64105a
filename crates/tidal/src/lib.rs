//! tidal
//!
//! Video quality scoring pipeline: probes reference/processed pairs with
//! ffprobe, reconciles their formats, scores them with ffmpeg's libvmaf
//! filter and runs many pairs as an isolated, bounded-concurrency batch.

pub mod batch;
pub mod concurrency;
pub mod job;
pub mod manifest;
pub mod probe;
pub mod progress;
pub mod reconcile;
pub mod report;
pub mod score;
pub mod startup;
pub mod tool;

pub use tidal_config as config;
pub use tidal_config::Config;
pub use batch::{BatchCoordinator, BatchResult};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use job::{
    ComparisonJob, FailureKind, JobFailure, JobOutcome, JobRunner, JobState, RunnerTimeouts,
};
pub use manifest::{load_manifest, parse_manifest, ManifestError, ManifestFormat};
pub use probe::{parse_ffprobe_output, FrameRate, MediaDescriptor, MediaProber, ProbeError};
pub use progress::{new_shared_progress, JobProgress, ProgressSnapshot, SharedProgress};
pub use reconcile::{
    reconcile, IncompatibleMediaError, ReconciliationPlan, TargetOverride, Tolerances,
};
pub use report::{
    render_batch_report, render_quality_report, write_job_reports, write_json, write_markdown,
};
pub use score::{
    parse_vmaf_log, select_vmaf_model, QualityRating, QualityReport, QualityScorer, ScoreError,
    ScoreOptions, ScoreParseError, VmafStats,
};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, StartupReport};
pub use tool::{InvocationRecord, ProcessRunner, ToolError, ToolInvocation, ToolOutput, ToolRunner};
