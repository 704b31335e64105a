//! Quality scoring with ffmpeg's libvmaf filter
//!
//! Builds the comparison filter graph, runs ffmpeg through a [`ToolRunner`],
//! and aggregates the per-frame scores libvmaf writes to its JSON log.

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::probe::MediaDescriptor;
use crate::reconcile::ReconciliationPlan;
use crate::tool::{InvocationRecord, ToolError, ToolInvocation, ToolRunner};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default libvmaf model
pub const DEFAULT_VMAF_MODEL: &str = "vmaf_v0.6.1";

/// Model trained for 4K viewing distance
pub const VMAF_4K_MODEL: &str = "vmaf_4k_v0.6.1";

/// Decimal places libvmaf uses in its JSON log
const SCORE_DECIMALS: i32 = 6;

/// Error type for libvmaf log parsing
#[derive(Debug, Error)]
pub enum ScoreParseError {
    #[error("failed to read VMAF log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("VMAF log is not valid JSON: {0}")]
    Json(String),

    #[error("VMAF log has no frames and no pooled metrics")]
    Empty,

    #[error("VMAF log is missing metric '{metric}'{}", frame_suffix(.frame))]
    MissingMetric { metric: String, frame: Option<u64> },

    #[error("VMAF log has non-numeric metric '{metric}'{}", frame_suffix(.frame))]
    NonNumeric { metric: String, frame: Option<u64> },
}

fn frame_suffix(frame: &Option<u64>) -> String {
    frame.map(|f| format!(" at frame {f}")).unwrap_or_default()
}

/// Error type for a scoring run
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("ffmpeg failed: {0}")]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Parse(#[from] ScoreParseError),

    #[error("failed to prepare scratch file in {dir}: {source}")]
    Scratch {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Summary statistics of the per-frame VMAF scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VmafStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub harmonic_mean: f64,
}

/// Everything read from one libvmaf log
#[derive(Debug, Clone, PartialEq)]
pub struct VmafScores {
    pub vmaf: VmafStats,
    pub psnr_y_mean: Option<f64>,
    pub ssim_mean: Option<f64>,
    pub frame_count: usize,
    /// Per-frame VMAF ordered by frame number
    pub frames: Vec<f64>,
}

/// Coarse verdict on a VMAF mean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityRating {
    pub fn from_vmaf(mean: f64) -> Self {
        if mean >= 95.0 {
            QualityRating::Excellent
        } else if mean >= 80.0 {
            QualityRating::Good
        } else if mean >= 60.0 {
            QualityRating::Fair
        } else {
            QualityRating::Poor
        }
    }
}

impl fmt::Display for QualityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityRating::Excellent => "Excellent",
            QualityRating::Good => "Good",
            QualityRating::Fair => "Fair",
            QualityRating::Poor => "Poor",
        };
        f.write_str(label)
    }
}

/// Result of one successful comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub job_id: String,
    pub reference: PathBuf,
    pub processed: PathBuf,
    pub vmaf: VmafStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_frame_vmaf: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psnr_y_mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssim_mean: Option<f64>,
    pub frame_count: usize,
    pub model: String,
    pub rating: QualityRating,
    /// Reconciliation steps applied before scoring
    pub adjustments: Vec<String>,
    pub reference_media: MediaDescriptor,
    pub processed_media: MediaDescriptor,
    pub elapsed_secs: f64,
    pub invocations: Vec<InvocationRecord>,
}

/// Pick the libvmaf model. `auto` selects the 4K model for 2160-line references.
pub fn select_vmaf_model(configured: &str, reference_height: u32) -> String {
    if !configured.eq_ignore_ascii_case("auto") {
        return configured.to_string();
    }
    if reference_height >= 2160 {
        VMAF_4K_MODEL.to_string()
    } else {
        DEFAULT_VMAF_MODEL.to_string()
    }
}

/// Escape a path for use as a filter option value.
pub fn escape_filter_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | ':' | ' ' | '[' | ']' | ',' | ';' | '\'') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Options that shape the libvmaf run
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOptions {
    /// libvmaf model version, or `auto`
    pub model: String,
    pub n_threads: u32,
    pub compute_psnr: bool,
    pub compute_ssim: bool,
    pub keep_frame_scores: bool,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ScoreOptions {
    fn default() -> Self {
        Self {
            model: "auto".to_string(),
            n_threads: 4,
            compute_psnr: false,
            compute_ssim: false,
            keep_frame_scores: true,
            scratch_dir: None,
        }
    }
}

impl ScoreOptions {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            model: cfg.scoring.vmaf_model.clone(),
            n_threads: plan.vmaf_threads,
            compute_psnr: cfg.scoring.compute_psnr,
            compute_ssim: cfg.scoring.compute_ssim,
            keep_frame_scores: cfg.scoring.keep_frame_scores,
            scratch_dir: cfg.tools.scratch_dir.clone(),
        }
    }
}

fn leg_chain(input: &str, filters: &[String], label: &str) -> String {
    let mut chain = format!("[{input}]");
    for filter in filters {
        chain.push_str(filter);
        chain.push(',');
    }
    chain.push_str("setpts=PTS-STARTPTS[");
    chain.push_str(label);
    chain.push(']');
    chain
}

/// Build the `-lavfi` graph. The processed leg is libvmaf's first (distorted) input.
pub fn build_filter_graph(
    plan: &ReconciliationPlan,
    model: &str,
    log_path: &Path,
    options: &ScoreOptions,
) -> String {
    let mut vmaf = format!(
        "[dist][ref]libvmaf=model=version={model}:log_fmt=json:log_path={}:n_threads={}",
        escape_filter_path(log_path),
        options.n_threads.max(1)
    );

    let features: Vec<&str> = [
        (options.compute_psnr, "name=psnr"),
        (options.compute_ssim, "name=float_ssim"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    if !features.is_empty() {
        vmaf.push_str(":feature=");
        vmaf.push_str(&features.join("|"));
    }

    [
        leg_chain("0:v", &plan.reference_filters, "ref"),
        leg_chain("1:v", &plan.processed_filters, "dist"),
        vmaf,
    ]
    .join(";")
}

/// Raw libvmaf JSON log structures
mod vmaf_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct VmafLog {
        #[serde(default)]
        pub frames: Vec<Frame>,
        #[serde(default)]
        pub pooled_metrics: HashMap<String, HashMap<String, serde_json::Value>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Frame {
        #[serde(rename = "frameNum")]
        pub frame_num: u64,
        #[serde(default)]
        pub metrics: HashMap<String, serde_json::Value>,
    }
}

fn round_score(value: f64) -> f64 {
    let scale = 10f64.powi(SCORE_DECIMALS);
    (value * scale).round() / scale
}

fn numeric(
    metrics: &HashMap<String, serde_json::Value>,
    metric: &str,
    frame: Option<u64>,
) -> Result<f64, ScoreParseError> {
    let value = metrics.get(metric).ok_or_else(|| ScoreParseError::MissingMetric {
        metric: metric.to_string(),
        frame,
    })?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ScoreParseError::NonNumeric {
            metric: metric.to_string(),
            frame,
        })
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn summarize(frames: &[f64]) -> VmafStats {
    let min = frames.iter().copied().fold(f64::INFINITY, f64::min);
    let max = frames.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let inverse_sum: f64 = frames.iter().map(|x| 1.0 / (x + 1.0)).sum();
    VmafStats {
        mean: round_score(mean(frames)),
        min: round_score(min),
        max: round_score(max),
        harmonic_mean: round_score(frames.len() as f64 / inverse_sum - 1.0),
    }
}

/// Parse a libvmaf JSON log.
///
/// Statistics come from the per-frame scores when present; a log without
/// frames falls back to libvmaf's pooled metrics.
pub fn parse_vmaf_log(
    json: &str,
    compute_psnr: bool,
    compute_ssim: bool,
) -> Result<VmafScores, ScoreParseError> {
    let mut log: vmaf_json::VmafLog =
        serde_json::from_str(json).map_err(|e| ScoreParseError::Json(e.to_string()))?;

    if log.frames.is_empty() {
        return parse_pooled(&log, compute_psnr, compute_ssim);
    }

    log.frames.sort_by_key(|f| f.frame_num);

    let mut vmaf = Vec::with_capacity(log.frames.len());
    let mut psnr = Vec::new();
    let mut ssim = Vec::new();
    for frame in &log.frames {
        let at = Some(frame.frame_num);
        vmaf.push(numeric(&frame.metrics, "vmaf", at)?);
        if compute_psnr {
            psnr.push(numeric(&frame.metrics, "psnr_y", at)?);
        }
        if compute_ssim {
            ssim.push(numeric(&frame.metrics, "float_ssim", at)?);
        }
    }

    Ok(VmafScores {
        vmaf: summarize(&vmaf),
        psnr_y_mean: compute_psnr.then(|| round_score(mean(&psnr))),
        ssim_mean: compute_ssim.then(|| round_score(mean(&ssim))),
        frame_count: vmaf.len(),
        frames: vmaf,
    })
}

fn parse_pooled(
    log: &vmaf_json::VmafLog,
    compute_psnr: bool,
    compute_ssim: bool,
) -> Result<VmafScores, ScoreParseError> {
    let vmaf = log.pooled_metrics.get("vmaf").ok_or(ScoreParseError::Empty)?;
    let pooled_mean = |metric: &str| -> Result<f64, ScoreParseError> {
        let stats = log
            .pooled_metrics
            .get(metric)
            .ok_or_else(|| ScoreParseError::MissingMetric {
                metric: metric.to_string(),
                frame: None,
            })?;
        numeric(stats, "mean", None).map(round_score)
    };

    Ok(VmafScores {
        vmaf: VmafStats {
            mean: round_score(numeric(vmaf, "mean", None)?),
            min: round_score(numeric(vmaf, "min", None)?),
            max: round_score(numeric(vmaf, "max", None)?),
            harmonic_mean: round_score(numeric(vmaf, "harmonic_mean", None)?),
        },
        psnr_y_mean: if compute_psnr { Some(pooled_mean("psnr_y")?) } else { None },
        ssim_mean: if compute_ssim { Some(pooled_mean("float_ssim")?) } else { None },
        frame_count: 0,
        frames: Vec::new(),
    })
}

/// Runs libvmaf comparisons through a [`ToolRunner`]
#[derive(Clone)]
pub struct QualityScorer {
    runner: Arc<dyn ToolRunner>,
    ffmpeg: PathBuf,
    options: ScoreOptions,
}

impl QualityScorer {
    pub fn new(runner: Arc<dyn ToolRunner>, ffmpeg: impl Into<PathBuf>, options: ScoreOptions) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
            options,
        }
    }

    /// Build the ffmpeg invocation comparing the two inputs.
    pub fn build_invocation(
        &self,
        reference: &Path,
        processed: &Path,
        graph: &str,
        timeout: Duration,
    ) -> ToolInvocation {
        ToolInvocation::new(&self.ffmpeg, timeout)
            .args(["-hide_banner", "-nostdin", "-y", "-i"])
            .arg(reference)
            .arg("-i")
            .arg(processed)
            .arg("-lavfi")
            .arg(graph)
            .args(["-f", "null", "-"])
    }

    fn scratch_log(&self) -> Result<tempfile::NamedTempFile, ScoreError> {
        let dir = self
            .options
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let scratch = |source| ScoreError::Scratch {
            dir: dir.clone(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(scratch)?;
        tempfile::Builder::new()
            .prefix("tidal-vmaf-")
            .suffix(".json")
            .tempfile_in(&dir)
            .map_err(scratch)
    }

    /// Score `processed` against `reference` after applying `plan`.
    ///
    /// The scratch log is removed when this returns, whatever the outcome.
    pub async fn score(
        &self,
        job_id: &str,
        reference: &MediaDescriptor,
        processed: &MediaDescriptor,
        plan: &ReconciliationPlan,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<QualityReport, ScoreError> {
        let started = Instant::now();
        let model = select_vmaf_model(&self.options.model, reference.height);
        let log_file = self.scratch_log()?;
        let graph = build_filter_graph(plan, &model, log_file.path(), &self.options);
        let invocation = self.build_invocation(&reference.path, &processed.path, &graph, timeout);

        tracing::info!(job_id, model = %model, adjustments = plan.adjustments.len(), "scoring");
        let output = self.runner.run(&invocation, cancel).await?;

        let json = std::fs::read_to_string(log_file.path()).map_err(|source| ScoreParseError::Io {
            path: log_file.path().to_path_buf(),
            source,
        })?;
        let scores = parse_vmaf_log(&json, self.options.compute_psnr, self.options.compute_ssim)?;

        let rating = QualityRating::from_vmaf(scores.vmaf.mean);
        tracing::info!(
            job_id,
            vmaf_mean = scores.vmaf.mean,
            vmaf_min = scores.vmaf.min,
            frames = scores.frame_count,
            rating = %rating,
            "scoring complete"
        );

        Ok(QualityReport {
            job_id: job_id.to_string(),
            reference: reference.path.clone(),
            processed: processed.path.clone(),
            vmaf: scores.vmaf,
            per_frame_vmaf: self.options.keep_frame_scores.then_some(scores.frames),
            psnr_y_mean: scores.psnr_y_mean,
            ssim_mean: scores.ssim_mean,
            frame_count: scores.frame_count,
            model,
            rating,
            adjustments: plan.adjustments.clone(),
            reference_media: reference.clone(),
            processed_media: processed.clone(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            invocations: vec![output.record],
        })
    }
}
