//! Startup checks
//!
//! Preflight checks run before a batch:
//! - ffprobe runs
//! - ffmpeg runs and reports a supported version
//! - ffmpeg was built with the libvmaf filter

use crate::config::Config;
use crate::tool::{ToolError, ToolInvocation, ToolRunner};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Oldest ffmpeg major version whose libvmaf filter takes `model=version=...`
pub const MIN_FFMPEG_MAJOR: u32 = 5;

const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("FFmpeg was built without the libvmaf filter")]
    LibvmafMissing,

    #[error("{0}")]
    Tool(#[from] ToolError),
}

/// What the checks found
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupReport {
    pub ffprobe_version: String,
    pub ffmpeg_version: String,
    pub ffmpeg_major: u32,
    pub libvmaf: bool,
}

/// Extract the version token following "`tool` version".
///
/// Handles release ("ffmpeg version 6.1.1"), n-prefixed ("n7.0-...") and
/// packaged ("4.4.2-0ubuntu0.22.04.1") formats.
pub fn parse_version_token(output: &str, tool: &str) -> Option<String> {
    let needle = format!("{} version", tool.to_lowercase());
    let line = output
        .lines()
        .find(|line| line.to_lowercase().contains(&needle))?;
    let lower = line.to_lowercase();
    let start = lower.find(&needle)? + needle.len();
    lower[start..].split_whitespace().next().map(str::to_string)
}

/// Parse FFmpeg version output and extract the major version number
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let token = parse_version_token(version_output, "ffmpeg")?;
    let version_str = token.trim_start_matches(['n', 'N']);
    let major_str = version_str.split(['.', '-']).next()?;
    major_str.parse().ok()
}

/// Whether `ffmpeg -filters` output lists libvmaf
pub fn lists_libvmaf(filters_output: &str) -> bool {
    filters_output
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some("libvmaf"))
}

async fn run_text(
    runner: &dyn ToolRunner,
    invocation: ToolInvocation,
    cancel: &CancellationToken,
) -> Result<String, ToolError> {
    let output = runner.run(&invocation, cancel).await?;
    Ok(format!("{}{}", output.stdout, output.stderr))
}

/// Check that ffprobe runs, returning its version token
pub async fn check_ffprobe(
    runner: &dyn ToolRunner,
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<String, StartupError> {
    let invocation = ToolInvocation::new(&cfg.tools.ffprobe, CHECK_TIMEOUT).arg("-version");
    let output = run_text(runner, invocation, cancel)
        .await
        .map_err(|e| StartupError::FfprobeUnavailable(e.to_string()))?;
    Ok(parse_version_token(&output, "ffprobe").unwrap_or_else(|| "unknown".to_string()))
}

/// Check that ffmpeg runs and is new enough
pub async fn check_ffmpeg_version(
    runner: &dyn ToolRunner,
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<(String, u32), StartupError> {
    let invocation = ToolInvocation::new(&cfg.tools.ffmpeg, CHECK_TIMEOUT).arg("-version");
    let output = run_text(runner, invocation, cancel)
        .await
        .map_err(|e| StartupError::FfmpegVersion(format!("Failed to run ffmpeg -version: {e}")))?;

    let major = parse_ffmpeg_version(&output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            output.lines().next().unwrap_or("(empty)")
        ))
    })?;
    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {MIN_FFMPEG_MAJOR}.x or newer required, got: {major}"
        )));
    }

    let token = parse_version_token(&output, "ffmpeg").unwrap_or_default();
    Ok((token, major))
}

/// Check that ffmpeg lists the libvmaf filter
pub async fn check_libvmaf(
    runner: &dyn ToolRunner,
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<(), StartupError> {
    let invocation = ToolInvocation::new(&cfg.tools.ffmpeg, CHECK_TIMEOUT)
        .args(["-hide_banner", "-filters"]);
    let output = run_text(runner, invocation, cancel).await?;
    if lists_libvmaf(&output) {
        Ok(())
    } else {
        Err(StartupError::LibvmafMissing)
    }
}

/// Run all startup checks in order: ffprobe, ffmpeg version, libvmaf
pub async fn run_startup_checks(
    runner: &dyn ToolRunner,
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<StartupReport, StartupError> {
    let ffprobe_version = check_ffprobe(runner, cfg, cancel).await?;
    let (ffmpeg_version, ffmpeg_major) = check_ffmpeg_version(runner, cfg, cancel).await?;
    check_libvmaf(runner, cfg, cancel).await?;

    tracing::info!(
        ffprobe = %ffprobe_version,
        ffmpeg = %ffmpeg_version,
        "startup checks passed"
    );

    Ok(StartupReport {
        ffprobe_version,
        ffmpeg_version,
        ffmpeg_major,
        libvmaf: true,
    })
}
