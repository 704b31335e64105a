//! Media probing with ffprobe.
//!
//! Runs `ffprobe -v error -print_format json -show_format -show_streams <path>`
//! and reduces the output to a [`MediaDescriptor`] for the first video stream.

use crate::tool::{InvocationRecord, ToolError, ToolInvocation, ToolRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Input file does not exist.
    #[error("input file does not exist: {0}")]
    NotFound(PathBuf),

    /// Input exists but cannot be read.
    #[error("input file is not readable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ffprobe could not be run or exited non-zero.
    #[error("ffprobe failed: {0}")]
    Tool(#[from] ToolError),

    /// Failed to parse ffprobe JSON output.
    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The container has no (non cover-art) video stream.
    #[error("no video stream found in {0}")]
    NoVideoStream(PathBuf),

    /// A field needed for comparison is missing or invalid.
    #[error("ffprobe output for {path} has no usable {field}")]
    MissingField { path: PathBuf, field: &'static str },
}

/// Rational frame rate as reported by ffprobe (`30000/1001`).
///
/// Serialized as its `num/den` string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    /// Create a frame rate; both terms must be non-zero.
    pub fn new(num: u32, den: u32) -> Option<Self> {
        if num == 0 || den == 0 {
            None
        } else {
            Some(Self { num, den })
        }
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for FrameRate {
    type Err = String;

    /// Accepts `num/den`, an integer, or a decimal such as `29.97`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((num, den)) = s.split_once('/') {
            let num: u32 = num.trim().parse().map_err(|_| format!("invalid frame rate '{s}'"))?;
            let den: u32 = den.trim().parse().map_err(|_| format!("invalid frame rate '{s}'"))?;
            return FrameRate::new(num, den).ok_or_else(|| format!("degenerate frame rate '{s}'"));
        }

        if let Ok(whole) = s.parse::<u32>() {
            return FrameRate::new(whole, 1).ok_or_else(|| format!("degenerate frame rate '{s}'"));
        }

        let value: f64 = s.parse().map_err(|_| format!("invalid frame rate '{s}'"))?;
        if !value.is_finite() || value <= 0.0 || value > 100_000.0 {
            return Err(format!("invalid frame rate '{s}'"));
        }
        // Millihertz precision is enough for every real-world rate.
        let num = (value * 1000.0).round() as u32;
        FrameRate::new(num, 1000)
            .map(|r| r.reduced())
            .ok_or_else(|| format!("degenerate frame rate '{s}'"))
    }
}

impl TryFrom<String> for FrameRate {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FrameRate> for String {
    fn from(rate: FrameRate) -> Self {
        rate.to_string()
    }
}

impl FrameRate {
    fn reduced(self) -> Self {
        fn gcd(a: u32, b: u32) -> u32 {
            if b == 0 {
                a
            } else {
                gcd(b, a % b)
            }
        }
        let g = gcd(self.num, self.den).max(1);
        Self {
            num: self.num / g,
            den: self.den / g,
        }
    }
}

/// Metadata for the video stream of one media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub path: PathBuf,
    /// Container format as named by ffprobe (e.g. "mov,mp4,m4a,3gp,3g2,mj2").
    pub container: String,
    pub video_codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub pixel_format: String,
    pub duration_secs: f64,
    /// Index of the selected stream within the container.
    pub stream_index: u32,
}

impl MediaDescriptor {
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub pix_fmt: Option<String>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub duration: Option<String>,
        #[serde(default)]
        pub disposition: Disposition,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub attached_pic: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
    }
}

/// Parses ffprobe JSON output into a MediaDescriptor for `path`.
///
/// Picks the video stream with the lowest index, ignoring attached pictures.
pub fn parse_ffprobe_output(path: &Path, json_str: &str) -> Result<MediaDescriptor, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("missing format information in ffprobe output".to_string())
    })?;

    let mut streams = ffprobe.streams.unwrap_or_default();
    streams.sort_by_key(|s| s.index.unwrap_or(u32::MAX));

    let stream = streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video") && s.disposition.attached_pic == 0)
        .ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;

    let missing = |field: &'static str| ProbeError::MissingField {
        path: path.to_path_buf(),
        field,
    };

    let width = stream.width.filter(|w| *w > 0).ok_or_else(|| missing("width"))?;
    let height = stream.height.filter(|h| *h > 0).ok_or_else(|| missing("height"))?;

    // r_frame_rate is "0/0" for some variable-rate streams.
    let frame_rate = [stream.r_frame_rate.as_deref(), stream.avg_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|s| s.parse::<FrameRate>().ok())
        .ok_or_else(|| missing("frame rate"))?;

    let duration_secs = [stream.duration.as_deref(), format.duration.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(|d| d.trim().parse::<f64>().ok())
        .find(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| missing("duration"))?;

    Ok(MediaDescriptor {
        path: path.to_path_buf(),
        container: format.format_name.unwrap_or_default(),
        video_codec: stream.codec_name.unwrap_or_default(),
        width,
        height,
        frame_rate,
        pixel_format: stream.pix_fmt.ok_or_else(|| missing("pixel format"))?,
        duration_secs,
        stream_index: stream.index.unwrap_or(0),
    })
}

/// Probes media files through a [`ToolRunner`].
#[derive(Clone)]
pub struct MediaProber {
    runner: Arc<dyn ToolRunner>,
    ffprobe: PathBuf,
}

impl MediaProber {
    pub fn new(runner: Arc<dyn ToolRunner>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            ffprobe: ffprobe.into(),
        }
    }

    /// Build the ffprobe invocation for `path`.
    pub fn build_invocation(&self, path: &Path, timeout: Duration) -> ToolInvocation {
        ToolInvocation::new(&self.ffprobe, timeout)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
    }

    /// Probe one file. Spawns a single ffprobe process; no retries.
    pub async fn probe(
        &self,
        path: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(MediaDescriptor, InvocationRecord), ProbeError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(ProbeError::Unreadable {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "not a regular file"),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProbeError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ProbeError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let invocation = self.build_invocation(path, timeout);
        let output = self.runner.run(&invocation, cancel).await?;
        let descriptor = parse_ffprobe_output(path, &output.stdout)?;

        tracing::info!(
            path = %path.display(),
            codec = %descriptor.video_codec,
            width = descriptor.width,
            height = descriptor.height,
            frame_rate = %descriptor.frame_rate,
            duration = descriptor.duration_secs,
            "probe complete"
        );

        Ok((descriptor, output.record))
    }
}
