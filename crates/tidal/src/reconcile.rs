//! Format reconciliation
//!
//! Decides which ffmpeg filters make a processed video directly comparable
//! with its reference. Automatic reconciliation only ever filters the
//! processed leg; the reference leg is touched only when the job carries an
//! explicit [`TargetOverride`].

use crate::config::ReconcileConfig;
use crate::probe::{FrameRate, MediaDescriptor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when two inputs cannot be meaningfully compared
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IncompatibleMediaError {
    #[error(
        "duration mismatch: reference {reference_secs:.3}s vs processed {processed_secs:.3}s \
         (tolerance {tolerance_secs:.3}s)"
    )]
    DurationMismatch {
        reference_secs: f64,
        processed_secs: f64,
        tolerance_secs: f64,
    },

    #[error("invalid target override: {0}")]
    InvalidTarget(String),
}

/// Matching tolerances used when comparing two descriptors
#[derive(Debug, Clone, PartialEq)]
pub struct Tolerances {
    pub duration_secs: f64,
    pub frame_rate: f64,
    /// swscale flags for resolution changes
    pub scale_flags: String,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}

impl Tolerances {
    pub fn from_config(cfg: &ReconcileConfig) -> Self {
        Self {
            duration_secs: cfg.duration_tolerance_secs,
            frame_rate: cfg.frame_rate_tolerance,
            scale_flags: cfg.scale_flags.clone(),
        }
    }
}

/// Caller-supplied comparison target for both legs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<FrameRate>,
}

impl TargetOverride {
    /// Width and height must be given together and be non-zero.
    pub fn validate(&self) -> Result<(), IncompatibleMediaError> {
        match (self.width, self.height) {
            (Some(0), _) | (_, Some(0)) => Err(IncompatibleMediaError::InvalidTarget(
                "width and height must be non-zero".to_string(),
            )),
            (Some(_), None) | (None, Some(_)) => Err(IncompatibleMediaError::InvalidTarget(
                "width and height must be given together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

/// Filters to apply to each leg before scoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub processed_filters: Vec<String>,
    pub reference_filters: Vec<String>,
    /// Human-readable description of each adjustment
    pub adjustments: Vec<String>,
}

impl ReconciliationPlan {
    pub fn is_noop(&self) -> bool {
        self.processed_filters.is_empty() && self.reference_filters.is_empty()
    }
}

/// Conform one leg to a resolution and frame rate.
fn conform_leg(
    leg: &str,
    media: &MediaDescriptor,
    resolution: (u32, u32),
    frame_rate: FrameRate,
    tolerances: &Tolerances,
    filters: &mut Vec<String>,
    adjustments: &mut Vec<String>,
) {
    if media.resolution() != resolution {
        filters.push(format!(
            "scale={}:{}:flags={}",
            resolution.0, resolution.1, tolerances.scale_flags
        ));
        adjustments.push(format!(
            "scale {leg} {}x{} -> {}x{}",
            media.width, media.height, resolution.0, resolution.1
        ));
    }

    if (media.frame_rate.as_f64() - frame_rate.as_f64()).abs() >= tolerances.frame_rate {
        filters.push(format!("fps={frame_rate}"));
        adjustments.push(format!(
            "resample {leg} {} -> {} fps",
            media.frame_rate, frame_rate
        ));
    }
}

/// Build the plan that makes `processed` comparable with `reference`.
///
/// Fails when the durations differ by more than the tolerance.
pub fn reconcile(
    reference: &MediaDescriptor,
    processed: &MediaDescriptor,
    tolerances: &Tolerances,
    target: Option<&TargetOverride>,
) -> Result<ReconciliationPlan, IncompatibleMediaError> {
    let drift = (reference.duration_secs - processed.duration_secs).abs();
    if drift > tolerances.duration_secs {
        return Err(IncompatibleMediaError::DurationMismatch {
            reference_secs: reference.duration_secs,
            processed_secs: processed.duration_secs,
            tolerance_secs: tolerances.duration_secs,
        });
    }

    let mut plan = ReconciliationPlan::default();

    let (resolution, frame_rate) = match target {
        Some(target) => {
            target.validate()?;
            let resolution = target.resolution().unwrap_or(reference.resolution());
            let frame_rate = target.frame_rate.unwrap_or(reference.frame_rate);
            conform_leg(
                "reference",
                reference,
                resolution,
                frame_rate,
                tolerances,
                &mut plan.reference_filters,
                &mut plan.adjustments,
            );
            (resolution, frame_rate)
        }
        None => (reference.resolution(), reference.frame_rate),
    };

    conform_leg(
        "processed",
        processed,
        resolution,
        frame_rate,
        tolerances,
        &mut plan.processed_filters,
        &mut plan.adjustments,
    );

    if processed.pixel_format != reference.pixel_format {
        plan.processed_filters
            .push(format!("format={}", reference.pixel_format));
        plan.adjustments.push(format!(
            "convert processed pixel format {} -> {}",
            processed.pixel_format, reference.pixel_format
        ));
    }

    Ok(plan)
}
