//! Job manifests
//!
//! A manifest lists the comparisons of a batch as `[[jobs]]` entries in TOML,
//! or as a `{"jobs": [...]}` document in JSON. The format follows the file
//! extension (`.json` is JSON, anything else TOML). Relative paths are
//! resolved against the manifest's directory and missing ids get a UUID.

use crate::job::ComparisonJob;
use crate::reconcile::TargetOverride;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Error type for manifest loading
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML manifest: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate job id '{0}'")]
    DuplicateId(String),

    #[error("job '{id}': {reason}")]
    InvalidJob { id: String, reason: String },
}

/// Manifest file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Toml,
    Json,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ManifestFormat::Json,
            _ => ManifestFormat::Toml,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    jobs: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawJob {
    id: Option<String>,
    reference: PathBuf,
    processed: PathBuf,
    timeout_secs: Option<f64>,
    target: Option<TargetOverride>,
}

/// Load jobs from a manifest file.
pub fn load_manifest(path: &Path) -> Result<Vec<ComparisonJob>, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let jobs = parse_manifest(&content, ManifestFormat::from_path(path), base_dir)?;
    tracing::debug!(path = %path.display(), jobs = jobs.len(), "loaded manifest");
    Ok(jobs)
}

/// Parse manifest text; relative paths are joined onto `base_dir`.
pub fn parse_manifest(
    content: &str,
    format: ManifestFormat,
    base_dir: &Path,
) -> Result<Vec<ComparisonJob>, ManifestError> {
    let raw: RawManifest = match format {
        ManifestFormat::Toml => toml::from_str(content)?,
        ManifestFormat::Json => serde_json::from_str(content)?,
    };

    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(raw.jobs.len());
    for entry in raw.jobs {
        let id = match entry.id {
            Some(id) if id.trim().is_empty() => {
                return Err(ManifestError::InvalidJob {
                    id,
                    reason: "id must not be blank".to_string(),
                })
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        if !seen.insert(id.clone()) {
            return Err(ManifestError::DuplicateId(id));
        }
        let timeout = match entry.timeout_secs {
            None => None,
            Some(secs) => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) if !timeout.is_zero() => Some(timeout),
                _ => {
                    return Err(ManifestError::InvalidJob {
                        id,
                        reason: format!("timeout_secs must be a positive number of seconds, got {secs}"),
                    })
                }
            },
        };
        if let Some(target) = &entry.target {
            if let Err(e) = target.validate() {
                return Err(ManifestError::InvalidJob {
                    id,
                    reason: e.to_string(),
                });
            }
        }

        let mut job = ComparisonJob::new(
            id,
            resolve(base_dir, entry.reference),
            resolve(base_dir, entry.processed),
        );
        if let Some(target) = entry.target {
            job = job.with_target(target);
        }
        if let Some(timeout) = timeout {
            job = job.with_timeout(timeout);
        }
        jobs.push(job);
    }
    Ok(jobs)
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
