//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its valid range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Batch execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Maximum concurrent comparison jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Wall-clock budget for a whole job, in seconds
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Upper bound for a single ffprobe call, in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_probe_timeout_secs() -> u64 {
    30
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            job_timeout_secs: default_job_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Tolerances used when deciding whether two streams are comparable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfig {
    /// Maximum allowed duration difference between reference and processed
    #[serde(default = "default_duration_tolerance_secs")]
    pub duration_tolerance_secs: f64,
    /// Frame rates closer than this (in fps) are treated as equal
    #[serde(default = "default_frame_rate_tolerance")]
    pub frame_rate_tolerance: f64,
    /// swscale flags used when resizing the processed stream
    #[serde(default = "default_scale_flags")]
    pub scale_flags: String,
}

fn default_duration_tolerance_secs() -> f64 {
    1.0
}

fn default_frame_rate_tolerance() -> f64 {
    0.01
}

fn default_scale_flags() -> String {
    "bicubic".to_string()
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            duration_tolerance_secs: default_duration_tolerance_secs(),
            frame_rate_tolerance: default_frame_rate_tolerance(),
            scale_flags: default_scale_flags(),
        }
    }
}

/// Quality scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    /// libvmaf model version, or "auto" to pick by reference resolution
    #[serde(default = "default_vmaf_model")]
    pub vmaf_model: String,
    /// libvmaf threads per job (0 = auto-derive)
    #[serde(default)]
    pub vmaf_threads: u32,
    /// Also compute PSNR (luma)
    #[serde(default)]
    pub compute_psnr: bool,
    /// Also compute SSIM
    #[serde(default)]
    pub compute_ssim: bool,
    /// Keep the per-frame VMAF sequence in reports
    #[serde(default = "default_keep_frame_scores")]
    pub keep_frame_scores: bool,
}

fn default_vmaf_model() -> String {
    "auto".to_string()
}

fn default_keep_frame_scores() -> bool {
    true
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            vmaf_model: default_vmaf_model(),
            vmaf_threads: 0,
            compute_psnr: false,
            compute_ssim: false,
            keep_frame_scores: default_keep_frame_scores(),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// ffmpeg binary (name on PATH or absolute path)
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// ffprobe binary (name on PATH or absolute path)
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Directory for libvmaf log files (system temp dir if None)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            scratch_dir: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Parse a boolean the way the env overrides accept it
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides use the `TIDAL_` prefix:
    /// - TIDAL_LOGICAL_CORES, TIDAL_TARGET_CPU_UTILIZATION -> cpu
    /// - TIDAL_MAX_CONCURRENT_JOBS, TIDAL_JOB_TIMEOUT_SECS, TIDAL_PROBE_TIMEOUT_SECS -> batch
    /// - TIDAL_DURATION_TOLERANCE_SECS, TIDAL_FRAME_RATE_TOLERANCE -> reconcile
    /// - TIDAL_VMAF_MODEL, TIDAL_VMAF_THREADS, TIDAL_COMPUTE_PSNR, TIDAL_COMPUTE_SSIM,
    ///   TIDAL_KEEP_FRAME_SCORES -> scoring
    /// - TIDAL_FFMPEG_PATH, TIDAL_FFPROBE_PATH, TIDAL_SCRATCH_DIR -> tools
    ///
    /// Values that fail to parse are ignored and the existing setting is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Some(cores) = env_parsed::<u32>("TIDAL_LOGICAL_CORES") {
            self.cpu.logical_cores = Some(cores);
        }
        if let Some(util) = env_parsed::<f32>("TIDAL_TARGET_CPU_UTILIZATION") {
            self.cpu.target_cpu_utilization = util;
        }

        if let Some(jobs) = env_parsed::<u32>("TIDAL_MAX_CONCURRENT_JOBS") {
            self.batch.max_concurrent_jobs = jobs;
        }
        if let Some(secs) = env_parsed::<u64>("TIDAL_JOB_TIMEOUT_SECS") {
            self.batch.job_timeout_secs = secs;
        }
        if let Some(secs) = env_parsed::<u64>("TIDAL_PROBE_TIMEOUT_SECS") {
            self.batch.probe_timeout_secs = secs;
        }

        if let Some(tol) = env_parsed::<f64>("TIDAL_DURATION_TOLERANCE_SECS") {
            self.reconcile.duration_tolerance_secs = tol;
        }
        if let Some(tol) = env_parsed::<f64>("TIDAL_FRAME_RATE_TOLERANCE") {
            self.reconcile.frame_rate_tolerance = tol;
        }

        if let Ok(model) = env::var("TIDAL_VMAF_MODEL") {
            if !model.trim().is_empty() {
                self.scoring.vmaf_model = model.trim().to_string();
            }
        }
        if let Some(threads) = env_parsed::<u32>("TIDAL_VMAF_THREADS") {
            self.scoring.vmaf_threads = threads;
        }
        if let Some(flag) = env::var("TIDAL_COMPUTE_PSNR").ok().and_then(|v| parse_bool(&v)) {
            self.scoring.compute_psnr = flag;
        }
        if let Some(flag) = env::var("TIDAL_COMPUTE_SSIM").ok().and_then(|v| parse_bool(&v)) {
            self.scoring.compute_ssim = flag;
        }
        if let Some(flag) = env::var("TIDAL_KEEP_FRAME_SCORES")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            self.scoring.keep_frame_scores = flag;
        }

        if let Ok(path) = env::var("TIDAL_FFMPEG_PATH") {
            if !path.is_empty() {
                self.tools.ffmpeg = PathBuf::from(path);
            }
        }
        if let Ok(path) = env::var("TIDAL_FFPROBE_PATH") {
            if !path.is_empty() {
                self.tools.ffprobe = PathBuf::from(path);
            }
        }
        if let Ok(path) = env::var("TIDAL_SCRATCH_DIR") {
            if !path.is_empty() {
                self.tools.scratch_dir = Some(PathBuf::from(path));
            }
        }
    }

    /// Check values that parse but make no sense
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tol = self.reconcile.duration_tolerance_secs;
        if !tol.is_finite() || tol < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "reconcile.duration_tolerance_secs must be a non-negative number, got {}",
                tol
            )));
        }

        let fps_tol = self.reconcile.frame_rate_tolerance;
        if !fps_tol.is_finite() || fps_tol < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "reconcile.frame_rate_tolerance must be a non-negative number, got {}",
                fps_tol
            )));
        }

        if self.batch.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "batch.job_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.batch.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "batch.probe_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.tools.ffmpeg.as_os_str().is_empty() || self.tools.ffprobe.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid(
                "tools.ffmpeg and tools.ffprobe must not be empty".to_string(),
            ));
        }

        if self.scoring.vmaf_model.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "scoring.vmaf_model must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "TIDAL_LOGICAL_CORES",
        "TIDAL_TARGET_CPU_UTILIZATION",
        "TIDAL_MAX_CONCURRENT_JOBS",
        "TIDAL_JOB_TIMEOUT_SECS",
        "TIDAL_PROBE_TIMEOUT_SECS",
        "TIDAL_DURATION_TOLERANCE_SECS",
        "TIDAL_FRAME_RATE_TOLERANCE",
        "TIDAL_VMAF_MODEL",
        "TIDAL_VMAF_THREADS",
        "TIDAL_COMPUTE_PSNR",
        "TIDAL_COMPUTE_SSIM",
        "TIDAL_KEEP_FRAME_SCORES",
        "TIDAL_FFMPEG_PATH",
        "TIDAL_FFPROBE_PATH",
        "TIDAL_SCRATCH_DIR",
    ];

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            logical_cores in proptest::option::of(1u32..256),
            max_jobs in 0u32..16,
            job_timeout in 1u64..100_000,
            duration_tol in 0.0f64..10.0,
            fps_tol in 0.0f64..1.0,
            vmaf_threads in 0u32..64,
            psnr in proptest::bool::ANY,
            ssim in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[cpu]
{}

[batch]
max_concurrent_jobs = {}
job_timeout_secs = {}

[reconcile]
duration_tolerance_secs = {:?}
frame_rate_tolerance = {:?}

[scoring]
vmaf_threads = {}
compute_psnr = {}
compute_ssim = {}

[tools]
ffmpeg = "/opt/ffmpeg/bin/ffmpeg"
"#,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                max_jobs,
                job_timeout,
                duration_tol,
                fps_tol,
                vmaf_threads,
                psnr,
                ssim,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.cpu.logical_cores, logical_cores);
            prop_assert_eq!(config.batch.max_concurrent_jobs, max_jobs);
            prop_assert_eq!(config.batch.job_timeout_secs, job_timeout);
            prop_assert!((config.reconcile.duration_tolerance_secs - duration_tol).abs() < 1e-9);
            prop_assert!((config.reconcile.frame_rate_tolerance - fps_tol).abs() < 1e-9);
            prop_assert_eq!(config.scoring.vmaf_threads, vmaf_threads);
            prop_assert_eq!(config.scoring.compute_psnr, psnr);
            prop_assert_eq!(config.scoring.compute_ssim, ssim);
            prop_assert_eq!(&config.tools.ffmpeg, &PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
            prop_assert_eq!(&config.tools.ffprobe, &PathBuf::from("ffprobe"));
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_max_concurrent_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[batch]\nmax_concurrent_jobs = {}\n", initial_jobs);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TIDAL_MAX_CONCURRENT_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.batch.max_concurrent_jobs, override_jobs);
        }

        #[test]
        fn prop_env_overrides_duration_tolerance(
            initial in 0.0f64..5.0,
            override_tol in 0.0f64..5.0,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[reconcile]\nduration_tolerance_secs = {:?}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TIDAL_DURATION_TOLERANCE_SECS", override_tol.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert!((config.reconcile.duration_tolerance_secs - override_tol).abs() < 1e-9);
        }

        #[test]
        fn prop_env_overrides_auxiliary_metrics(
            initial_psnr in proptest::bool::ANY,
            override_psnr in proptest::bool::ANY,
            override_ssim in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[scoring]\ncompute_psnr = {}\n", initial_psnr);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TIDAL_COMPUTE_PSNR", if override_psnr { "yes" } else { "no" });
            env::set_var("TIDAL_COMPUTE_SSIM", if override_ssim { "1" } else { "0" });
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.scoring.compute_psnr, override_psnr);
            prop_assert_eq!(config.scoring.compute_ssim, override_ssim);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.cpu.logical_cores, None);
        assert!((config.cpu.target_cpu_utilization - 0.85).abs() < 0.0001);
        assert_eq!(config.batch.max_concurrent_jobs, 0);
        assert_eq!(config.batch.job_timeout_secs, 3600);
        assert_eq!(config.batch.probe_timeout_secs, 30);
        assert!((config.reconcile.duration_tolerance_secs - 1.0).abs() < 1e-9);
        assert!((config.reconcile.frame_rate_tolerance - 0.01).abs() < 1e-9);
        assert_eq!(config.reconcile.scale_flags, "bicubic");
        assert_eq!(config.scoring.vmaf_model, "auto");
        assert!(!config.scoring.compute_psnr);
        assert!(!config.scoring.compute_ssim);
        assert!(config.scoring.keep_frame_scores);
        assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));
        assert_eq!(config.tools.scratch_dir, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TIDAL_JOB_TIMEOUT_SECS", "soon");
        env::set_var("TIDAL_COMPUTE_SSIM", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.batch.job_timeout_secs, 3600);
        assert!(!config.scoring.compute_ssim);
    }

    #[test]
    fn test_env_overrides_tool_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TIDAL_FFMPEG_PATH", "/usr/local/bin/ffmpeg");
        env::set_var("TIDAL_SCRATCH_DIR", "/var/tmp/tidal");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.tools.ffmpeg, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(config.tools.ffprobe, PathBuf::from("ffprobe"));
        assert_eq!(config.tools.scratch_dir, Some(PathBuf::from("/var/tmp/tidal")));
    }

    #[test]
    fn test_validate_rejects_negative_tolerance() {
        let mut config = Config::default();
        config.reconcile.duration_tolerance_secs = -0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.reconcile.frame_rate_tolerance = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.batch.job_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("job_timeout_secs"));
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[cpu]
logical_cores = 16

[scoring]
compute_ssim = true
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.cpu.logical_cores, Some(16));
        assert!(config.scoring.compute_ssim);
        assert!(!config.scoring.compute_psnr);
        assert_eq!(config.batch.job_timeout_secs, 3600);
        assert_eq!(config.tools.ffprobe, PathBuf::from("ffprobe"));
    }
}
