//! Concurrency planning for batch scoring
//!
//! Derives the number of concurrent jobs and libvmaf threads per job from the
//! CPU core count and configuration.

use crate::config::Config;
use serde::Serialize;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// libvmaf `n_threads` for each scoring run
    pub vmaf_threads: u32,
    /// Maximum number of jobs in flight
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Derives vmaf_threads: 8 for 32+ cores, 4 otherwise (unless explicit)
    /// - Derives max_concurrent_jobs: target_threads / vmaf_threads, at least 1 (unless explicit)
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .filter(|c| *c > 0)
            .unwrap_or_else(|| num_cpus::get() as u32);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = (((total_cores as f32) * clamped_utilization).round() as u32).max(1);

        let vmaf_threads = if cfg.scoring.vmaf_threads > 0 {
            cfg.scoring.vmaf_threads
        } else {
            derive_vmaf_threads(total_cores)
        };

        let max_concurrent_jobs = if cfg.batch.max_concurrent_jobs > 0 {
            cfg.batch.max_concurrent_jobs
        } else {
            derive_max_jobs(target_threads, vmaf_threads)
        };

        Self {
            total_cores,
            target_threads,
            vmaf_threads,
            max_concurrent_jobs,
        }
    }
}

/// 8 libvmaf threads for 32+ cores, 4 otherwise
fn derive_vmaf_threads(cores: u32) -> u32 {
    if cores >= 32 {
        8
    } else {
        4
    }
}

fn derive_max_jobs(target_threads: u32, vmaf_threads: u32) -> u32 {
    (target_threads / vmaf_threads.max(1)).max(1)
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    if util.is_nan() {
        return 1.0;
    }
    util.clamp(0.5, 1.0)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, CpuConfig, ScoringConfig};
    use proptest::prelude::*;

    fn config_with(cores: u32, utilization: f32, vmaf_threads: u32, max_jobs: u32) -> Config {
        Config {
            cpu: CpuConfig {
                logical_cores: Some(cores),
                target_cpu_utilization: utilization,
            },
            batch: BatchConfig {
                max_concurrent_jobs: max_jobs,
                ..BatchConfig::default()
            },
            scoring: ScoringConfig {
                vmaf_threads,
                ..ScoringConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_known_hosts() {
        // 16 cores at 85% -> 14 threads, 4 per job -> 3 jobs
        let plan = derive_plan(&config_with(16, 0.85, 0, 0));
        assert_eq!(plan.target_threads, 14);
        assert_eq!(plan.vmaf_threads, 4);
        assert_eq!(plan.max_concurrent_jobs, 3);

        // 64 cores at 100% -> 8 per job -> 8 jobs
        let plan = derive_plan(&config_with(64, 1.0, 0, 0));
        assert_eq!(plan.vmaf_threads, 8);
        assert_eq!(plan.max_concurrent_jobs, 8);

        // A single core still admits one job
        let plan = derive_plan(&config_with(1, 0.5, 0, 0));
        assert_eq!(plan.target_threads, 1);
        assert_eq!(plan.max_concurrent_jobs, 1);
    }

    // Derived plans: thread count follows the core tier and jobs fill the
    // thread budget without exceeding it (except the one-job floor).
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_concurrency_derivation(cores in 1u32..256) {
            let plan = derive_plan(&config_with(cores, 0.85, 0, 0));

            prop_assert_eq!(plan.total_cores, cores);

            let expected_threads = if cores >= 32 { 8 } else { 4 };
            prop_assert_eq!(
                plan.vmaf_threads, expected_threads,
                "For {} cores, expected {} vmaf threads but got {}",
                cores, expected_threads, plan.vmaf_threads
            );

            prop_assert!(plan.max_concurrent_jobs >= 1);
            if plan.max_concurrent_jobs > 1 {
                prop_assert!(plan.max_concurrent_jobs * plan.vmaf_threads <= plan.target_threads);
            }
        }
    }

    // Explicit non-zero settings are used unchanged.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_explicit_config_override(
            cores in 1u32..256,
            explicit_threads in 1u32..64,
            explicit_jobs in 1u32..16,
        ) {
            let plan = derive_plan(&config_with(cores, 0.85, explicit_threads, explicit_jobs));

            prop_assert_eq!(plan.vmaf_threads, explicit_threads);
            prop_assert_eq!(plan.max_concurrent_jobs, explicit_jobs);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_utilization_clamping(
            cores in 1u32..256,
            raw_utilization in -1.0f32..3.0,
        ) {
            let plan = derive_plan(&config_with(cores, raw_utilization, 0, 0));

            let clamped = raw_utilization.clamp(0.5, 1.0);
            let expected_target_threads = (((cores as f32) * clamped).round() as u32).max(1);

            prop_assert_eq!(
                plan.target_threads, expected_target_threads,
                "For {} cores and {} utilization (clamped to {}), expected {} target threads but got {}",
                cores, raw_utilization, clamped, expected_target_threads, plan.target_threads
            );
            prop_assert!(plan.target_threads <= cores);
        }
    }
}
