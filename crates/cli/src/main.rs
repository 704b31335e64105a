//! CLI entry point for tidal
//!
//! Loads configuration, runs startup checks and drives a batch of
//! reference/processed comparisons from a manifest.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tidal::{
    load_manifest, new_shared_progress, render_batch_report, report, run_startup_checks,
    BatchCoordinator, ConcurrencyPlan, Config, JobRunner, MediaProber, ProcessRunner,
    SharedProgress, ToolRunner,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// tidal - perceptual quality scoring of processed video against its reference
#[derive(Parser, Debug)]
#[command(name = "tidal")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml). Defaults are used when it does not exist.
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score every job in a manifest
    Run {
        /// Job manifest (.toml or .json)
        manifest: PathBuf,

        /// Write the batch result JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a Markdown summary report
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Also write one Markdown report per successful job, named `<job id>.md`
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Override the number of jobs scored at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Skip startup checks (ffprobe, ffmpeg version, libvmaf). For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },

    /// Probe one file and print its media descriptor
    Probe {
        path: PathBuf,
    },

    /// Run the startup checks and report what was found
    Check,
}

fn install_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<Config, tidal::config::ConfigError> {
    if path.exists() {
        tracing::info!(path = %path.display(), "loading config");
        Config::load(path)
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Config::from_env()
    }
}

/// Cancel `cancel` on Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

/// Log batch counters until `done` fires.
fn spawn_progress_logger(progress: SharedProgress, done: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = interval.tick() => {
                    let snapshot = progress.read().await;
                    tracing::info!(
                        pending = snapshot.pending_jobs,
                        running = snapshot.running_jobs,
                        succeeded = snapshot.succeeded_jobs,
                        failed = snapshot.failed_jobs,
                        finished = snapshot.finished_jobs(),
                        total = snapshot.jobs.len(),
                        "progress"
                    );
                }
            }
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            true
        }
        Err(e) => {
            eprintln!("Failed to serialize output: {e}");
            false
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run_batch(
    cfg: Config,
    manifest: &Path,
    output: Option<&Path>,
    report_path: Option<&Path>,
    report_dir: Option<&Path>,
    concurrency: Option<usize>,
    skip_checks: bool,
) -> ExitCode {
    let tools: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new());
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    if skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(tools.as_ref(), &cfg, &cancel).await {
        eprintln!("Startup checks failed: {e}");
        return ExitCode::FAILURE;
    }

    let jobs = match load_manifest(manifest) {
        Ok(jobs) => jobs,
        Err(e) => {
            eprintln!("Failed to load manifest: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut plan = ConcurrencyPlan::derive(&cfg);
    if let Some(limit) = concurrency {
        plan.max_concurrent_jobs = u32::try_from(limit.max(1)).unwrap_or(u32::MAX);
    }
    tracing::info!(
        cores = plan.total_cores,
        vmaf_threads = plan.vmaf_threads,
        max_concurrent_jobs = plan.max_concurrent_jobs,
        "concurrency plan"
    );

    let progress = new_shared_progress();
    let coordinator = BatchCoordinator::new(JobRunner::new(tools, &cfg, &plan, progress.clone()));

    let done = CancellationToken::new();
    let logger = spawn_progress_logger(progress, done.clone());
    let result = coordinator
        .run_batch(jobs, plan.max_concurrent_jobs as usize, &cancel)
        .await;
    done.cancel();
    let _ = logger.await;

    if let Some(path) = report_path {
        if let Err(e) = report::write_markdown(&render_batch_report(&result), path) {
            eprintln!("Failed to write report {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    }

    if let Some(dir) = report_dir {
        match report::write_job_reports(&result, dir) {
            Ok(paths) => tracing::info!(dir = %dir.display(), reports = paths.len(), "wrote job reports"),
            Err(e) => {
                eprintln!("Failed to write job reports to {}: {e}", dir.display());
                return ExitCode::FAILURE;
            }
        }
    }

    let written = match output {
        Some(path) => match report::write_json(&result, path) {
            Ok(()) => true,
            Err(e) => {
                eprintln!("Failed to write {}: {e}", path.display());
                false
            }
        },
        None => print_json(&result),
    };

    exit_code(written && result.all_succeeded())
}

async fn probe_file(cfg: Config, path: &Path) -> ExitCode {
    let prober = MediaProber::new(Arc::new(ProcessRunner::new()), &cfg.tools.ffprobe);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let timeout = Duration::from_secs(cfg.batch.probe_timeout_secs);
    match prober.probe(path, timeout, &cancel).await {
        Ok((media, _)) => exit_code(print_json(&media)),
        Err(e) => {
            eprintln!("Probe failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn check(cfg: Config) -> ExitCode {
    let tools = ProcessRunner::new();
    match run_startup_checks(&tools, &cfg, &CancellationToken::new()).await {
        Ok(found) => exit_code(print_json(&found)),
        Err(e) => {
            eprintln!("Startup checks failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    install_tracing();

    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Run {
            manifest,
            output,
            report,
            report_dir,
            concurrency,
            skip_checks,
        } => {
            run_batch(
                cfg,
                &manifest,
                output.as_deref(),
                report.as_deref(),
                report_dir.as_deref(),
                concurrency,
                skip_checks,
            )
            .await
        }
        Command::Probe { path } => probe_file(cfg, &path).await,
        Command::Check => check(cfg).await,
    }
}
