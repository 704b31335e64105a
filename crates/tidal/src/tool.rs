//! External tool invocation
//!
//! Every ffprobe/ffmpeg call goes through the [`ToolRunner`] trait so the
//! probe and scorer can be exercised against a scripted fake. The production
//! implementation, [`ProcessRunner`], spawns the tool in its own process
//! group so a timeout or cancellation can take down the tool and anything it
//! forked, then reaps the direct child before returning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Keep at most this many bytes of stderr in error messages.
const STDERR_TAIL_BYTES: usize = 2000;

/// Error type for tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    /// The process could not be started (missing binary, permissions)
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero status
    #[error("{program} exited with code {code}: {stderr}")]
    Exited {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The process was terminated by a signal it did not ask for
    #[error("{program} was terminated by a signal: {stderr}")]
    Signaled { program: String, stderr: String },

    /// The process exceeded its time budget and was killed
    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    /// The caller cancelled the invocation and the process was killed
    #[error("{program} was cancelled")]
    Cancelled { program: String },

    /// IO error while collecting output
    #[error("IO error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Whether re-running the same invocation could plausibly succeed.
    ///
    /// Timeouts, cancellations and signal deaths (OOM killer, host shutdown)
    /// depend on host conditions; exit codes and spawn failures do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolError::TimedOut { .. } | ToolError::Cancelled { .. } | ToolError::Signaled { .. }
        )
    }
}

/// One external command to run
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Short program name for messages ("ffmpeg" rather than "/usr/bin/ffmpeg")
    pub fn program_name(&self) -> String {
        program_name(&self.program)
    }

    /// Arguments rendered lossily for logs and reports
    pub fn display_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string_lossy().into_owned())
}

/// Record of a finished tool invocation, kept in quality reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRecord {
    pub program: String,
    pub args: Vec<String>,
    pub elapsed_secs: f64,
    pub exit_code: Option<i32>,
}

impl InvocationRecord {
    pub fn new(invocation: &ToolInvocation, elapsed: Duration, exit_code: Option<i32>) -> Self {
        Self {
            program: invocation.program_name(),
            args: invocation.display_args(),
            elapsed_secs: elapsed.as_secs_f64(),
            exit_code,
        }
    }
}

/// Output captured from a successful tool run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub record: InvocationRecord,
}

/// Capability to run an external tool with a deadline.
///
/// Implementations must not return before the spawned process has exited or
/// been killed and reaped.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion, killing the process on timeout or cancellation.
    ///
    /// A non-zero exit is reported as [`ToolError::Exited`].
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}

/// [`ToolRunner`] backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

type Collected = (
    std::io::Result<std::process::ExitStatus>,
    std::io::Result<Vec<u8>>,
    std::io::Result<Vec<u8>>,
);

enum Finish {
    Completed(Collected),
    TimedOut,
    Cancelled,
}

/// SIGKILLs the tool's process group when dropped.
///
/// Lives for the whole invocation, so descendants that outlive the direct
/// child are taken down on every exit path, including the caller dropping
/// the `run` future.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // The child leads its own group (process_group(0)), so pgid == pid.
            // SAFETY: killpg only sends a signal; an already-gone group yields ESRCH.
            let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::debug!(pgid, error = %err, "killpg failed");
                }
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let program = invocation.program_name();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(
            program = %program,
            args = ?invocation.display_args(),
            timeout = ?invocation.timeout,
            "spawning tool"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;
        let group = ProcessGroupGuard { pgid: child.id() };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        // Output is only complete once every holder of the pipes is gone, so
        // the deadline covers reading them as well as the exit.
        let finish = tokio::select! {
            collected = async {
                tokio::join!(child.wait(), read_pipe(stdout_pipe), read_pipe(stderr_pipe))
            } => Finish::Completed(collected),
            _ = tokio::time::sleep(invocation.timeout) => Finish::TimedOut,
            _ = cancel.cancelled() => Finish::Cancelled,
        };

        let (status, stdout, stderr) = match finish {
            Finish::Completed(collected) => collected,
            Finish::TimedOut => {
                tracing::warn!(program = %program, timeout = ?invocation.timeout, "tool timed out, killing process group");
                terminate(&group, &mut child).await;
                return Err(ToolError::TimedOut {
                    program,
                    timeout: invocation.timeout,
                });
            }
            Finish::Cancelled => {
                tracing::info!(program = %program, "tool cancelled, killing process group");
                terminate(&group, &mut child).await;
                return Err(ToolError::Cancelled { program });
            }
        };
        // Background descendants that closed their pipes still die with the group.
        drop(group);

        let io_err = |source: std::io::Error| ToolError::Io {
            program: program.clone(),
            source,
        };
        let status = status.map_err(io_err)?;
        let stdout = String::from_utf8_lossy(&stdout.map_err(io_err)?).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.map_err(io_err)?).into_owned();
        let elapsed = started.elapsed();

        if !status.success() {
            let stderr = stderr_tail(&stderr);
            return match status.code() {
                Some(code) => Err(ToolError::Exited {
                    program,
                    code,
                    stderr,
                }),
                None => Err(ToolError::Signaled { program, stderr }),
            };
        }

        tracing::debug!(program = %program, elapsed = ?elapsed, "tool finished");

        Ok(ToolOutput {
            stdout,
            stderr,
            record: InvocationRecord::new(invocation, elapsed, status.code()),
        })
    }
}

/// Kill the child's whole process group, then reap the child.
async fn terminate(group: &ProcessGroupGuard, child: &mut Child) {
    group.kill();
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "kill after killpg failed");
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ToolInvocation {
        ToolInvocation::new("sh", timeout).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_record() {
        let runner = ProcessRunner::new();
        let inv = sh("echo hello", Duration::from_secs(10));
        let out = runner.run(&inv, &CancellationToken::new()).await.unwrap();

        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.record.program, "sh");
        assert_eq!(out.record.exit_code, Some(0));
        assert_eq!(out.record.args, vec!["-c".to_string(), "echo hello".to_string()]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error_with_stderr() {
        let runner = ProcessRunner::new();
        let inv = sh("echo broken input >&2; exit 3", Duration::from_secs(10));
        let err = runner.run(&inv, &CancellationToken::new()).await.unwrap_err();

        match err {
            ToolError::Exited { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("broken input"));
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let runner = ProcessRunner::new();
        let inv = ToolInvocation::new("nonexistent_tool_xyz_12345", Duration::from_secs(1));
        let err = runner.run(&inv, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert!(!err.is_transient());
    }

    /// True while /proc shows the pid as a live (non-zombie) process.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                // State follows the parenthesised command name.
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                !matches!(state, Some('Z') | Some('X') | None)
            }
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pids: &[u32]) -> bool {
        for _ in 0..50 {
            if pids.iter().all(|&p| !is_running(p)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    fn read_pids(path: &Path) -> Vec<u32> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pids");
        // The shell forks a grandchild and records both pids before blocking.
        let script = format!(
            "echo $$ > {p}; sleep 30 & echo $! >> {p}; wait",
            p = pid_file.display()
        );

        let runner = ProcessRunner::new();
        let inv = sh(&script, Duration::from_millis(300));
        let err = runner.run(&inv, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ToolError::TimedOut { .. }), "got {err:?}");
        assert!(err.is_transient());

        let pids = read_pids(&pid_file);
        assert_eq!(pids.len(), 2, "both pids should have been recorded");
        assert!(wait_until_gone(&pids).await, "processes still running: {pids:?}");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancellation_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pids");
        let script = format!(
            "echo $$ > {p}; sleep 30 & echo $! >> {p}; wait",
            p = pid_file.display()
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let runner = ProcessRunner::new();
        let inv = sh(&script, Duration::from_secs(60));
        let err = runner.run(&inv, &cancel).await.unwrap_err();

        assert!(matches!(err, ToolError::Cancelled { .. }), "got {err:?}");
        let pids = read_pids(&pid_file);
        assert_eq!(pids.len(), 2);
        assert!(wait_until_gone(&pids).await, "processes still running: {pids:?}");
    }

    #[tokio::test]
    async fn test_descendant_holding_pipes_cannot_outlive_timeout() {
        let runner = ProcessRunner::new();
        // The shell exits at once but its background child keeps stdout open.
        let inv = sh("sleep 8 & echo hi", Duration::from_secs(1));

        let started = Instant::now();
        let err = runner.run(&inv, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ToolError::TimedOut { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_descendant_killed_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pids");
        // The grandchild detaches from the pipes, so the run itself succeeds.
        let script = format!(
            "sleep 30 >/dev/null 2>&1 & echo $! > {p}; echo done",
            p = pid_file.display()
        );

        let runner = ProcessRunner::new();
        let out = runner
            .run(&sh(&script, Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "done");

        let pids = read_pids(&pid_file);
        assert_eq!(pids.len(), 1);
        assert!(wait_until_gone(&pids).await, "processes still running: {pids:?}");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropping_run_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pids");
        let script = format!(
            "echo $$ > {p}; sleep 30 & echo $! >> {p}; wait",
            p = pid_file.display()
        );

        let runner = ProcessRunner::new();
        let inv = sh(&script, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let outer = tokio::time::timeout(Duration::from_millis(300), runner.run(&inv, &cancel)).await;
        assert!(outer.is_err(), "run should still have been in flight");

        let pids = read_pids(&pid_file);
        assert_eq!(pids.len(), 2, "both pids should have been recorded");
        assert!(wait_until_gone(&pids).await, "processes still running: {pids:?}");
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(STDERR_TAIL_BYTES + 50) + "final error line";
        let tail = stderr_tail(&long);
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("final error line"));
        assert!(tail.len() <= STDERR_TAIL_BYTES + 3);
    }

    #[test]
    fn test_extract_log_path_unescapes() {
        let args = vec![
            "-lavfi".to_string(),
            r"[dist][ref]libvmaf=log_fmt=json:log_path=/tmp/my\ dir/vmaf\:1.json:n_threads=4"
                .to_string(),
        ];
        assert_eq!(
            fake::extract_log_path(&args),
            Some(PathBuf::from("/tmp/my dir/vmaf:1.json"))
        );
    }
}
