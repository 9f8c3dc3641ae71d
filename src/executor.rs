//! External process execution
//!
//! [`ExternalExecutor`] is the only seam through which the server touches
//! the operating system's process table. [`ProcessExecutor`] runs real
//! binaries with `tokio::process`; tests substitute their own fakes.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::operations::CommandLine;

/// Maximum stderr captured per invocation (64 KiB)
///
/// The rest of the stream is drained and discarded so a chatty tool can
/// never block on a full pipe.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long to wait for stderr to close after the process exited
///
/// Tools that fork helpers (soffice) can leave the pipe open.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Result of a completed invocation
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Exit code, `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to start process: {0}")]
    Spawn(std::io::Error),

    #[error("Process exceeded {0:?} and was killed")]
    Timeout(Duration),

    #[error("IO error while waiting for process: {0}")]
    Io(std::io::Error),
}

/// Runs one command line to completion
#[async_trait]
pub trait ExternalExecutor: Send + Sync {
    /// Run `command` in `workdir`, killing it once `timeout` elapses
    async fn run(
        &self,
        command: &CommandLine,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<ExecOutcome, ExecError>;
}

/// Executor backed by real child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Check whether a binary can be started at all
    pub async fn is_available(program: &str) -> bool {
        let mut cmd = Command::new(program);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        matches!(
            tokio::time::timeout(Duration::from_secs(10), cmd.status()).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl ExternalExecutor for ProcessExecutor {
    async fn run(
        &self,
        command: &CommandLine,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<ExecOutcome, ExecError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Dropping the future (client went away) kills the child
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;

        tracing::debug!(
            tool = command.tool,
            pid = ?child.id(),
            timeout_secs = timeout.as_secs_f64(),
            "Spawned external tool"
        );

        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let abort = stderr_task.abort_handle();
                let stderr = match tokio::time::timeout(STDERR_DRAIN_GRACE, stderr_task).await {
                    Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(Err(_)) => String::new(),
                    Err(_) => {
                        // A forked helper still holds the pipe
                        abort.abort();
                        String::new()
                    }
                };

                Ok(ExecOutcome {
                    exit_code: status.code(),
                    stderr,
                    elapsed: start.elapsed(),
                })
            }
            Ok(Err(e)) => {
                stderr_task.abort();
                Err(ExecError::Io(e))
            }
            Err(_elapsed) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(tool = command.tool, error = %e, "Failed to kill timed out process");
                }
                // Reap so no zombie is left behind
                let _ = child.wait().await;
                stderr_task.abort();

                tracing::warn!(
                    tool = command.tool,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "External tool timed out"
                );
                Err(ExecError::Timeout(timeout))
            }
        }
    }
}

/// Read a stream to the end, keeping at most [`MAX_STDERR_BYTES`]
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut kept = Vec::new();
    let Some(mut handle) = handle else {
        return kept;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STDERR_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}
