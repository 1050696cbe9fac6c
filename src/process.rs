// ABOUTME: Subprocess spawning with stdin input, timeout, and output-size safety limits
// ABOUTME: Used by the pwsh engine and the script analyzer to run one-shot commands
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

use crate::types::BridgeError;

/// Default maximum output size (10 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Captured result of a finished subprocess
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Captured standard output bytes
    pub stdout: Vec<u8>,
    /// Captured standard error bytes
    pub stderr: Vec<u8>,
    /// Process exit code (-1 if the process was killed by a signal)
    pub exit_code: i32,
    /// Wall-clock duration of the command
    pub duration: Duration,
}

impl ProcessOutput {
    /// Standard output as lossy UTF-8
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as lossy UTF-8
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Whether the process exited with code zero
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Read up to `limit` bytes, then keep draining so the child never blocks on a full pipe
pub(crate) async fn read_capped<R>(stream: Option<R>, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut reader) = stream {
        let mut tmp = [0u8; 8192];
        loop {
            match reader.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let remaining = limit.saturating_sub(buf.len());
                    buf.extend_from_slice(&tmp[..n.min(remaining)]);
                }
            }
        }
    }
    buf
}

/// Run a command to completion with optional stdin, a timeout, and output limits
///
/// Output is capped at `max_output_bytes` (zero selects the default cap).
/// On timeout the child is killed.
///
/// # Errors
///
/// Returns `BridgeError` if:
/// - The process cannot be spawned
/// - The process exceeds the timeout (killed and reported)
///
/// A non-zero exit code is not an error; callers inspect `exit_code`.
pub async fn run_command(
    cmd: &mut Command,
    stdin: Option<&str>,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ProcessOutput, BridgeError> {
    let effective_max = if max_output_bytes == 0 {
        DEFAULT_MAX_OUTPUT_BYTES
    } else {
        max_output_bytes
    };

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let start = Instant::now();

    let mut child = cmd
        .spawn()
        .map_err(|e| BridgeError::engine(format!("Failed to spawn process: {e}")))?;

    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), effective_max));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), effective_max));

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(input.as_bytes()).await {
            warn!(error = %e, "Failed to write process stdin");
        }
        // Dropping the pipe closes stdin so the child sees EOF
        drop(pipe);
    }

    let wait_result = tokio_timeout(timeout, child.wait()).await;
    let duration = start.elapsed();

    match wait_result {
        Ok(Ok(status)) => {
            let exit_code = status.code().unwrap_or(-1);
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();

            debug!(exit_code, ?duration, "Process completed");

            Ok(ProcessOutput {
                stdout,
                stderr,
                exit_code,
                duration,
            })
        }
        Ok(Err(e)) => Err(BridgeError::engine(format!(
            "Failed to wait for process: {e}"
        ))),
        Err(_) => {
            warn!(?timeout, "Process timed out, killing it");
            let _ = child.kill().await;
            Err(BridgeError::engine(format!(
                "Process timed out after {timeout:?}"
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; exit 3"]);
        let output = run_command(&mut cmd, None, Duration::from_secs(5), 0)
            .await
            .expect("ran");
        assert_eq!(output.stdout_text().trim(), "hello");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn feeds_stdin_and_closes_it() {
        let mut cmd = Command::new("cat");
        let output = run_command(&mut cmd, Some("piped input"), Duration::from_secs(5), 0)
            .await
            .expect("ran");
        assert_eq!(output.stdout_text(), "piped input");
    }

    #[tokio::test]
    async fn output_is_capped() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf '0123456789'"]);
        let output = run_command(&mut cmd, None, Duration::from_secs(5), 4)
            .await
            .expect("ran");
        assert_eq!(output.stdout, b"0123");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let err = run_command(&mut cmd, None, Duration::from_millis(50), 0)
            .await
            .expect_err("timed out");
        assert!(err.message.contains("timed out"));
    }
}
