//! Subprocess execution shared by the compiler, the validation probe and
//! event scripts.
//!
//! [`run_command`] spawns the prepared [`Command`], captures stdout and
//! stderr, and enforces an optional timeout plus a cancellation token.
//! Children are spawned with `kill_on_drop(true)`, so abandoning the wait
//! for either reason kills the process.

use std::process::Stdio;
use std::time::{Duration, Instant};

use gamehost_core::error::JobError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// What a finished process produced.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Stdout parsed as JSON, when it is valid JSON.
    pub parsed_output: Option<serde_json::Value>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Process cancelled")]
    Cancelled,
}

impl From<ProcessError> for JobError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled => JobError::Cancelled,
            other => JobError::internal(other),
        }
    }
}

/// Spawn `cmd`, capture its output and wait for it to exit.
///
/// The caller sets program, arguments and working directory beforehand.
pub async fn run_command(
    cmd: &mut Command,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    // Read the pipes on their own tasks so `child.wait()` can borrow `child`.
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
    let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = deadline => {
            return Err(ProcessError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
        }
        _ = token.cancelled() => return Err(ProcessError::Cancelled),
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
    let parsed_output = serde_json::from_str(stdout.trim()).ok();

    Ok(ProcessOutput {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        duration_ms: start.elapsed().as_millis() as u64,
        parsed_output,
    })
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let output = run_command(
            &mut sh("echo out; echo err >&2; exit 3"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.combined(), "out\nerr");
    }

    #[tokio::test]
    async fn parses_json_stdout() {
        let output = run_command(
            &mut sh(r#"echo '{"status":"requires_safe"}'"#),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output.parsed_output.unwrap()["status"], "requires_safe");
    }

    #[tokio::test]
    async fn timeout_abandons_the_process() {
        let result = run_command(
            &mut sh("sleep 5"),
            Some(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await;
        assert_matches!(result, Err(ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_abandons_the_process() {
        let token = CancellationToken::new();
        token.cancel();
        let result = run_command(&mut sh("sleep 5"), None, &token).await;
        assert_matches!(result, Err(ProcessError::Cancelled));
    }
}
