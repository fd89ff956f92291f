//! Subprocess execution with captured output and a hard timeout.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::errors::ProviderError;

/// Default limit for a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Standard output, line-normalized.
    pub stdout: String,
    /// Standard error, line-normalized.
    pub stderr: String,
    /// Exit code, `-1` when killed by a signal.
    pub exit_code: i32,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Runs `path` with `args`, capturing both streams.
///
/// The child is killed when `limit` elapses. A non-zero exit status is an
/// error carrying the captured output.
pub async fn run_tool(
    path: &Path,
    args: &[&std::ffi::OsStr],
    limit: Duration,
) -> Result<ToolOutput, ProviderError> {
    let tool = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let start_time = Instant::now();

    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(tool = %tool, ?args, "Spawning tool");
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

    let captured_stdout = Arc::new(Mutex::new(String::new()));
    let captured_stderr = Arc::new(Mutex::new(String::new()));

    let stdout_cap = captured_stdout.clone();
    let stdout_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let mut s = stdout_cap.lock().await;
            s.push_str(&line);
            s.push('\n');
        }
    });

    let stderr_cap = captured_stderr.clone();
    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let mut s = stderr_cap.lock().await;
            s.push_str(&line);
            s.push('\n');
        }
    });

    let wait_task = async {
        let status = child.wait().await?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        Ok::<_, ProviderError>(status)
    };

    match timeout(limit, wait_task).await {
        Ok(res) => {
            let status = res?;
            let output = ToolOutput {
                stdout: captured_stdout.lock().await.clone(),
                stderr: captured_stderr.lock().await.clone(),
                exit_code: status.code().unwrap_or(-1),
                duration_ms: u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            if !status.success() {
                return Err(ProviderError::NonZeroExit {
                    tool,
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
            tracing::debug!(tool = %tool, duration_ms = output.duration_ms, "Tool finished");
            Ok(output)
        }
        Err(_) => {
            let _ = child.kill().await;
            Err(ProviderError::Timeout {
                tool,
                timeout: limit,
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn sh() -> &'static Path {
        Path::new("/bin/sh")
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let args = [OsStr::new("-c"), OsStr::new("echo out; echo err 1>&2")];
        let output = run_tool(sh(), &args, DEFAULT_TOOL_TIMEOUT).await.unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let args = [OsStr::new("-c"), OsStr::new("echo broken 1>&2; exit 3")];
        let err = run_tool(sh(), &args, DEFAULT_TOOL_TIMEOUT).await.unwrap_err();
        match err {
            ProviderError::NonZeroExit {
                tool,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(tool, "sh");
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "broken\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let args = [OsStr::new("-c"), OsStr::new("sleep 5")];
        let err = run_tool(sh(), &args, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let err = run_tool(Path::new("/nonexistent/tool"), &[], DEFAULT_TOOL_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Io(_)));
    }
}
