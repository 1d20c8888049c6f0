//! Timeout-bounded, non-interactive command execution.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hostlink_core::PolicyError;
use hostlink_core::frame::CHUNK_SIZE;

use crate::process::exit_code;

/// Result of one gateway tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// The command ran to completion. Non-zero codes are reported as a
    /// call-level error, not a transport failure.
    Exited { exit_code: i32, output: String },
    /// The wall-clock limit expired and the command was killed.
    TimedOut { after: Duration, output: String },
    /// Whitelist or confinement refused the call; nothing ran.
    Rejected(PolicyError),
    /// The command was authorized but could not be started.
    SpawnFailed(String),
}

impl ToolOutcome {
    pub const fn is_error(&self) -> bool {
        !matches!(self, Self::Exited { exit_code: 0, .. })
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Stable machine-readable status name.
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Exited { .. } => "exited",
            Self::TimedOut { .. } => "timed_out",
            Self::Rejected(_) => "rejected",
            Self::SpawnFailed(_) => "spawn_failed",
        }
    }

    /// Human-readable text for the tool result.
    pub fn text(&self) -> String {
        match self {
            Self::Exited {
                exit_code: 0,
                output,
            } => output.clone(),
            Self::Exited { exit_code, output } => {
                format!("exit status {exit_code}\n{output}")
            }
            Self::TimedOut { after, output } => {
                format!("command timed out after {}s\n{output}", after.as_secs())
            }
            Self::Rejected(reason) => format!("rejected: {reason}"),
            Self::SpawnFailed(reason) => format!("failed to start: {reason}"),
        }
    }

    pub fn structured(&self) -> Value {
        match self {
            Self::Exited { exit_code, output } => json!({
                "status": self.status(),
                "exit_code": exit_code,
                "output": output,
            }),
            Self::TimedOut { after, output } => json!({
                "status": self.status(),
                "timeout_secs": after.as_secs(),
                "output": output,
            }),
            Self::Rejected(reason) => json!({
                "status": self.status(),
                "reason": reason.to_string(),
            }),
            Self::SpawnFailed(reason) => json!({
                "status": self.status(),
                "reason": reason,
            }),
        }
    }
}

/// Run `command` with stdin closed, capturing stdout and stderr into one
/// buffer in arrival order, and kill its process group if it outlives
/// `timeout`.
pub async fn run_captured(mut command: Command, timeout: Duration) -> ToolOutcome {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Gateway spawn failed");
            return ToolOutcome::SpawnFailed(e.to_string());
        }
    };
    let pid = child.id();
    debug!(?pid, "Gateway command started");

    let output = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain_into(pipe, Arc::clone(&output))));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain_into(pipe, Arc::clone(&output))));

    let finished = tokio::time::timeout(timeout, async {
        let status = child.wait().await;
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }
        status
    })
    .await;

    match finished {
        Ok(Ok(status)) => {
            let code = exit_code(status);
            info!(?pid, exit_code = code, "Gateway command finished");
            ToolOutcome::Exited {
                exit_code: code,
                output: take_output(&output).await,
            }
        }
        Ok(Err(e)) => ToolOutcome::SpawnFailed(format!("failed waiting for process: {e}")),
        Err(_) => {
            warn!(?pid, timeout_secs = timeout.as_secs(), "Gateway command timed out, killing");
            kill_group(pid);
            let _ = child.start_kill();
            let _ = child.wait().await;
            ToolOutcome::TimedOut {
                after: timeout,
                output: take_output(&output).await,
            }
        }
    }
}

async fn drain_into<R>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => sink.lock().await.extend_from_slice(&buf[..n]),
        }
    }
}

async fn take_output(output: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&output.lock().await).into_owned()
}

fn kill_group(pid: Option<u32>) {
    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid = raw, error = %e, "killpg failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_together() {
        let outcome = run_captured(sh("echo out; echo err >&2"), Duration::from_secs(10)).await;
        let ToolOutcome::Exited { exit_code, output } = outcome else {
            panic!("unexpected outcome");
        };
        assert_eq!(exit_code, 0);
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error_but_not_a_timeout() {
        let outcome = run_captured(sh("echo failing; exit 3"), Duration::from_secs(10)).await;
        assert!(outcome.is_error());
        assert!(!outcome.is_timeout());
        assert_eq!(
            outcome,
            ToolOutcome::Exited {
                exit_code: 3,
                output: "failing\n".into()
            }
        );
        assert!(outcome.text().starts_with("exit status 3"));
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_group() {
        let started = std::time::Instant::now();
        let outcome = run_captured(
            sh("echo started; sleep 30 & sleep 30"),
            Duration::from_millis(300),
        )
        .await;
        assert!(outcome.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.structured()["status"], "timed_out");
    }

    #[tokio::test]
    async fn stdin_is_closed() {
        let outcome = run_captured(Command::new("cat"), Duration::from_secs(10)).await;
        assert_eq!(
            outcome,
            ToolOutcome::Exited {
                exit_code: 0,
                output: String::new()
            }
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let outcome = run_captured(
            Command::new("hostlink-definitely-not-a-command"),
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(outcome, ToolOutcome::SpawnFailed(_)));
        assert!(outcome.is_error());
    }
}
