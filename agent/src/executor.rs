//! Command execution for the fleet agent
//!
//! This module is the "worker" part of the agent. The client decides *when*
//! a command runs (as they arrive on the stream); this module defines *what*
//! running a command means: safety validation, platform shell selection,
//! bounded output capture, timeout enforcement and cancellation.

use shared::utils::current_timestamp;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Duration;
use tracing::{debug, warn};

/// Exit code reported when the command could not be run at all.
pub const EXIT_COULD_NOT_RUN: i32 = -1;
/// Non-zero sentinel reported when the command exceeded its time budget.
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code reported when the command was canceled mid-run.
pub const EXIT_CANCELED: i32 = 130;

/// Error message reported for a timed-out command.
pub const TIMEOUT_ERROR: &str = "Command execution timeout";

/// The outcome of one command execution, as reported back to the server.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub started_at: i64,
    pub finished_at: i64,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn refused(error: String) -> Self {
        let now = current_timestamp();
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: EXIT_COULD_NOT_RUN,
            started_at: now,
            finished_at: now,
            error: Some(error),
        }
    }
}

/// Executes commands under the platform shell with per-command timeout and
/// a cancel handle keyed by command id. Cloning shares the handle table.
#[derive(Clone)]
pub struct CommandExecutor {
    default_timeout: Duration,
    max_output_bytes: usize,
    cancel_handles: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl CommandExecutor {
    pub fn new(default_timeout_seconds: u64, max_output_bytes: usize) -> Self {
        Self {
            default_timeout: Duration::from_secs(default_timeout_seconds.max(1)),
            max_output_bytes,
            cancel_handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Terminate a running command by id. Returns whether a running command
    /// was found.
    pub async fn cancel(&self, command_id: &str) -> bool {
        let handle = self.cancel_handles.lock().await.remove(command_id);
        match handle {
            Some(sender) => {
                debug!(command_id = %command_id, "Cancel requested");
                // A dropped receiver means the command just finished.
                sender.send(()).is_ok()
            }
            None => false,
        }
    }

    /// Number of commands currently in flight.
    pub async fn active_count(&self) -> usize {
        self.cancel_handles.lock().await.len()
    }

    /// Run one command to completion, timeout, or cancellation.
    ///
    /// A command that fails the safety check is refused without ever
    /// spawning a process.
    pub async fn execute(
        &self,
        command_id: &str,
        command_text: &str,
        timeout_seconds: u64,
    ) -> ExecutionOutcome {
        if command_text.trim().is_empty() {
            return ExecutionOutcome::refused("Empty command".to_string());
        }
        if let Some(pattern) = shared::utils::denied_command_pattern(command_text) {
            warn!(
                command_id = %command_id,
                pattern = %pattern,
                "Command refused by safety policy"
            );
            return ExecutionOutcome::refused(format!(
                "Command rejected by safety policy (matched {:?})",
                pattern
            ));
        }

        let timeout = if timeout_seconds == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(timeout_seconds)
        };

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.cancel_handles
            .lock()
            .await
            .insert(command_id.to_string(), cancel_tx);

        let outcome = self.run_in_shell(command_id, command_text, timeout, &mut cancel_rx).await;

        self.cancel_handles.lock().await.remove(command_id);
        outcome
    }

    async fn run_in_shell(
        &self,
        command_id: &str,
        command_text: &str,
        timeout: Duration,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> ExecutionOutcome {
        let started_at = current_timestamp();
        debug!(command_id = %command_id, timeout_secs = timeout.as_secs(), "Executing command");

        let mut child = match Self::shell_command(command_text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::refused(format!("Failed to spawn shell: {}", e));
            }
        };

        // Readers run alongside the child so a chatty process cannot fill
        // the pipe and deadlock; capture is capped at max_output_bytes.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let cap = self.max_output_bytes;
        let stdout_task =
            tokio::spawn(async move { read_capped(stdout_pipe, cap).await });
        let cap = self.max_output_bytes;
        let stderr_task =
            tokio::spawn(async move { read_capped(stderr_pipe, cap).await });

        let (exit_code, error) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (status.code().unwrap_or(EXIT_COULD_NOT_RUN), None),
                Err(e) => (EXIT_COULD_NOT_RUN, Some(format!("Wait failed: {}", e))),
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(command_id = %command_id, "Command timed out, killing process");
                if let Err(e) = child.kill().await {
                    warn!(command_id = %command_id, "Kill after timeout failed: {}", e);
                }
                (EXIT_TIMED_OUT, Some(TIMEOUT_ERROR.to_string()))
            }
            _ = &mut *cancel_rx => {
                debug!(command_id = %command_id, "Command canceled, killing process");
                if let Err(e) = child.kill().await {
                    warn!(command_id = %command_id, "Kill after cancel failed: {}", e);
                }
                (EXIT_CANCELED, Some("Command canceled".to_string()))
            }
        };

        // The readers finish once the process (or its kill) closes the pipes.
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let finished_at = current_timestamp();
        debug!(
            command_id = %command_id,
            exit_code = exit_code,
            duration_secs = finished_at - started_at,
            "Command finished"
        );

        ExecutionOutcome {
            stdout,
            stderr,
            exit_code,
            started_at,
            finished_at,
            error,
        }
    }

    /// The platform shell: POSIX `sh -c` on Unix-like systems, `cmd /C` on
    /// Windows.
    fn shell_command(command_text: &str) -> Command {
        #[cfg(not(target_os = "windows"))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command_text);
            cmd
        }
        #[cfg(target_os = "windows")]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command_text);
            cmd
        }
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes. Lossy UTF-8 so binary
/// output cannot poison the result frame.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };

    let mut collected: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if collected.len() < cap {
                    let keep = n.min(cap - collected.len());
                    collected.extend_from_slice(&buffer[..keep]);
                    if keep < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&collected).into_owned();
    if truncated {
        text.push_str("\n[output truncated]");
    }
    text
}
