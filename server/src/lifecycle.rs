//! Task and command lifecycle engine
//!
//! Owns every state transition of the task → command → command-host chain.
//! Each transition runs inside one database transaction together with the
//! progress recomputation for the owning task, so the task counters are
//! always consistent with the execution records at commit time. Audit, log
//! and cache side effects run after commit and are best-effort.
//!
//! Command delivery goes through the [`CommandSender`] seam so this module
//! never depends on the dispatcher directly; the dispatcher implements the
//! trait and is wired in at startup.

use crate::batch::{BatchUpdatePipeline, StatusUpdate};
use crate::cache::StatusCache;
use crate::database::{db_audit, db_commands, db_hosts, db_logs, db_results, db_stats, db_tasks};
use crate::database::ServerDatabase;
use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use shared::api::CreateTaskRequest;
use shared::model::{
    Command, CommandHostStatus, CommandStatus, ExecutionStatistics, Task, TaskPriority, TaskStatus,
};
use shared::protocol::{CommandContent, CommandResult};
use shared::utils::{current_timestamp, current_timestamp_millis};
use shared::ControlError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Error message recorded when the timeout monitor expires a command.
pub const TIMEOUT_ERROR_MSG: &str = "Command execution timeout";
/// Error message recorded when an agent's stream drops mid-run.
pub const DISCONNECT_ERROR_MSG: &str = "Agent disconnected";

/// One-way contract for pushing commands toward agents. The dispatcher
/// implements it; the lifecycle engine only sees this trait.
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Deliver a command to a host, or buffer it if the host is offline.
    /// An error means a live stream write failed.
    async fn send(&self, host_id: &str, content: CommandContent) -> Result<(), ControlError>;

    /// Best-effort cancel signal for a previously sent command.
    async fn send_cancel(&self, host_id: &str, command_id: &str) -> Result<(), ControlError>;
}

/// Aggregated per-host-status counts for one task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCounts {
    pub completed: u32,
    pub failed: u32,
    pub running: u32,
    pub pending: u32,
    pub canceled: u32,
}

impl ProgressCounts {
    fn from_status_map(counts: &HashMap<String, u32>) -> Self {
        let get = |key: &str| counts.get(key).copied().unwrap_or(0);
        Self {
            completed: get("completed"),
            // Dispatch failures, execution failures and timeouts all count
            // as failed hosts in the task aggregate.
            failed: get("failed") + get("exec_failed") + get("timeout"),
            running: get("running"),
            pending: get("pending"),
            canceled: get("canceled"),
        }
    }

    fn total_terminal(&self) -> u32 {
        self.completed + self.failed + self.canceled
    }
}

/// The lifecycle engine. One instance per server process, shared by the
/// API layer, the scheduler workers, the dispatcher and the timeout monitor.
pub struct LifecycleEngine {
    database: Arc<Mutex<ServerDatabase>>,
    sender: Arc<dyn CommandSender>,
    cache: StatusCache,
    batch: BatchUpdatePipeline,
    default_command_timeout: u64,
}

impl LifecycleEngine {
    pub fn new(
        database: Arc<Mutex<ServerDatabase>>,
        sender: Arc<dyn CommandSender>,
        cache: StatusCache,
        batch: BatchUpdatePipeline,
        default_command_timeout: u64,
    ) -> Self {
        Self {
            database,
            sender,
            cache,
            batch,
            default_command_timeout,
        }
    }

    /// Generate a unique identifier with a type prefix.
    fn generate_id(prefix: &str) -> String {
        format!(
            "{}-{:x}-{:04x}",
            prefix,
            current_timestamp_millis(),
            rand::random::<u16>()
        )
    }

    /// Create a task and materialize one command per target host, all in a
    /// single transaction. Fails fast when any target host is not approved;
    /// nothing is persisted in that case.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, ControlError> {
        shared::utils::validate_task_name(&request.name)
            .map_err(|e| ControlError::Validation(e.to_string()))?;
        if request.host_ids.is_empty() {
            return Err(ControlError::Validation(
                "Task must target at least one host".to_string(),
            ));
        }
        if request.command.trim().is_empty() {
            return Err(ControlError::Validation(
                "Task command cannot be empty".to_string(),
            ));
        }
        // Fail closed: a denied command never produces a pending command row.
        if let Some(pattern) = shared::utils::denied_command_pattern(&request.command) {
            return Err(ControlError::Validation(format!(
                "Command rejected by safety policy (matched {:?})",
                pattern
            )));
        }

        // Duplicate targets collapse to one command per host.
        let mut seen = std::collections::HashSet::new();
        let host_ids: Vec<String> = request
            .host_ids
            .iter()
            .filter(|h| seen.insert(h.as_str()))
            .cloned()
            .collect();

        let timeout_seconds = if request.timeout_seconds == 0 {
            self.default_command_timeout
        } else {
            request.timeout_seconds
        };

        let now = current_timestamp();
        let task = Task {
            task_id: Self::generate_id("task"),
            name: request.name.clone(),
            description: request.description.clone(),
            created_by: request.created_by.clone(),
            status: TaskStatus::Pending,
            total_hosts: host_ids.len() as u32,
            completed_hosts: 0,
            failed_hosts: 0,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut command_ids = Vec::with_capacity(host_ids.len());
        {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            // Every target must be approved before anything is inserted.
            for host_id in &host_ids {
                let approved = db_hosts::is_approved(&tx, host_id)
                    .map_err(|e| ControlError::Storage(e.to_string()))?;
                if !approved {
                    return Err(ControlError::Validation(format!(
                        "Host not approved: {}",
                        host_id
                    )));
                }
            }

            db_tasks::insert_task(&tx, &task, request.priority, &host_ids)
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            for host_id in &host_ids {
                let command = Command {
                    command_id: Self::generate_id("cmd"),
                    task_id: Some(task.task_id.clone()),
                    host_id: host_id.clone(),
                    command: request.command.clone(),
                    parameters: request.parameters.clone(),
                    timeout_seconds,
                    status: CommandStatus::Pending,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    started_at: None,
                    finished_at: None,
                    error_msg: String::new(),
                    created_at: now,
                };
                db_commands::insert_command(&tx, &command)
                    .map_err(|e| ControlError::Storage(e.to_string()))?;
                command_ids.push(command.command_id);
            }

            db_logs::insert_log(
                &tx,
                &task.task_id,
                "info",
                "Task created",
                None,
                None,
                Some(&serde_json::json!({ "hosts": host_ids.len() })),
            )
            .map_err(|e| ControlError::Storage(e.to_string()))?;

            tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
        }

        info!(
            task_id = %task.task_id,
            hosts = host_ids.len(),
            "Task created"
        );

        self.emit_audit(
            "task_created",
            "task",
            &task.task_id,
            None,
            &request.created_by,
            serde_json::json!({
                "name": request.name,
                "hosts": host_ids,
                "commands": command_ids,
                "priority": request.priority.as_str(),
            }),
        )
        .await;
        self.cache.invalidate_listings().await;
        self.cache.invalidate(crate::cache::KEY_TASK_STATS_GLOBAL).await;

        Ok(task)
    }

    /// Transition a pending task to running and hand its commands to the
    /// dispatcher. Sends happen outside the transaction; a failed send marks
    /// only that command failed, other commands are unaffected.
    pub async fn start_task(&self, task_id: &str) -> Result<(), ControlError> {
        let commands = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            let task = db_tasks::get_task(&tx, task_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
                .ok_or_else(|| ControlError::NotFound(format!("Task not found: {}", task_id)))?;

            if task.status != TaskStatus::Pending {
                return Err(ControlError::Conflict(format!(
                    "Task {} cannot be started from status {}",
                    task_id,
                    task.status.as_str()
                )));
            }

            db_tasks::update_task_progress(
                &tx,
                task_id,
                TaskStatus::Running,
                task.completed_hosts,
                task.failed_hosts,
                Some(current_timestamp()),
                None,
            )
            .map_err(|e| ControlError::Storage(e.to_string()))?;

            let commands = db_commands::active_commands_for_task(&tx, task_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            db_logs::insert_log(&tx, task_id, "info", "Task started", None, None, None)
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
            commands
        };

        info!(task_id = %task_id, commands = commands.len(), "Task started, dispatching commands");

        for command in &commands {
            let content = CommandContent {
                command_id: command.command_id.clone(),
                host_id: command.host_id.clone(),
                command: command.command.clone(),
                parameters: command.parameters.clone(),
                timeout_seconds: command.timeout_seconds,
                created_at: command.created_at,
            };

            if let Err(e) = self.sender.send(&command.host_id, content).await {
                warn!(
                    command_id = %command.command_id,
                    host_id = %command.host_id,
                    error = %e,
                    "Dispatch failed, marking command failed"
                );
                if let Err(mark_err) = self
                    .handle_command_execution_error(
                        &command.command_id,
                        &command.host_id,
                        &e.to_string(),
                    )
                    .await
                {
                    error!(
                        command_id = %command.command_id,
                        error = %mark_err,
                        "Failed to record dispatch failure"
                    );
                }
            }
        }

        self.emit_audit(
            "task_started",
            "task",
            task_id,
            None,
            "",
            serde_json::json!({ "commands": commands.len() }),
        )
        .await;
        self.cache.invalidate_task(task_id).await;
        self.cache.invalidate_listings().await;

        Ok(())
    }

    /// Cancel a task: all pending and running commands become canceled in
    /// one transaction, then a best-effort cancel signal goes to each
    /// affected agent.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), ControlError> {
        let affected = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            let task = db_tasks::get_task(&tx, task_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
                .ok_or_else(|| ControlError::NotFound(format!("Task not found: {}", task_id)))?;

            if task.status.is_terminal() {
                return Err(ControlError::Conflict(format!(
                    "Task {} is already {}",
                    task_id,
                    task.status.as_str()
                )));
            }

            let affected = db_commands::active_commands_for_task(&tx, task_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            for command in &affected {
                db_commands::update_command_pair(
                    &tx,
                    &command.command_id,
                    &command.host_id,
                    CommandHostStatus::Canceled,
                    None,
                    None,
                    None,
                    None,
                    None,
                    Some(current_timestamp()),
                    Some("Task canceled"),
                )
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            }

            Self::recompute_task_progress(&tx, task_id)?;

            db_logs::insert_log(
                &tx,
                task_id,
                "warn",
                "Task canceled",
                None,
                None,
                Some(&serde_json::json!({ "canceled_commands": affected.len() })),
            )
            .map_err(|e| ControlError::Storage(e.to_string()))?;

            tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
            affected
        };

        info!(task_id = %task_id, canceled = affected.len(), "Task canceled");

        // Best-effort: tell the agents to kill anything already running.
        for command in &affected {
            if let Err(e) = self
                .sender
                .send_cancel(&command.host_id, &command.command_id)
                .await
            {
                debug!(
                    command_id = %command.command_id,
                    host_id = %command.host_id,
                    error = %e,
                    "Cancel signal not delivered"
                );
            }
        }

        self.emit_audit(
            "task_canceled",
            "task",
            task_id,
            None,
            "",
            serde_json::json!({ "canceled_commands": affected.len() }),
        )
        .await;
        self.cache.invalidate_task(task_id).await;
        self.cache.invalidate_listings().await;

        Ok(())
    }

    /// Apply a result reported by an agent: upsert the snapshot, update the
    /// command pair, and recompute the owning task's progress, all in one
    /// transaction. Reapplying the same result is idempotent; a result for
    /// a command that already reached a terminal state does not revive it.
    pub async fn handle_command_result(&self, result: &CommandResult) -> Result<(), ControlError> {
        let execution_time_ms = match (result.started_at, result.finished_at) {
            (Some(start), Some(end)) if end >= start => Some((end - start) * 1000),
            _ => None,
        };

        let (task_id, host_status, already_terminal) = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            let command = db_commands::get_command(&tx, &result.command_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
                .ok_or_else(|| {
                    ControlError::NotFound(format!("Command not found: {}", result.command_id))
                })?;

            let error_message = result.error_message.clone().unwrap_or_default();
            db_results::upsert_result(
                &tx,
                &shared::model::CommandResultRecord {
                    command_id: result.command_id.clone(),
                    host_id: result.host_id.clone(),
                    stdout: result.stdout.clone(),
                    stderr: result.stderr.clone(),
                    exit_code: Some(result.exit_code),
                    started_at: result.started_at,
                    finished_at: result.finished_at,
                    execution_time_ms,
                    error_message: error_message.clone(),
                },
            )
            .map_err(|e| ControlError::Storage(e.to_string()))?;

            let host_status = if result.finished_at.is_some() {
                if result.exit_code == 0 {
                    CommandHostStatus::Completed
                } else {
                    CommandHostStatus::ExecFailed
                }
            } else if result.started_at.is_some() {
                CommandHostStatus::Running
            } else {
                CommandHostStatus::Pending
            };

            let already_terminal =
                command.status.is_terminal() && command.status != host_status.to_command_status();
            if already_terminal {
                // A late result for a command the server already closed
                // (timeout, disconnect, cancel) keeps its terminal state.
                tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
                (command.task_id, host_status, true)
            } else {
                db_commands::update_command_pair(
                    &tx,
                    &result.command_id,
                    &result.host_id,
                    host_status,
                    execution_time_ms,
                    Some(&result.stdout),
                    Some(&result.stderr),
                    Some(result.exit_code),
                    result.started_at,
                    result.finished_at,
                    Some(&error_message),
                )
                .map_err(|e| ControlError::Storage(e.to_string()))?;

                if let Some(task_id) = command.task_id.as_deref() {
                    Self::recompute_task_progress(&tx, task_id)?;
                    db_logs::insert_log(
                        &tx,
                        task_id,
                        if host_status == CommandHostStatus::Completed {
                            "info"
                        } else {
                            "warn"
                        },
                        "Command result received",
                        Some(&result.host_id),
                        Some(&result.command_id),
                        Some(&serde_json::json!({
                            "exit_code": result.exit_code,
                            "status": host_status.as_str(),
                        })),
                    )
                    .map_err(|e| ControlError::Storage(e.to_string()))?;
                }

                tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
                (command.task_id, host_status, false)
            }
        };

        if already_terminal {
            debug!(
                command_id = %result.command_id,
                "Late result for a closed command, terminal state kept"
            );
            return Ok(());
        }

        let action = if host_status == CommandHostStatus::Completed
            || host_status == CommandHostStatus::Running
        {
            "command_result"
        } else {
            "command_error"
        };
        self.emit_audit(
            action,
            "command",
            &result.command_id,
            Some(&result.host_id),
            "",
            serde_json::json!({
                "exit_code": result.exit_code,
                "status": host_status.as_str(),
            }),
        )
        .await;

        if let Some(task_id) = task_id.as_deref() {
            self.cache.invalidate_task(task_id).await;
        }

        Ok(())
    }

    /// Mark one in-flight command failed with the supplied reason, and
    /// recompute the owning task. Used for dispatch failures and agent-side
    /// execution errors. Terminal commands are left untouched.
    pub async fn handle_command_execution_error(
        &self,
        command_id: &str,
        host_id: &str,
        error_msg: &str,
    ) -> Result<(), ControlError> {
        let task_id = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            let command = db_commands::get_command(&tx, command_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
                .ok_or_else(|| {
                    ControlError::NotFound(format!("Command not found: {}", command_id))
                })?;

            if command.status.is_terminal() {
                return Ok(());
            }

            db_commands::update_command_pair(
                &tx,
                command_id,
                host_id,
                CommandHostStatus::Failed,
                None,
                None,
                None,
                None,
                None,
                Some(current_timestamp()),
                Some(error_msg),
            )
            .map_err(|e| ControlError::Storage(e.to_string()))?;

            if let Some(task_id) = command.task_id.as_deref() {
                Self::recompute_task_progress(&tx, task_id)?;
                db_logs::insert_log(
                    &tx,
                    task_id,
                    "error",
                    "Command failed",
                    Some(host_id),
                    Some(command_id),
                    Some(&serde_json::json!({ "error": error_msg })),
                )
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            }

            tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
            command.task_id
        };

        self.emit_audit(
            "command_error",
            "command",
            command_id,
            Some(host_id),
            "",
            serde_json::json!({ "error": error_msg }),
        )
        .await;
        if let Some(task_id) = task_id.as_deref() {
            self.cache.invalidate_task(task_id).await;
        }

        Ok(())
    }

    /// An agent's stream dropped: every command running on that host fails
    /// with a disconnect error. A later reconnect does not revive them.
    /// The writes go through the batch pipeline, which groups them into one
    /// multi-row update and recomputes affected tasks in one transaction.
    pub async fn handle_agent_disconnection(&self, host_id: &str) -> Result<(), ControlError> {
        let commands = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            db_commands::active_commands_for_host(conn, host_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
        };

        if commands.is_empty() {
            return Ok(());
        }

        warn!(
            host_id = %host_id,
            commands = commands.len(),
            "Agent disconnected with commands in flight"
        );

        for command in &commands {
            self.batch
                .submit(StatusUpdate {
                    command_id: command.command_id.clone(),
                    status: CommandStatus::Failed,
                    error_message: DISCONNECT_ERROR_MSG.to_string(),
                })
                .await
                .map_err(|e| ControlError::Storage(e.to_string()))?;
        }

        for command in &commands {
            self.emit_audit(
                "command_error",
                "command",
                &command.command_id,
                Some(host_id),
                "",
                serde_json::json!({ "error": DISCONNECT_ERROR_MSG }),
            )
            .await;
            if let Some(task_id) = command.task_id.as_deref() {
                self.cache.invalidate_task(task_id).await;
            }
        }

        Ok(())
    }

    /// Force a running command past its deadline into the timeout state.
    /// Returns true when the command was transitioned.
    pub async fn handle_command_timeout(&self, command_id: &str) -> Result<bool, ControlError> {
        let task_id = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            let command = db_commands::get_command(&tx, command_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
                .ok_or_else(|| {
                    ControlError::NotFound(format!("Command not found: {}", command_id))
                })?;

            // Only a running command with an elapsed deadline times out.
            let now = current_timestamp();
            let expired = command.status == CommandStatus::Running
                && command.timeout_seconds > 0
                && command
                    .started_at
                    .map(|started| started + (command.timeout_seconds as i64) < now)
                    .unwrap_or(false);
            if !expired {
                return Ok(false);
            }

            db_commands::update_command_pair(
                &tx,
                command_id,
                &command.host_id,
                CommandHostStatus::Timeout,
                None,
                None,
                None,
                None,
                None,
                Some(now),
                Some(TIMEOUT_ERROR_MSG),
            )
            .map_err(|e| ControlError::Storage(e.to_string()))?;

            if let Some(task_id) = command.task_id.as_deref() {
                Self::recompute_task_progress(&tx, task_id)?;
                db_logs::insert_log(
                    &tx,
                    task_id,
                    "error",
                    "Command timed out",
                    Some(&command.host_id),
                    Some(command_id),
                    Some(&serde_json::json!({ "timeout_seconds": command.timeout_seconds })),
                )
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            }

            tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
            command.task_id
        };

        self.emit_audit(
            "command_timeout",
            "command",
            command_id,
            None,
            "",
            serde_json::json!({}),
        )
        .await;
        if let Some(task_id) = task_id.as_deref() {
            self.cache.invalidate_task(task_id).await;
        }

        Ok(true)
    }

    /// Reset a failed or timed-out command to pending and resend it. The
    /// retried command is a fresh execution: every output field is cleared,
    /// history stays in the audit trail.
    pub async fn retry_failed_command(&self, command_id: &str) -> Result<(), ControlError> {
        let command = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            let command = db_commands::get_command(&tx, command_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
                .ok_or_else(|| {
                    ControlError::NotFound(format!("Command not found: {}", command_id))
                })?;

            if !matches!(
                command.status,
                CommandStatus::Failed | CommandStatus::Timeout
            ) {
                return Err(ControlError::Conflict(format!(
                    "Command {} cannot be retried from status {}",
                    command_id,
                    command.status.as_str()
                )));
            }

            db_commands::reset_command_for_retry(&tx, command_id, &command.host_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?;

            if let Some(task_id) = command.task_id.as_deref() {
                Self::recompute_task_progress(&tx, task_id)?;
                db_logs::insert_log(
                    &tx,
                    task_id,
                    "info",
                    "Command retried",
                    Some(&command.host_id),
                    Some(command_id),
                    None,
                )
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            }

            tx.commit().map_err(|e| ControlError::Storage(e.to_string()))?;
            command
        };

        let content = CommandContent {
            command_id: command.command_id.clone(),
            host_id: command.host_id.clone(),
            command: command.command.clone(),
            parameters: command.parameters.clone(),
            timeout_seconds: command.timeout_seconds,
            created_at: current_timestamp(),
        };

        if let Err(e) = self.sender.send(&command.host_id, content).await {
            warn!(
                command_id = %command_id,
                error = %e,
                "Retry dispatch failed"
            );
            self.handle_command_execution_error(command_id, &command.host_id, &e.to_string())
                .await?;
        }

        self.emit_audit(
            "command_retried",
            "command",
            command_id,
            Some(&command.host_id),
            "",
            serde_json::json!({}),
        )
        .await;
        if let Some(task_id) = command.task_id.as_deref() {
            self.cache.invalidate_task(task_id).await;
        }

        Ok(())
    }

    /// Recompute a task's counters and status from its execution records.
    /// Runs inside the caller's transaction. The terminal tie-break:
    /// canceled beats completed beats failed only through the rule
    /// "any canceled host ⇒ canceled, else no failed host ⇒ completed,
    /// else failed".
    pub fn recompute_task_progress(conn: &Connection, task_id: &str) -> Result<(), ControlError> {
        let task = db_tasks::get_task(conn, task_id)
            .map_err(|e| ControlError::Storage(e.to_string()))?
            .ok_or_else(|| ControlError::NotFound(format!("Task not found: {}", task_id)))?;

        let status_map = db_commands::host_status_counts(conn, task_id)
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        let counts = ProgressCounts::from_status_map(&status_map);

        let now = current_timestamp();
        let (status, started_at, finished_at) = if counts.total_terminal() == task.total_hosts {
            let status = if counts.canceled > 0 {
                TaskStatus::Canceled
            } else if counts.failed == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            // A task canceled before it ever ran keeps a null started_at.
            (status, None, Some(now))
        } else if counts.running > 0 || counts.completed > 0 {
            (TaskStatus::Running, Some(now), None)
        } else {
            (task.status, None, None)
        };

        db_tasks::update_task_progress(
            conn,
            task_id,
            status,
            counts.completed,
            counts.failed,
            started_at,
            finished_at,
        )
        .map_err(|e| ControlError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Recompute today's statistics rollup from the task and command tables.
    pub async fn rollup_statistics(&self) -> Result<(), ControlError> {
        let date = shared::utils::today_date_key();
        let day_start = chrono::Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        let day_end = day_start + 86_400;

        let mut db = self.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ControlError::Storage(e.to_string()))?;

        let task_counts = db_tasks::count_by_status_between(conn, day_start, day_end)
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        let command_counts = db_commands::count_by_status_between(conn, day_start, day_end)
            .map_err(|e| ControlError::Storage(e.to_string()))?;

        let pick = |counts: &[(String, i64)], key: &str| -> i64 {
            counts
                .iter()
                .find(|(status, _)| status == key)
                .map(|(_, count)| *count)
                .unwrap_or(0)
        };

        let stats = ExecutionStatistics {
            date: date.clone(),
            stat_type: "daily".to_string(),
            total_tasks: task_counts.iter().map(|(_, c)| c).sum(),
            completed_tasks: pick(&task_counts, "completed"),
            failed_tasks: pick(&task_counts, "failed"),
            canceled_tasks: pick(&task_counts, "canceled"),
            total_commands: command_counts.iter().map(|(_, c)| c).sum(),
            completed_commands: pick(&command_counts, "completed"),
            failed_commands: pick(&command_counts, "failed"),
            timeout_commands: pick(&command_counts, "timeout"),
            updated_at: current_timestamp(),
        };

        db_stats::upsert_statistics(conn, &stats)
            .map_err(|e| ControlError::Storage(e.to_string()))?;

        debug!(date = %date, "Statistics rollup updated");
        Ok(())
    }

    /// The task priority recorded at creation, for scheduler admission.
    pub async fn task_priority(&self, task_id: &str) -> Result<TaskPriority, ControlError> {
        let mut db = self.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        db_tasks::get_task_priority(conn, task_id)
            .map_err(|e| ControlError::Storage(e.to_string()))?
            .ok_or_else(|| ControlError::NotFound(format!("Task not found: {}", task_id)))
    }

    /// The host ids a task targets, for scheduler admission.
    pub async fn task_hosts(&self, task_id: &str) -> Result<Vec<String>, ControlError> {
        let mut db = self.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        db_tasks::get_task_hosts(conn, task_id)
            .map_err(|e| ControlError::Storage(e.to_string()))
    }

    /// Best-effort audit emission, after commit. Failures are logged and
    /// never block the state change that already happened.
    async fn emit_audit(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        host_id: Option<&str>,
        user_id: &str,
        details: serde_json::Value,
    ) {
        let mut db = self.database.lock().await;
        let result = db
            .get_connection()
            .and_then(|conn| db_audit::insert_audit(conn, action, entity_type, entity_id, host_id, user_id, &details));
        if let Err(e) = result {
            warn!(action = %action, error = %e, "Audit emission failed");
        }
    }
}
