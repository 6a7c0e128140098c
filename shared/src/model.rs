//! Domain model for tasks, commands and hosts
//!
//! These types describe the persisted state of the control plane. The server
//! stores them in its relational database; the operator API returns them in
//! responses. Status enums round-trip through their string form so the
//! database layer and the JSON layer agree on the vocabulary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }

    /// Terminal tasks never change status again and carry a finish timestamp.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Lifecycle status of a command (the per-host realization of a task).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Canceled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "running" => Ok(CommandStatus::Running),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "timeout" => Ok(CommandStatus::Timeout),
            "canceled" => Ok(CommandStatus::Canceled),
            _ => Err(anyhow::anyhow!("Invalid command status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Timeout
                | CommandStatus::Canceled
        )
    }
}

/// Per-host execution status, richer than [`CommandStatus`]: it separates
/// execution failures (the command ran and exited non-zero) from dispatch
/// failures (the command never reached the host).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandHostStatus {
    Pending,
    Running,
    Completed,
    ExecFailed,
    Failed,
    Timeout,
    Canceled,
}

impl CommandHostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandHostStatus::Pending => "pending",
            CommandHostStatus::Running => "running",
            CommandHostStatus::Completed => "completed",
            CommandHostStatus::ExecFailed => "exec_failed",
            CommandHostStatus::Failed => "failed",
            CommandHostStatus::Timeout => "timeout",
            CommandHostStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(CommandHostStatus::Pending),
            "running" => Ok(CommandHostStatus::Running),
            "completed" => Ok(CommandHostStatus::Completed),
            "exec_failed" => Ok(CommandHostStatus::ExecFailed),
            "failed" => Ok(CommandHostStatus::Failed),
            "timeout" => Ok(CommandHostStatus::Timeout),
            "canceled" => Ok(CommandHostStatus::Canceled),
            _ => Err(anyhow::anyhow!("Invalid command host status: {}", s)),
        }
    }

    /// The command-level status this per-host status mirrors to.
    pub fn to_command_status(&self) -> CommandStatus {
        match self {
            CommandHostStatus::Pending => CommandStatus::Pending,
            CommandHostStatus::Running => CommandStatus::Running,
            CommandHostStatus::Completed => CommandStatus::Completed,
            CommandHostStatus::ExecFailed | CommandHostStatus::Failed => CommandStatus::Failed,
            CommandHostStatus::Timeout => CommandStatus::Timeout,
            CommandHostStatus::Canceled => CommandStatus::Canceled,
        }
    }

    /// Whether this status counts as failed when task progress is aggregated.
    pub fn counts_as_failed(&self) -> bool {
        matches!(
            self,
            CommandHostStatus::ExecFailed | CommandHostStatus::Failed | CommandHostStatus::Timeout
        )
    }
}

/// Approval status of a registered host. Only approved hosts receive commands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl HostApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostApprovalStatus::Pending => "pending",
            HostApprovalStatus::Approved => "approved",
            HostApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(HostApprovalStatus::Pending),
            "approved" => Ok(HostApprovalStatus::Approved),
            "rejected" => Ok(HostApprovalStatus::Rejected),
            _ => Err(anyhow::anyhow!("Invalid host approval status: {}", s)),
        }
    }
}

/// Admission priority of a queued task. Higher values are admitted first;
/// ties break by enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

/// A managed host as stored in the relational database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub host_id: String,
    pub hostname: String,
    pub ip: String,
    pub os: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub status: HostApprovalStatus,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// An operator-submitted unit of work: one command fanned out to a set of hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_by: String,
    pub status: TaskStatus,
    pub total_hosts: u32,
    pub completed_hosts: u32,
    pub failed_hosts: u32,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The per-host realization of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub task_id: Option<String>,
    pub host_id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Wall-clock limit in seconds; 0 means "use the server default".
    pub timeout_seconds: u64,
    pub status: CommandStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub error_msg: String,
    pub created_at: i64,
}

/// The execution record of a command on one host. Kept 1:1 with [`Command`]
/// but stored separately so a command could later target several hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandHost {
    pub command_id: String,
    pub host_id: String,
    pub status: CommandHostStatus,
    pub execution_time_ms: Option<i64>,
    pub updated_at: i64,
}

/// Terminal output snapshot written when a command finishes on a host.
/// At most one row exists per `(command_id, host_id)`; a second write
/// upserts in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultRecord {
    pub command_id: String,
    pub host_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub execution_time_ms: Option<i64>,
    #[serde(default)]
    pub error_message: String,
}

/// Immutable audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    /// One of `task`, `command`, `host`.
    pub entity_type: String,
    pub entity_id: String,
    pub host_id: Option<String>,
    pub user_id: String,
    pub details: serde_json::Value,
    pub timestamp: i64,
}

/// Free-form execution log line attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub task_id: String,
    pub level: String,
    pub message: String,
    pub host_id: Option<String>,
    pub command_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub timestamp: i64,
}

/// Daily rollup of task and command counters, unique per `(date, stat_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub date: String,
    pub stat_type: String,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub canceled_tasks: i64,
    pub total_commands: i64,
    pub completed_commands: i64,
    pub failed_commands: i64,
    pub timeout_commands: i64,
    pub updated_at: i64,
}
