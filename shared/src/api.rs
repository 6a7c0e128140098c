//! HTTP API types for operator and agent communication
//!
//! This module defines the request and response types used by the REST
//! endpoints: the unary host service the agents call, and the operator
//! surface used to create and observe tasks.

use crate::model::{TaskPriority, TaskStatus};
use crate::protocol::{HostInfo, HostStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generic response envelope returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// Create a successful response carrying a payload.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_message: None,
            message: None,
        }
    }

    /// Create a successful response with a human-readable note and no payload.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            error_message: None,
            message: Some(message.into()),
        }
    }

    /// Create an error response.
    pub fn error(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_message: Some(error_message.into()),
            message: None,
        }
    }
}

/// Request body for POST /api/v1/hosts/register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub host: HostInfo,
}

/// Response body for POST /api/v1/hosts/register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    /// The id the server filed the host under (echoes the requested id).
    #[serde(default)]
    pub assigned_id: String,
    #[serde(default)]
    pub error_message: String,
}

/// Request body for POST /api/v1/hosts/status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReportRequest {
    pub status: HostStatus,
}

/// Response body for POST /api/v1/hosts/status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatusResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Request body for POST /api/v1/tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Approved host ids the command fans out to.
    pub host_ids: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// 0 means "use the server default".
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub created_by: String,
}

/// Query parameters for GET /api/v1/tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One page of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListPage {
    pub tasks: Vec<crate::model::Task>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

/// Aggregated progress for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_hosts: u32,
    pub completed_hosts: u32,
    pub failed_hosts: u32,
    pub running_hosts: u32,
    pub pending_hosts: u32,
    pub canceled_hosts: u32,
    /// 0–100, floor of completed+failed+canceled over total.
    pub percent: u32,
}

/// Per-command-state counts and duration statistics for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub counts: HashMap<String, u32>,
    pub avg_execution_time_ms: Option<i64>,
    pub max_execution_time_ms: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// One entry in a task timeline: a significant transition in time order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: i64,
    pub event: String,
    pub host_id: Option<String>,
    pub command_id: Option<String>,
    pub detail: Option<String>,
}

/// A host awaiting operator approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHostView {
    pub host: HostInfo,
    pub first_seen: i64,
}

/// Current system load as exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLoadView {
    /// Composite 0–100 load scalar.
    pub load: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub concurrency_percent: f64,
    pub recommended_concurrency: usize,
    pub overloaded: bool,
    pub window: LoadWindowStats,
}

/// Mean/min/max per dimension over the rolling sample window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadWindowStats {
    pub samples: usize,
    pub load_mean: f64,
    pub load_min: f64,
    pub load_max: f64,
    pub cpu_mean: f64,
    pub memory_mean: f64,
    pub concurrency_mean: f64,
}

/// Query parameters for GET /api/v1/audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// Query parameters for GET /api/v1/hosts/{id}/tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostTasksQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub status: Option<crate::model::CommandStatus>,
}

/// HTTP headers used for authentication and identification.
pub mod headers {
    pub const API_KEY: &str = "X-API-Key";
    pub const HOST_ID: &str = "X-Host-Id";
}

/// API endpoint paths. Defined once so the agent and the server always agree.
pub mod endpoints {
    // Agent-facing host service
    pub const HOST_REGISTER: &str = "/api/v1/hosts/register";
    pub const HOST_STATUS: &str = "/api/v1/hosts/status";
    pub const COMMAND_STREAM: &str = "/api/v1/hosts/stream";

    // Operator surface
    pub const TASKS: &str = "/api/v1/tasks";
    pub const PENDING_HOSTS: &str = "/api/v1/pending-hosts";
    pub const HOSTS: &str = "/api/v1/hosts";
    pub const COMMANDS: &str = "/api/v1/commands";
    pub const AUDIT: &str = "/api/v1/audit";
    pub const STATISTICS: &str = "/api/v1/statistics";
    pub const SYSTEM_LOAD: &str = "/api/v1/system/load";
}
