//! Configuration types and validation for the fleet command system
//!
//! This module defines the configuration structures used by both agent and
//! server components, including validation logic and serialization support.
//! Binaries load them from TOML files; every optional field falls back to a
//! conservative default from [`crate::defaults`].

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main agent configuration loaded from agent.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Stable identifier this host registers under
    pub host_id: String,
    /// Base URL of the central server's agent-facing API
    pub server_url: String,
    /// Optional pre-shared key sent on every request; empty disables auth
    #[serde(default)]
    pub api_key: String,
    /// Free-form labels reported with registration
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Per-request timeout for unary calls in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Reconnect / registration retry interval in seconds (default: 5)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
    /// Host status report interval in seconds (default: 30)
    #[serde(default = "default_report_interval")]
    pub report_interval_seconds: u64,
    /// Timeout applied to commands that specify 0 seconds (default: 300)
    #[serde(default = "default_command_timeout")]
    pub default_command_timeout_seconds: u64,
    /// Cap on captured stdout/stderr per command in bytes (default: 1 MiB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Wait time for in-flight commands during shutdown in seconds (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Log level directive used when RUST_LOG is not set (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format, `json` or `text` (default: json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl AgentConfig {
    /// Validate the agent configuration
    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validate_host_id(&self.host_id)?;

        if self.server_url.is_empty() {
            return Err(crate::ControlError::Validation(
                "server_url cannot be empty".to_string(),
            )
            .into());
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(crate::ControlError::Validation(
                "server_url must start with http:// or https://".to_string(),
            )
            .into());
        }
        if self.report_interval_seconds == 0 {
            return Err(crate::ControlError::Validation(
                "report_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }
        if self.retry_interval_seconds == 0 {
            return Err(crate::ControlError::Validation(
                "retry_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Parse and validate an agent configuration from TOML text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: AgentConfig = toml::from_str(content)
            .map_err(|e| crate::ControlError::Validation(format!("Invalid agent config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Worker selection strategy used by the task scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    LeastConnections,
    ResourceBased,
}

impl Default for LoadBalanceStrategy {
    fn default() -> Self {
        LoadBalanceStrategy::RoundRobin
    }
}

/// Scheduler tuning, `[scheduler]` section of server.toml.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    /// Global cap on in-flight tasks (default: 10)
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Cap on concurrent in-flight tasks per host id (default: 2)
    #[serde(default = "default_max_tasks_per_host")]
    pub max_tasks_per_host: usize,
    /// Admission bound; enqueueing fails at capacity (default: 1000)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Size of the worker pool (default: 4)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Per-worker dispatch channel capacity (default: 16)
    #[serde(default = "default_worker_channel_capacity")]
    pub worker_channel_capacity: usize,
    /// Worker selection strategy (default: round_robin)
    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,
    /// Whether the scheduler tunes max_concurrent_tasks at runtime (default: true)
    #[serde(default = "default_adaptive_throttling")]
    pub adaptive_throttling: bool,
    /// System load above which admission is paused (default: 85)
    #[serde(default = "default_system_load_threshold")]
    pub system_load_threshold: f64,
    /// Cadence of host liveness sweeps in seconds (default: 60)
    #[serde(default = "default_host_load_update_interval")]
    pub host_load_update_interval_seconds: u64,
    /// Scheduler tick interval in milliseconds (default: 1000)
    #[serde(default = "default_scheduler_tick_ms")]
    pub tick_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_tasks_per_host: default_max_tasks_per_host(),
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            worker_channel_capacity: default_worker_channel_capacity(),
            load_balance_strategy: LoadBalanceStrategy::default(),
            adaptive_throttling: default_adaptive_throttling(),
            system_load_threshold: default_system_load_threshold(),
            host_load_update_interval_seconds: default_host_load_update_interval(),
            tick_interval_ms: default_scheduler_tick_ms(),
        }
    }
}

/// System load monitor tuning, `[load_monitor]` section of server.toml.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadMonitorSettings {
    /// Sample interval in seconds (default: 5)
    #[serde(default = "default_load_sample_interval")]
    pub sample_interval_seconds: u64,
    /// Rolling window size in samples (default: 1000)
    #[serde(default = "default_load_window_size")]
    pub window_size: usize,
    /// Concurrency design cap the concurrency signal is normalized to (default: 100)
    #[serde(default = "default_load_concurrency_cap")]
    pub concurrency_cap: usize,
    /// Load at or above which the overload flag raises (default: 75)
    #[serde(default = "default_load_warning_threshold")]
    pub warning_threshold: f64,
    /// Load at or above which critical alerts fire (default: 90)
    #[serde(default = "default_load_critical_threshold")]
    pub critical_threshold: f64,
}

impl Default for LoadMonitorSettings {
    fn default() -> Self {
        Self {
            sample_interval_seconds: default_load_sample_interval(),
            window_size: default_load_window_size(),
            concurrency_cap: default_load_concurrency_cap(),
            warning_threshold: default_load_warning_threshold(),
            critical_threshold: default_load_critical_threshold(),
        }
    }
}

/// Batch update pipeline tuning, `[batch]` section of server.toml.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSettings {
    /// Flush when this many updates are buffered (default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush at least this often in milliseconds (default: 1000)
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Bounded queue capacity; a full queue makes callers write in-line (default: 1000)
    #[serde(default = "default_batch_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            queue_capacity: default_batch_queue_capacity(),
        }
    }
}

/// Main server configuration loaded from server.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address and port the operator API binds to
    pub listen_address: String,
    /// Address and port the agent-facing API (unary + command stream) binds to
    pub agent_listen_address: String,
    /// Optional pre-shared key agents must present; empty disables auth
    #[serde(default)]
    pub api_key: String,
    /// Directory holding the relational store (default: ./data)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Days to retain terminal tasks, logs and audit rows (default: 30)
    #[serde(default = "default_data_retention_days")]
    pub data_retention_days: u32,
    /// Timeout applied to commands that specify 0 seconds (default: 300)
    #[serde(default = "default_command_timeout")]
    pub default_command_timeout_seconds: u64,
    /// Timeout monitor scan interval in seconds (default: 30)
    #[serde(default = "default_timeout_check_interval")]
    pub timeout_check_interval_seconds: u64,
    /// Cache sweep interval in seconds (default: 60)
    #[serde(default = "default_cache_cleanup_interval")]
    pub cache_cleanup_interval_seconds: u64,
    /// Statistics rollup interval in seconds (default: 3600)
    #[serde(default = "default_statistics_rollup_interval")]
    pub statistics_rollup_interval_seconds: u64,
    /// Interval in hours between retention sweeps (default: 24)
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
    /// Delay before the first retention sweep in seconds (default: 3600)
    #[serde(default = "default_initial_cleanup_delay")]
    pub initial_cleanup_delay_seconds: u64,
    /// Graceful shutdown timeout in seconds (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// WAL checkpoint interval in seconds (default: 60)
    #[serde(default = "default_wal_checkpoint_interval")]
    pub wal_checkpoint_interval_seconds: u64,
    /// TTL for cached host status snapshots in seconds (default: 120)
    #[serde(default = "default_status_snapshot_ttl")]
    pub status_snapshot_ttl_seconds: u64,
    /// Log level directive used when RUST_LOG is not set (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format, `json` or `text` (default: json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Scheduler tuning
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Load monitor tuning
    #[serde(default)]
    pub load_monitor: LoadMonitorSettings,
    /// Batch update pipeline tuning
    #[serde(default)]
    pub batch: BatchSettings,
}

impl ServerConfig {
    /// Validate the server configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen_address.is_empty() {
            return Err(crate::ControlError::Validation(
                "listen_address cannot be empty".to_string(),
            )
            .into());
        }
        if self.agent_listen_address.is_empty() {
            return Err(crate::ControlError::Validation(
                "agent_listen_address cannot be empty".to_string(),
            )
            .into());
        }
        if self.scheduler.worker_count == 0 {
            return Err(crate::ControlError::Validation(
                "scheduler.worker_count must be at least 1".to_string(),
            )
            .into());
        }
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(crate::ControlError::Validation(
                "scheduler.max_concurrent_tasks must be at least 1".to_string(),
            )
            .into());
        }
        if self.scheduler.max_tasks_per_host == 0 {
            return Err(crate::ControlError::Validation(
                "scheduler.max_tasks_per_host must be at least 1".to_string(),
            )
            .into());
        }
        if !(0.0..=100.0).contains(&self.scheduler.system_load_threshold) {
            return Err(crate::ControlError::Validation(
                "scheduler.system_load_threshold must be within 0..=100".to_string(),
            )
            .into());
        }
        if self.batch.batch_size == 0 {
            return Err(crate::ControlError::Validation(
                "batch.batch_size must be at least 1".to_string(),
            )
            .into());
        }
        if self.load_monitor.window_size == 0 {
            return Err(crate::ControlError::Validation(
                "load_monitor.window_size must be at least 1".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Parse and validate a server configuration from TOML text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: ServerConfig = toml::from_str(content).map_err(|e| {
            crate::ControlError::Validation(format!("Invalid server config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}
