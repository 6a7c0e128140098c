//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. They are applied by serde when a configuration
//! file omits the corresponding field.

// Agent defaults

/// Default per-request timeout for unary server calls (10 seconds)
pub fn default_request_timeout() -> u64 {
    10
}

/// Default reconnect/retry interval after a lost connection (5 seconds)
pub fn default_retry_interval() -> u64 {
    5
}

/// Default host status report interval (30 seconds)
pub fn default_report_interval() -> u64 {
    30
}

/// Default command timeout applied when a command specifies 0 (300 seconds)
pub fn default_command_timeout() -> u64 {
    300
}

/// Default cap on captured stdout/stderr per command (1 MiB)
pub fn default_max_output_bytes() -> usize {
    1024 * 1024
}

/// Default graceful shutdown timeout (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

/// Default log level directive
pub fn default_log_level() -> String {
    "info".to_string()
}

/// Default log format (`json` or `text`)
pub fn default_log_format() -> String {
    "json".to_string()
}

// Server defaults

/// Default data directory for the relational store
pub fn default_data_dir() -> String {
    "./data".to_string()
}

/// Default retention for terminal tasks, logs and audit rows (30 days)
pub fn default_data_retention_days() -> u32 {
    30
}

/// Default timeout monitor scan interval (30 seconds)
pub fn default_timeout_check_interval() -> u64 {
    30
}

/// Default cache sweep interval (60 seconds)
pub fn default_cache_cleanup_interval() -> u64 {
    60
}

/// Default statistics rollup interval (1 hour)
pub fn default_statistics_rollup_interval() -> u64 {
    3600
}

/// Default interval between retention sweeps (24 hours)
pub fn default_cleanup_interval_hours() -> u32 {
    24
}

/// Default delay before the first retention sweep (1 hour)
pub fn default_initial_cleanup_delay() -> u64 {
    3600
}

/// Default WAL checkpoint interval (60 seconds)
pub fn default_wal_checkpoint_interval() -> u64 {
    60
}

/// Default TTL for cached host status snapshots (120 seconds)
pub fn default_status_snapshot_ttl() -> u64 {
    120
}

// Scheduler defaults

/// Default global cap on in-flight tasks
pub fn default_max_concurrent_tasks() -> usize {
    10
}

/// Default cap on concurrent tasks per host
pub fn default_max_tasks_per_host() -> usize {
    2
}

/// Default admission queue capacity
pub fn default_queue_capacity() -> usize {
    1000
}

/// Default worker pool size
pub fn default_worker_count() -> usize {
    4
}

/// Default per-worker channel capacity
pub fn default_worker_channel_capacity() -> usize {
    16
}

/// Default scheduler tick interval (1000 ms)
pub fn default_scheduler_tick_ms() -> u64 {
    1000
}

/// Default adaptive throttling flag
pub fn default_adaptive_throttling() -> bool {
    true
}

/// Default system load ceiling above which admission pauses
pub fn default_system_load_threshold() -> f64 {
    85.0
}

/// Default host liveness sweep interval (60 seconds)
pub fn default_host_load_update_interval() -> u64 {
    60
}

// Load monitor defaults

/// Default load sample interval (5 seconds)
pub fn default_load_sample_interval() -> u64 {
    5
}

/// Default rolling window size (samples)
pub fn default_load_window_size() -> usize {
    1000
}

/// Default concurrency design cap used to normalize the concurrency signal
pub fn default_load_concurrency_cap() -> usize {
    100
}

/// Default warning threshold for the overload flag
pub fn default_load_warning_threshold() -> f64 {
    75.0
}

/// Default critical threshold for alert callbacks
pub fn default_load_critical_threshold() -> f64 {
    90.0
}

// Batch pipeline defaults

/// Default flush-by-size threshold
pub fn default_batch_size() -> usize {
    50
}

/// Default flush-by-time threshold (1000 ms)
pub fn default_batch_timeout_ms() -> u64 {
    1000
}

/// Default bounded queue capacity for batched updates
pub fn default_batch_queue_capacity() -> usize {
    1000
}
