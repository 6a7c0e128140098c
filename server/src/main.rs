//! Fleet Command Central Server
//!
//! The central server accepts operator tasks, fans the commands out to the
//! agents on the targeted hosts, tracks per-host execution state, and
//! persists results for later inspection.
// This is the main entry point for the server application. It's responsible for:
// - Initializing logging and configuration.
// - Wiring the lifecycle engine, scheduler, dispatcher and monitors together.
// - Starting the operator and agent HTTP listeners.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod batch;
mod cache;
mod config;
mod database;
mod dispatcher;
mod kvstore;
mod lifecycle;
mod load_monitor;
mod registry;
mod scheduler;
mod timeout_monitor;

use batch::BatchUpdatePipeline;
use cache::StatusCache;
use config::ConfigManager;
use database::ServerDatabase;
use dispatcher::AgentDispatcher;
use kvstore::KvStore;
use lifecycle::LifecycleEngine;
use load_monitor::SystemLoadMonitor;
use registry::HostRegistry;
use scheduler::{TaskScheduler, TaskStarter};
use timeout_monitor::TimeoutMonitor;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Central server that dispatches commands to managed hosts", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the operator listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the agent-facing listen address from config file
    #[arg(long = "agent-listen-address", value_name = "ADDRESS")]
    agent_listen_address: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the data retention days from config file
    #[arg(long = "retention-days", value_name = "DAYS")]
    retention_days: Option<u32>,

    /// Override the data directory from config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,
}

/// The main application structure for the server. It owns the component
/// handles and the background task handles needed for graceful shutdown.
pub struct Server {
    /// The configuration manager, responsible for loading and accessing
    /// server settings.
    pub config_manager: ConfigManager,
    /// Operator API bind address.
    listen_address: SocketAddr,
    /// Agent-facing API bind address.
    agent_listen_address: SocketAddr,
    /// Database handle, shared with every component.
    database: Option<Arc<Mutex<ServerDatabase>>>,
    /// Handles to background tasks for graceful shutdown.
    scheduler_task_handle: Option<JoinHandle<()>>,
    timeout_monitor_task_handle: Option<JoinHandle<()>>,
    load_monitor_task_handle: Option<JoinHandle<()>>,
    maintenance_task_handle: Option<JoinHandle<()>>,
    statistics_task_handle: Option<JoinHandle<()>>,
    cleanup_task_handle: Option<JoinHandle<()>>,
    wal_checkpoint_task_handle: Option<JoinHandle<()>>,
    /// Shutdown signal sender for notifying background tasks.
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Server {
    /// Creates a new server instance: loads the configuration and parses
    /// the listen addresses.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let server_config = config_manager.server_config.as_ref().expect(
            "Server configuration not loaded. This should not happen as config is loaded in new().",
        );

        let listen_address: SocketAddr = server_config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid listen address '{}': {}",
                server_config.listen_address,
                e
            )
        })?;
        let agent_listen_address: SocketAddr =
            server_config.agent_listen_address.parse().map_err(|e| {
                anyhow::anyhow!(
                    "Invalid agent listen address '{}': {}",
                    server_config.agent_listen_address,
                    e
                )
            })?;

        Ok(Self {
            config_manager,
            listen_address,
            agent_listen_address,
            database: None,
            scheduler_task_handle: None,
            timeout_monitor_task_handle: None,
            load_monitor_task_handle: None,
            maintenance_task_handle: None,
            statistics_task_handle: None,
            cleanup_task_handle: None,
            wal_checkpoint_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Starts the server and runs until one of the listeners exits.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Fleet Command Central Server");

        let server_config = self
            .config_manager
            .server_config
            .as_ref()
            .expect("Server configuration not loaded. This should not happen as config is loaded in new().")
            .clone();

        info!(
            listen_address = %self.listen_address,
            agent_listen_address = %self.agent_listen_address,
            retention_days = server_config.data_retention_days,
            workers = server_config.scheduler.worker_count,
            "Server configuration loaded"
        );

        // Initialize the database
        info!("Initializing database");
        let data_dir = PathBuf::from(&server_config.data_dir);
        let mut database =
            ServerDatabase::new(&data_dir).context("Failed to create database manager")?;
        database
            .initialize()
            .await
            .context("Failed to initialize database")?;
        let database = Arc::new(Mutex::new(database));
        self.database = Some(Arc::clone(&database));
        info!("Database initialized successfully");

        // Create shutdown broadcast channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Shared in-process stores
        let kvstore = KvStore::new();
        let status_cache = StatusCache::new();

        // Batch pipeline first: the lifecycle engine writes through it.
        let batch_pipeline = BatchUpdatePipeline::start(
            server_config.batch.clone(),
            Arc::clone(&database),
            shutdown_tx.subscribe(),
        );

        // Dispatcher and lifecycle engine reference each other through the
        // one-way sender seam: the engine sees only the trait, and the
        // dispatcher gets its engine handle after construction.
        let agent_dispatcher = AgentDispatcher::new();
        let lifecycle_engine = Arc::new(LifecycleEngine::new(
            Arc::clone(&database),
            Arc::new(agent_dispatcher.clone()),
            status_cache.clone(),
            batch_pipeline.clone(),
            server_config.default_command_timeout_seconds,
        ));
        agent_dispatcher.set_lifecycle(Arc::clone(&lifecycle_engine));

        let host_registry = HostRegistry::new(
            Arc::clone(&database),
            kvstore.clone(),
            server_config.status_snapshot_ttl_seconds,
        );

        // Load monitor feeds the scheduler; the scheduler feeds the
        // monitor's concurrency gauge back.
        let active_gauge = Arc::new(AtomicUsize::new(0));
        let load_monitor = Arc::new(SystemLoadMonitor::new(
            server_config.load_monitor.clone(),
            Arc::clone(&active_gauge),
        ));
        self.load_monitor_task_handle = Some(tokio::spawn(
            Arc::clone(&load_monitor).run(shutdown_tx.subscribe()),
        ));

        // Surface threshold crossings in the server log.
        {
            let mut alerts = load_monitor.subscribe_alerts();
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        alert = alerts.recv() => match alert {
                            Ok(alert) => warn!(
                                dimension = alert.dimension,
                                value = alert.value,
                                level = ?alert.level,
                                "System load alert"
                            ),
                            Err(_) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        let task_scheduler = TaskScheduler::new(
            server_config.scheduler.clone(),
            Arc::clone(&lifecycle_engine) as Arc<dyn TaskStarter>,
            Arc::clone(&load_monitor),
            active_gauge,
        );
        task_scheduler.start().await;
        {
            let scheduler = task_scheduler.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            self.scheduler_task_handle = Some(tokio::spawn(async move {
                scheduler.run(shutdown_rx).await;
            }));
        }

        let timeout_monitor = Arc::new(TimeoutMonitor::new(
            Arc::clone(&database),
            Arc::clone(&lifecycle_engine),
            server_config.timeout_check_interval_seconds,
        ));
        self.timeout_monitor_task_handle = Some(tokio::spawn(
            Arc::clone(&timeout_monitor).run(shutdown_tx.subscribe()),
        ));

        // Periodic cache and key-value store sweeps
        {
            let cache = status_cache.clone();
            let kv = kvstore.clone();
            let interval_secs = server_config.cache_cleanup_interval_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.maintenance_task_handle = Some(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            cache.cleanup_expired().await;
                            kv.cleanup_expired().await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Maintenance task received shutdown signal");
                            break;
                        }
                    }
                }
            }));
        }

        // Periodic statistics rollup
        {
            let lifecycle = Arc::clone(&lifecycle_engine);
            let interval_secs = server_config.statistics_rollup_interval_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.statistics_task_handle = Some(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = lifecycle.rollup_statistics().await {
                                error!("Statistics rollup failed: {}", e);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Statistics task received shutdown signal");
                            break;
                        }
                    }
                }
            }));
        }

        // Periodic retention sweep for old data
        {
            let db = Arc::clone(&database);
            let retention_days = server_config.data_retention_days;
            let cleanup_interval_hours = server_config.cleanup_interval_hours;
            let initial_delay = server_config.initial_cleanup_delay_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.cleanup_task_handle = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                    (cleanup_interval_hours as u64) * 3600,
                ));

                // Run first cleanup after configured initial delay
                tokio::time::sleep(std::time::Duration::from_secs(initial_delay)).await;

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            info!("Running periodic database cleanup");
                            let mut db = db.lock().await;
                            if let Err(e) = db.cleanup_old_data(retention_days).await {
                                error!("Database cleanup failed: {}", e);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Cleanup task received shutdown signal");
                            break;
                        }
                    }
                }
            }));
        }

        // Periodic WAL checkpoint task
        {
            let db = Arc::clone(&database);
            let interval_secs = server_config.wal_checkpoint_interval_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.wal_checkpoint_task_handle = Some(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let mut db = db.lock().await;
                            match db.checkpoint_wal().await {
                                Ok(frames) => {
                                    if frames > 0 {
                                        info!("WAL checkpoint completed: {} frames", frames);
                                    }
                                }
                                Err(e) => warn!("WAL checkpoint failed: {}", e),
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("WAL checkpoint task received shutdown signal");
                            break;
                        }
                    }
                }
            }));
        }

        // Application state shared by both routers
        let app_state = api::AppState {
            config: Arc::new(server_config.clone()),
            database: Arc::clone(&database),
            lifecycle: Arc::clone(&lifecycle_engine),
            scheduler: task_scheduler.clone(),
            registry: host_registry.clone(),
            dispatcher: agent_dispatcher.clone(),
            cache: status_cache.clone(),
            load_monitor: Arc::clone(&load_monitor),
        };

        let operator_app = api::create_operator_router(app_state.clone());
        let agent_app = api::create_agent_router(app_state);

        info!("Starting operator API on {}", self.listen_address);
        let operator_listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind operator listener to {}. \
                     Check if port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        info!("Starting agent API on {}", self.agent_listen_address);
        let agent_listener = tokio::net::TcpListener::bind(self.agent_listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind agent listener to {}",
                    self.agent_listen_address
                )
            })?;

        let operator_shutdown = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("Operator HTTP server received shutdown signal");
            }
        };
        let agent_shutdown = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("Agent HTTP server received shutdown signal");
            }
        };

        // Run both listeners until either exits or shutdown is requested.
        let operator_server = async move {
            axum::serve(operator_listener, operator_app)
                .with_graceful_shutdown(operator_shutdown)
                .await
        };
        let agent_server = async move {
            axum::serve(agent_listener, agent_app)
                .with_graceful_shutdown(agent_shutdown)
                .await
        };

        tokio::select! {
            result = operator_server => {
                result.map_err(|e| anyhow::anyhow!("Operator server error: {}", e))?;
            }
            result = agent_server => {
                result.map_err(|e| anyhow::anyhow!("Agent server error: {}", e))?;
            }
        }

        Ok(())
    }

    /// Performs a graceful shutdown of the server.
    ///
    /// Shutdown sequence:
    /// 1. Broadcast shutdown signal to all background tasks
    /// 2. Wait for each background task (bounded by the configured timeout)
    /// 3. Close the database connection
    pub async fn shutdown(&mut self) {
        info!("Shutting down Fleet Command Central Server gracefully");

        let shutdown_timeout_secs = self
            .config_manager
            .server_config
            .as_ref()
            .map(|c| c.graceful_shutdown_timeout_seconds)
            .unwrap_or(30);

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        let handles = [
            ("scheduler", self.scheduler_task_handle.take()),
            ("timeout monitor", self.timeout_monitor_task_handle.take()),
            ("load monitor", self.load_monitor_task_handle.take()),
            ("maintenance", self.maintenance_task_handle.take()),
            ("statistics", self.statistics_task_handle.take()),
            ("cleanup", self.cleanup_task_handle.take()),
            ("WAL checkpoint", self.wal_checkpoint_task_handle.take()),
        ];

        for (name, handle) in handles {
            let Some(handle) = handle else { continue };
            info!(
                "Waiting for {} task to complete (timeout: {}s)",
                name, shutdown_timeout_secs
            );
            match tokio::time::timeout(
                std::time::Duration::from_secs(shutdown_timeout_secs),
                handle,
            )
            .await
            {
                Ok(Ok(())) => info!("{} task completed successfully", name),
                Ok(Err(e)) => warn!("{} task panicked: {}", name, e),
                Err(_) => warn!("{} task shutdown timeout reached, aborting", name),
            }
        }

        if let Some(database) = &self.database {
            info!("Closing database connection");
            let mut db = database.lock().await;
            db.close().await;
            info!("Database connection closed");
        }

        info!("Server shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
///
/// On Unix systems, handles SIGTERM and SIGINT signals.
/// On non-Unix systems, handles Ctrl+C.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                error!("Falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Initialize tracing with a daily-rolling JSON (or plain text) file
/// appender. The returned guard must stay alive for the process lifetime.
fn init_logging(log_level: &str, log_format: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG wins; the configured level is the fallback directive.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "server={level},shared={level}",
            level = log_level
        ))
    });

    if log_format == "text" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(non_blocking)
            .init();
    }

    guard
}

/// Server entry point
///
/// Loads configuration, initializes logging, creates the server instance,
/// and runs until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    // Create and initialize the server. Exit if initialization fails.
    let mut server = match Server::new(cli_args.config_file.clone()) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    // Logging is configured from the loaded configuration; RUST_LOG still
    // overrides the level.
    let (log_level, log_format) = {
        let config = server
            .config_manager
            .server_config
            .as_ref()
            .expect("Server configuration not loaded. This should not happen as config is loaded in new().");
        (config.log_level.clone(), config.log_format.clone())
    };
    let _guard = init_logging(&log_level, &log_format);

    info!("Fleet Command Central Server starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    // Apply command-line overrides if provided
    if cli_args.listen_address.is_some()
        || cli_args.agent_listen_address.is_some()
        || cli_args.api_key.is_some()
        || cli_args.retention_days.is_some()
        || cli_args.data_dir.is_some()
    {
        let changed = match server.config_manager.override_and_persist_config(
            cli_args.listen_address,
            cli_args.agent_listen_address,
            cli_args.api_key,
            cli_args.retention_days,
            cli_args.data_dir,
        ) {
            Ok(changed) => changed,
            Err(e) => {
                error!("Failed to apply configuration overrides: {}", e);
                std::process::exit(1);
            }
        };

        if changed {
            info!("Configuration overrides applied and persisted to disk");
            // Reload the parsed listen addresses after an override.
            let config = server
                .config_manager
                .server_config
                .as_ref()
                .expect("Server configuration not loaded. This should not happen as config is loaded in new().");
            server.listen_address = config.listen_address.parse().unwrap_or(server.listen_address);
            server.agent_listen_address = config
                .agent_listen_address
                .parse()
                .unwrap_or(server.agent_listen_address);
        } else {
            info!("Command-line values match existing config, no changes needed");
        }
    }

    // Run the server and the shutdown signal handler concurrently.
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    // Perform graceful shutdown.
    server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

// Unit tests for the main module.
#[cfg(test)]
mod main_tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_server_creation() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
listen_address = "127.0.0.1:8787"
agent_listen_address = "127.0.0.1:8788"
"#
        )
        .unwrap();

        let result = Server::new(temp_file.path().to_path_buf());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_server_rejects_bad_listen_address() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
listen_address = "not-an-address"
agent_listen_address = "127.0.0.1:8788"
"#
        )
        .unwrap();

        let result = Server::new(temp_file.path().to_path_buf());
        assert!(result.is_err());
    }
}

#[cfg(test)]
mod tests;
