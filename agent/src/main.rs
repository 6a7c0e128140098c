//! Fleet Command Agent
//!
//! The agent is a lightweight service on each managed host. It registers
//! with the central server, reports host status periodically, and holds a
//! persistent command stream open: commands received on the stream are
//! executed under the platform shell and their results sent back on the
//! same stream.
// This is the main entry point for the agent application. It is responsible for:
// - Initializing logging and configuration.
// - Handling command-line arguments.
// - Running the registration, reporting and command stream loops.
// - Managing the application's lifecycle, including graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod client;
mod config;
mod executor;
mod status;

use client::AgentClient;
use config::ConfigManager;
use executor::CommandExecutor;

/// Command-line arguments for the agent
#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(about = "Agent that executes commands dispatched by the central server", long_about = None)]
struct CliArgs {
    /// Path to the configuration file (agent.toml) or its directory
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Override the host ID from config file
    #[arg(long = "host-id", value_name = "ID")]
    host_id: Option<String>,

    /// Override the central server URL from config file
    #[arg(long = "server-url", value_name = "URL")]
    server_url: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,
}

/// The main application structure for the agent.
pub struct Agent {
    pub config_manager: ConfigManager,
    report_task_handle: Option<JoinHandle<()>>,
    stream_task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Agent {
    /// Creates a new agent instance with its configuration loaded.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        Ok(Self {
            config_manager,
            report_task_handle: None,
            stream_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Runs the agent: registers with the server, then keeps the status
    /// report loop and the command stream running until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let agent_config = self
            .config_manager
            .agent_config
            .as_ref()
            .expect("Agent configuration not loaded. This should not happen as config is loaded in new().")
            .clone();

        info!(
            host_id = %agent_config.host_id,
            server_url = %agent_config.server_url,
            report_interval = agent_config.report_interval_seconds,
            "Agent configuration loaded"
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let command_executor = CommandExecutor::new(
            agent_config.default_command_timeout_seconds,
            agent_config.max_output_bytes,
        );
        let client = AgentClient::new(agent_config, command_executor)?;

        // Registration first; the loops below assume the server knows us
        // (and recover on their own if that changes).
        let mut register_shutdown_rx = shutdown_tx.subscribe();
        client.register_until_success(&mut register_shutdown_rx).await;

        let report_client = client.clone();
        let report_shutdown_rx = shutdown_tx.subscribe();
        self.report_task_handle = Some(tokio::spawn(async move {
            report_client.report_status_loop(report_shutdown_rx).await;
        }));

        let stream_client = client.clone();
        let stream_shutdown_rx = shutdown_tx.subscribe();
        self.stream_task_handle = Some(tokio::spawn(async move {
            stream_client.run_command_stream(stream_shutdown_rx).await;
        }));

        info!("Agent running");

        // Stay alive until shutdown is signalled.
        let mut shutdown_rx = shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        Ok(())
    }

    /// Performs a graceful shutdown: signal the loops, then wait for them
    /// with the configured timeout.
    pub async fn shutdown(&mut self) {
        info!("Shutting down agent gracefully");

        let shutdown_timeout_secs = self
            .config_manager
            .agent_config
            .as_ref()
            .map(|c| c.graceful_shutdown_timeout_seconds)
            .unwrap_or(30);

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        for (name, handle) in [
            ("status report", self.report_task_handle.take()),
            ("command stream", self.stream_task_handle.take()),
        ] {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(
                std::time::Duration::from_secs(shutdown_timeout_secs),
                handle,
            )
            .await
            {
                Ok(Ok(())) => info!("{} loop completed", name),
                Ok(Err(e)) => warn!("{} loop panicked: {}", name, e),
                Err(_) => warn!("{} loop shutdown timeout reached, aborting", name),
            }
        }

        info!("Agent shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
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

/// Initialize tracing with a daily-rolling file appender.
fn init_logging(log_level: &str, log_format: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("./logs", "agent.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "agent={level},shared={level}",
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

/// Agent entry point
#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let mut agent = match Agent::new(cli_args.config.clone()) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("Failed to initialize agent: {}", e);
            std::process::exit(1);
        }
    };

    let (log_level, log_format) = {
        let config = agent
            .config_manager
            .agent_config
            .as_ref()
            .expect("Agent configuration not loaded. This should not happen as config is loaded in new().");
        (config.log_level.clone(), config.log_format.clone())
    };
    let _guard = init_logging(&log_level, &log_format);

    info!("Fleet Command Agent starting up");
    info!("Configuration file: {}", cli_args.config.display());

    if cli_args.host_id.is_some() || cli_args.server_url.is_some() || cli_args.api_key.is_some() {
        match agent.config_manager.override_and_persist_config(
            cli_args.host_id,
            cli_args.server_url,
            cli_args.api_key,
        ) {
            Ok(true) => info!("Configuration overrides applied and persisted to disk"),
            Ok(false) => info!("Command-line values match existing config, no changes needed"),
            Err(e) => {
                error!("Failed to apply configuration overrides: {}", e);
                std::process::exit(1);
            }
        }
    }

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    agent.shutdown().await;
    info!("Agent shutdown complete");
    Ok(())
}


#[cfg(test)]
mod tests;
