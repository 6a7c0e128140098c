//! Command timeout monitor
//!
//! Agents enforce per-command timeouts themselves, but an agent that dies
//! mid-command never reports back. This monitor is the server-side
//! backstop: it periodically scans running commands whose wall-clock
//! deadline has passed and forces them into the timeout state through the
//! lifecycle engine.

use crate::database::{db_commands, ServerDatabase};
use crate::lifecycle::LifecycleEngine;
use anyhow::Result;
use shared::utils::current_timestamp;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Periodic scanner for expired running commands.
pub struct TimeoutMonitor {
    database: Arc<Mutex<ServerDatabase>>,
    lifecycle: Arc<LifecycleEngine>,
    check_interval: Duration,
}

impl TimeoutMonitor {
    pub fn new(
        database: Arc<Mutex<ServerDatabase>>,
        lifecycle: Arc<LifecycleEngine>,
        check_interval_seconds: u64,
    ) -> Self {
        Self {
            database,
            lifecycle,
            check_interval: Duration::from_secs(check_interval_seconds.max(1)),
        }
    }

    /// Scan loop, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.check_interval);
        info!(
            interval_seconds = self.check_interval.as_secs(),
            "Timeout monitor started"
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!("Timeout scan failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Timeout monitor received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One scan: every running command past its deadline transitions to
    /// timeout. Returns the number of commands transitioned.
    pub async fn scan_once(&self) -> Result<usize> {
        let expired = {
            let mut db = self.database.lock().await;
            let conn = db.get_connection()?;
            db_commands::expired_running_commands(conn, current_timestamp())?
        };

        if expired.is_empty() {
            return Ok(0);
        }

        warn!(count = expired.len(), "Expired running commands found");

        let mut transitioned = 0;
        for command in expired {
            match self.lifecycle.handle_command_timeout(&command.command_id).await {
                Ok(true) => transitioned += 1,
                // The command finished between the scan and the transition.
                Ok(false) => {}
                Err(e) => {
                    error!(
                        command_id = %command.command_id,
                        error = %e,
                        "Failed to time out command"
                    );
                }
            }
        }

        Ok(transitioned)
    }

    /// Manual check of a single command, same logic as the periodic scan.
    pub async fn check_command_timeout(&self, command_id: &str) -> Result<bool> {
        Ok(self.lifecycle.handle_command_timeout(command_id).await?)
    }
}
