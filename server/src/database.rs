//! Database management for the fleet command central server
//!
//! This module handles SQLite database operations for the control plane:
//! tasks, commands, per-host execution records, result snapshots, hosts,
//! audit trail, execution logs and statistics rollups.
// The relational store is the single source of truth for task and command
// state. Every state change that crosses an entity boundary (command ->
// command_host -> task progress) runs inside one transaction so no partial
// state is ever observable. SQLite keeps the server self-contained; the
// module could be adapted to a client/server database without touching the
// callers.

// Table-specific database modules
pub mod db_audit;
pub mod db_commands;
pub mod db_hosts;
pub mod db_logs;
pub mod db_results;
pub mod db_stats;
pub mod db_tasks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The default name for the server's database file.
const DATABASE_FILE: &str = "fleet_control.db";

/// Manages the SQLite database for the server.
/// This struct encapsulates the database connection and all related
/// operations, providing a clean, high-level API to the rest of the server.
pub struct ServerDatabase {
    /// The path to the SQLite database file.
    db_path: PathBuf,
    /// The active database connection. It's an `Option` to allow for lazy
    /// initialization and handling of connection state.
    connection: Option<Connection>,
}

impl ServerDatabase {
    /// Creates a new `ServerDatabase` manager.
    /// It ensures that the directory for the database file exists.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        let db_path = data_dir.join(DATABASE_FILE);

        Ok(Self {
            db_path,
            connection: None,
        })
    }

    /// Initializes the database by creating tables and indexes if they don't
    /// exist. The migration is one ordered script; this method is idempotent
    /// and safe to call on every server startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing server database at {}", self.db_path.display());

        let conn = self.get_connection()?;

        db_hosts::create_table(conn)?;
        db_tasks::create_table(conn)?;
        db_commands::create_table(conn)?;
        db_results::create_table(conn)?;
        db_audit::create_table(conn)?;
        db_logs::create_table(conn)?;
        db_stats::create_table(conn)?;

        info!("Server database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection, creating it if needed.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode is good for concurrency.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            // Configure WAL auto-checkpoint to prevent unbounded WAL file growth.
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            // Enforce foreign key constraints at the database level so a task
            // always owns its commands (deleting a task deletes them).
            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign key constraints")?;

            // Set a busy timeout to reduce errors in a concurrent environment.
            conn.busy_timeout(std::time::Duration::from_secs(30))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self
            .connection
            .as_mut()
            .expect("Database connection should exist after initialization in get_connection()"))
    }

    /// Performs a manual WAL checkpoint, returning the number of frames
    /// checkpointed.
    pub async fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let (busy, log_frames, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .context("Failed to run WAL checkpoint")?;

        if busy != 0 {
            warn!("WAL checkpoint could not complete: database busy");
        }
        debug!(
            log_frames = log_frames,
            checkpointed = checkpointed,
            "WAL checkpoint finished"
        );
        Ok(checkpointed)
    }

    /// Deletes terminal tasks (cascading to their commands), execution logs
    /// and audit rows older than the retention window. Returns the number of
    /// tasks removed.
    pub async fn cleanup_old_data(&mut self, retention_days: u32) -> Result<usize> {
        let cutoff = shared::utils::current_timestamp() - (retention_days as i64) * 86_400;
        let conn = self.get_connection()?;

        let tx = conn
            .transaction()
            .context("Failed to begin cleanup transaction")?;

        let removed_tasks = db_tasks::delete_terminal_before(&tx, cutoff)?;
        let removed_logs = db_logs::delete_before(&tx, cutoff)?;
        let removed_audit = db_audit::delete_before(&tx, cutoff)?;

        tx.commit().context("Failed to commit cleanup transaction")?;

        info!(
            removed_tasks = removed_tasks,
            removed_logs = removed_logs,
            removed_audit = removed_audit,
            cutoff = cutoff,
            "Retention sweep complete"
        );
        Ok(removed_tasks)
    }

    /// Closes the database connection.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            // A final checkpoint keeps the WAL small across restarts.
            if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                warn!("Final WAL checkpoint failed: {}", e);
            }
            drop(conn);
            debug!("Database connection closed");
        }
    }
}
