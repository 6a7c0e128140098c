//! Command result snapshot operations
//!
//! One terminal output snapshot per `(command_id, host_id)`. A second write
//! for the same pair upserts in place, which makes result handling
//! idempotent when an agent retransmits after a reconnect.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::CommandResultRecord;
use shared::utils::current_timestamp;

/// Create the command_results table.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS command_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            command_id TEXT NOT NULL,
            host_id TEXT NOT NULL,
            stdout TEXT NOT NULL DEFAULT '',
            stderr TEXT NOT NULL DEFAULT '',
            exit_code INTEGER,
            started_at INTEGER,
            finished_at INTEGER,
            execution_time_ms INTEGER,
            error_message TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            UNIQUE(command_id, host_id),
            FOREIGN KEY (command_id) REFERENCES commands (command_id) ON DELETE CASCADE
        )
        "#,
        [],
    )
    .context("Failed to create command_results table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_command_results_command ON command_results(command_id)",
        [],
    )?;

    Ok(())
}

/// Insert or replace the snapshot for `(command_id, host_id)`.
pub fn upsert_result(conn: &Connection, result: &CommandResultRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO command_results (command_id, host_id, stdout, stderr, exit_code,
                                     started_at, finished_at, execution_time_ms,
                                     error_message, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(command_id, host_id) DO UPDATE SET
            stdout = excluded.stdout,
            stderr = excluded.stderr,
            exit_code = excluded.exit_code,
            started_at = excluded.started_at,
            finished_at = excluded.finished_at,
            execution_time_ms = excluded.execution_time_ms,
            error_message = excluded.error_message
        "#,
        params![
            result.command_id,
            result.host_id,
            result.stdout,
            result.stderr,
            result.exit_code,
            result.started_at,
            result.finished_at,
            result.execution_time_ms,
            result.error_message,
            current_timestamp(),
        ],
    )
    .context("Failed to upsert command result")?;

    Ok(())
}

/// Fetch the snapshot for `(command_id, host_id)`.
pub fn get_result(
    conn: &Connection,
    command_id: &str,
    host_id: &str,
) -> Result<Option<CommandResultRecord>> {
    conn.query_row(
        "SELECT * FROM command_results WHERE command_id = ?1 AND host_id = ?2",
        params![command_id, host_id],
        |row| {
            Ok(CommandResultRecord {
                command_id: row.get("command_id")?,
                host_id: row.get("host_id")?,
                stdout: row.get("stdout")?,
                stderr: row.get("stderr")?,
                exit_code: row.get("exit_code")?,
                started_at: row.get("started_at")?,
                finished_at: row.get("finished_at")?,
                execution_time_ms: row.get("execution_time_ms")?,
                error_message: row.get("error_message")?,
            })
        },
    )
    .optional()
    .context("Failed to query command result")
}

/// Count of snapshots stored for a command (0 or 1 in the current design).
pub fn result_count(conn: &Connection, command_id: &str) -> Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM command_results WHERE command_id = ?1",
        params![command_id],
        |row| row.get(0),
    )
    .context("Failed to count command results")
}
