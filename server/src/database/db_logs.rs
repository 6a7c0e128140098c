//! Task execution log operations
//!
//! Free-form log lines attached to a task: one row per significant
//! transition (created, started, command dispatched, result received,
//! timeout, retry, cancel). The timeline endpoint is derived from these.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::ExecutionLogEntry;
use shared::utils::current_timestamp;

/// Create the task_execution_logs table.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_execution_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            level TEXT NOT NULL DEFAULT 'info',
            message TEXT NOT NULL,
            host_id TEXT,
            command_id TEXT,
            details TEXT,
            timestamp INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create task_execution_logs table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_execution_logs_task ON task_execution_logs(task_id, timestamp)",
        [],
    )?;

    Ok(())
}

/// Append one execution log line.
pub fn insert_log(
    conn: &Connection,
    task_id: &str,
    level: &str,
    message: &str,
    host_id: Option<&str>,
    command_id: Option<&str>,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO task_execution_logs (task_id, level, message, host_id, command_id, details, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            task_id,
            level,
            message,
            host_id,
            command_id,
            details.map(|d| d.to_string()),
            current_timestamp(),
        ],
    )
    .context("Failed to insert execution log entry")?;

    Ok(())
}

/// All log lines for a task, oldest first.
pub fn logs_for_task(conn: &Connection, task_id: &str) -> Result<Vec<ExecutionLogEntry>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, task_id, level, message, host_id, command_id, details, timestamp
            FROM task_execution_logs
            WHERE task_id = ?1
            ORDER BY timestamp, id
            "#,
        )
        .context("Failed to prepare execution log query")?;

    let entries = stmt
        .query_map(params![task_id], |row| {
            let details: Option<String> = row.get("details")?;
            Ok(ExecutionLogEntry {
                id: row.get("id")?,
                task_id: row.get("task_id")?,
                level: row.get("level")?,
                message: row.get("message")?,
                host_id: row.get("host_id")?,
                command_id: row.get("command_id")?,
                details: details.and_then(|d| serde_json::from_str(&d).ok()),
                timestamp: row.get("timestamp")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<ExecutionLogEntry>>>()
        .context("Failed to read execution logs")?;

    Ok(entries)
}

/// Delete log rows older than the cutoff. Returns the count.
pub fn delete_before(conn: &Connection, cutoff: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM task_execution_logs WHERE timestamp < ?1",
        params![cutoff],
    )
    .context("Failed to delete expired execution logs")
}
