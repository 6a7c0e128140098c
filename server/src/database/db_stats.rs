//! Execution statistics rollup operations
//!
//! Daily counters per `(date, stat_type)`. The rollup job recomputes the
//! current day's row from the task and command tables; an upsert keeps the
//! pair unique.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::ExecutionStatistics;
use shared::utils::current_timestamp;

/// Create the execution_statistics table.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS execution_statistics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            stat_type TEXT NOT NULL,
            total_tasks INTEGER NOT NULL DEFAULT 0,
            completed_tasks INTEGER NOT NULL DEFAULT 0,
            failed_tasks INTEGER NOT NULL DEFAULT 0,
            canceled_tasks INTEGER NOT NULL DEFAULT 0,
            total_commands INTEGER NOT NULL DEFAULT 0,
            completed_commands INTEGER NOT NULL DEFAULT 0,
            failed_commands INTEGER NOT NULL DEFAULT 0,
            timeout_commands INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            UNIQUE(date, stat_type)
        )
        "#,
        [],
    )
    .context("Failed to create execution_statistics table")?;

    Ok(())
}

/// Insert or replace one rollup row.
pub fn upsert_statistics(conn: &Connection, stats: &ExecutionStatistics) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO execution_statistics (date, stat_type, total_tasks, completed_tasks,
                                          failed_tasks, canceled_tasks, total_commands,
                                          completed_commands, failed_commands,
                                          timeout_commands, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(date, stat_type) DO UPDATE SET
            total_tasks = excluded.total_tasks,
            completed_tasks = excluded.completed_tasks,
            failed_tasks = excluded.failed_tasks,
            canceled_tasks = excluded.canceled_tasks,
            total_commands = excluded.total_commands,
            completed_commands = excluded.completed_commands,
            failed_commands = excluded.failed_commands,
            timeout_commands = excluded.timeout_commands,
            updated_at = excluded.updated_at
        "#,
        params![
            stats.date,
            stats.stat_type,
            stats.total_tasks,
            stats.completed_tasks,
            stats.failed_tasks,
            stats.canceled_tasks,
            stats.total_commands,
            stats.completed_commands,
            stats.failed_commands,
            stats.timeout_commands,
            current_timestamp(),
        ],
    )
    .context("Failed to upsert statistics row")?;

    Ok(())
}

/// Fetch the rollup row for a date and type.
pub fn get_statistics(
    conn: &Connection,
    date: &str,
    stat_type: &str,
) -> Result<Option<ExecutionStatistics>> {
    conn.query_row(
        "SELECT * FROM execution_statistics WHERE date = ?1 AND stat_type = ?2",
        params![date, stat_type],
        |row| {
            Ok(ExecutionStatistics {
                date: row.get("date")?,
                stat_type: row.get("stat_type")?,
                total_tasks: row.get("total_tasks")?,
                completed_tasks: row.get("completed_tasks")?,
                failed_tasks: row.get("failed_tasks")?,
                canceled_tasks: row.get("canceled_tasks")?,
                total_commands: row.get("total_commands")?,
                completed_commands: row.get("completed_commands")?,
                failed_commands: row.get("failed_commands")?,
                timeout_commands: row.get("timeout_commands")?,
                updated_at: row.get("updated_at")?,
            })
        },
    )
    .optional()
    .context("Failed to query statistics row")
}

/// Recent rollup rows, newest first.
pub fn recent_statistics(conn: &Connection, limit: u32) -> Result<Vec<ExecutionStatistics>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM execution_statistics
            WHERE stat_type = 'daily'
            ORDER BY date DESC
            LIMIT ?1
            "#,
        )
        .context("Failed to prepare statistics query")?;

    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(ExecutionStatistics {
                date: row.get("date")?,
                stat_type: row.get("stat_type")?,
                total_tasks: row.get("total_tasks")?,
                completed_tasks: row.get("completed_tasks")?,
                failed_tasks: row.get("failed_tasks")?,
                canceled_tasks: row.get("canceled_tasks")?,
                total_commands: row.get("total_commands")?,
                completed_commands: row.get("completed_commands")?,
                failed_commands: row.get("failed_commands")?,
                timeout_commands: row.get("timeout_commands")?,
                updated_at: row.get("updated_at")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<ExecutionStatistics>>>()
        .context("Failed to read statistics rows")?;

    Ok(rows)
}
