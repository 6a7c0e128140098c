//! Command and command-host table operations
//!
//! A command is the per-host realization of a task; its command-host row is
//! the execution record with the richer per-host status vocabulary. The two
//! rows are always updated together, inside the caller's transaction, so
//! their statuses never diverge observably.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{Command, CommandHost, CommandHostStatus, CommandStatus};
use shared::utils::current_timestamp;
use std::collections::HashMap;

/// Create the commands and commands_hosts tables.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS commands (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            command_id TEXT UNIQUE NOT NULL,
            task_id TEXT,
            host_id TEXT NOT NULL,
            command TEXT NOT NULL,
            parameters TEXT NOT NULL DEFAULT '{}',
            timeout_seconds INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            stdout TEXT NOT NULL DEFAULT '',
            stderr TEXT NOT NULL DEFAULT '',
            exit_code INTEGER,
            started_at INTEGER,
            finished_at INTEGER,
            error_msg TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks (task_id) ON DELETE CASCADE
        )
        "#,
        [],
    )
    .context("Failed to create commands table")?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS commands_hosts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            command_id TEXT NOT NULL,
            host_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            execution_time_ms INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(command_id, host_id),
            FOREIGN KEY (command_id) REFERENCES commands (command_id) ON DELETE CASCADE
        )
        "#,
        [],
    )
    .context("Failed to create commands_hosts table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_task_status ON commands(task_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_host_status ON commands(host_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_finished ON commands(finished_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_hosts_cmd_status ON commands_hosts(command_id, status)",
        [],
    )?;

    Ok(())
}

fn row_to_command(row: &Row) -> rusqlite::Result<Command> {
    let status: String = row.get("status")?;
    let parameters: String = row.get("parameters")?;
    Ok(Command {
        command_id: row.get("command_id")?,
        task_id: row.get("task_id")?,
        host_id: row.get("host_id")?,
        command: row.get("command")?,
        parameters: serde_json::from_str::<HashMap<String, String>>(&parameters)
            .unwrap_or_default(),
        timeout_seconds: row.get::<_, i64>("timeout_seconds")? as u64,
        status: CommandStatus::from_str(&status).unwrap_or(CommandStatus::Pending),
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        exit_code: row.get("exit_code")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        error_msg: row.get("error_msg")?,
        created_at: row.get("created_at")?,
    })
}

/// Insert a command together with its command-host execution record.
pub fn insert_command(conn: &Connection, command: &Command) -> Result<()> {
    let parameters = serde_json::to_string(&command.parameters)
        .context("Failed to serialize command parameters")?;
    let now = current_timestamp();

    conn.execute(
        r#"
        INSERT INTO commands (command_id, task_id, host_id, command, parameters,
                              timeout_seconds, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        "#,
        params![
            command.command_id,
            command.task_id,
            command.host_id,
            command.command,
            parameters,
            command.timeout_seconds as i64,
            command.status.as_str(),
            command.created_at,
        ],
    )
    .context("Failed to insert command")?;

    conn.execute(
        r#"
        INSERT INTO commands_hosts (command_id, host_id, status, created_at, updated_at)
        VALUES (?1, ?2, 'pending', ?3, ?3)
        "#,
        params![command.command_id, command.host_id, now],
    )
    .context("Failed to insert command host record")?;

    Ok(())
}

/// Fetch a command by id.
pub fn get_command(conn: &Connection, command_id: &str) -> Result<Option<Command>> {
    conn.query_row(
        "SELECT * FROM commands WHERE command_id = ?1",
        params![command_id],
        |row| row_to_command(row),
    )
    .optional()
    .context("Failed to query command")
}

/// Fetch the execution record for `(command_id, host_id)`.
pub fn get_command_host(
    conn: &Connection,
    command_id: &str,
    host_id: &str,
) -> Result<Option<CommandHost>> {
    conn.query_row(
        "SELECT * FROM commands_hosts WHERE command_id = ?1 AND host_id = ?2",
        params![command_id, host_id],
        |row| {
            let status: String = row.get("status")?;
            Ok(CommandHost {
                command_id: row.get("command_id")?,
                host_id: row.get("host_id")?,
                status: CommandHostStatus::from_str(&status).unwrap_or(CommandHostStatus::Pending),
                execution_time_ms: row.get("execution_time_ms")?,
                updated_at: row.get("updated_at")?,
            })
        },
    )
    .optional()
    .context("Failed to query command host record")
}

/// All commands belonging to a task, oldest first.
pub fn commands_for_task(conn: &Connection, task_id: &str) -> Result<Vec<Command>> {
    let mut stmt = conn
        .prepare("SELECT * FROM commands WHERE task_id = ?1 ORDER BY id")
        .context("Failed to prepare task commands query")?;
    let commands = stmt
        .query_map(params![task_id], |row| row_to_command(row))?
        .collect::<rusqlite::Result<Vec<Command>>>()
        .context("Failed to read task commands")?;
    Ok(commands)
}

/// Update both the command row and its command-host row in one call.
/// Must run inside the caller's transaction.
pub fn update_command_pair(
    conn: &Connection,
    command_id: &str,
    host_id: &str,
    host_status: CommandHostStatus,
    execution_time_ms: Option<i64>,
    stdout: Option<&str>,
    stderr: Option<&str>,
    exit_code: Option<i32>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    error_msg: Option<&str>,
) -> Result<()> {
    let now = current_timestamp();
    let command_status = host_status.to_command_status();

    let updated = conn
        .execute(
            r#"
            UPDATE commands
            SET status = ?1,
                stdout = COALESCE(?2, stdout),
                stderr = COALESCE(?3, stderr),
                exit_code = COALESCE(?4, exit_code),
                started_at = COALESCE(?5, started_at),
                finished_at = COALESCE(?6, finished_at),
                error_msg = COALESCE(?7, error_msg),
                updated_at = ?8
            WHERE command_id = ?9
            "#,
            params![
                command_status.as_str(),
                stdout,
                stderr,
                exit_code,
                started_at,
                finished_at,
                error_msg,
                now,
                command_id,
            ],
        )
        .context("Failed to update command")?;

    if updated == 0 {
        anyhow::bail!("Command not found: {}", command_id);
    }

    conn.execute(
        r#"
        UPDATE commands_hosts
        SET status = ?1,
            execution_time_ms = COALESCE(?2, execution_time_ms),
            updated_at = ?3
        WHERE command_id = ?4 AND host_id = ?5
        "#,
        params![
            host_status.as_str(),
            execution_time_ms,
            now,
            command_id,
            host_id,
        ],
    )
    .context("Failed to update command host record")?;

    Ok(())
}

/// Reset a command and its execution record to pending, clearing every
/// execution field. Used when a failed or timed-out command is retried.
pub fn reset_command_for_retry(conn: &Connection, command_id: &str, host_id: &str) -> Result<()> {
    let now = current_timestamp();

    conn.execute(
        r#"
        UPDATE commands
        SET status = 'pending', stdout = '', stderr = '', exit_code = NULL,
            started_at = NULL, finished_at = NULL, error_msg = '', updated_at = ?1
        WHERE command_id = ?2
        "#,
        params![now, command_id],
    )
    .context("Failed to reset command")?;

    conn.execute(
        r#"
        UPDATE commands_hosts
        SET status = 'pending', execution_time_ms = NULL, updated_at = ?1
        WHERE command_id = ?2 AND host_id = ?3
        "#,
        params![now, command_id, host_id],
    )
    .context("Failed to reset command host record")?;

    Ok(())
}

/// Per-host status counts for a task, read from the execution records.
/// The lifecycle engine aggregates these into task progress inside the same
/// transaction that changed one of them.
pub fn host_status_counts(conn: &Connection, task_id: &str) -> Result<HashMap<String, u32>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT ch.status, COUNT(*)
            FROM commands_hosts ch
            JOIN commands c ON c.command_id = ch.command_id
            WHERE c.task_id = ?1
            GROUP BY ch.status
            "#,
        )
        .context("Failed to prepare host status count query")?;

    let mut counts = HashMap::new();
    let rows = stmt.query_map(params![task_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
    })?;
    for row in rows {
        let (status, count) = row.context("Failed to read host status count")?;
        counts.insert(status, count);
    }
    Ok(counts)
}

/// Commands of a task currently in a non-terminal state (pending or running).
pub fn active_commands_for_task(conn: &Connection, task_id: &str) -> Result<Vec<Command>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM commands
            WHERE task_id = ?1 AND status IN ('pending', 'running')
            ORDER BY id
            "#,
        )
        .context("Failed to prepare active commands query")?;
    let commands = stmt
        .query_map(params![task_id], |row| row_to_command(row))?
        .collect::<rusqlite::Result<Vec<Command>>>()
        .context("Failed to read active commands")?;
    Ok(commands)
}

/// In-flight commands for a host (dispatched but not yet terminal). Used
/// when an agent disconnects.
pub fn active_commands_for_host(conn: &Connection, host_id: &str) -> Result<Vec<Command>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM commands
            WHERE host_id = ?1 AND status = 'running'
            ORDER BY id
            "#,
        )
        .context("Failed to prepare host commands query")?;
    let commands = stmt
        .query_map(params![host_id], |row| row_to_command(row))?
        .collect::<rusqlite::Result<Vec<Command>>>()
        .context("Failed to read host commands")?;
    Ok(commands)
}

/// Running commands with a positive timeout whose deadline has passed.
pub fn expired_running_commands(conn: &Connection, now: i64) -> Result<Vec<Command>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM commands
            WHERE status = 'running'
              AND timeout_seconds > 0
              AND started_at IS NOT NULL
              AND started_at + timeout_seconds < ?1
            "#,
        )
        .context("Failed to prepare expired commands query")?;
    let commands = stmt
        .query_map(params![now], |row| row_to_command(row))?
        .collect::<rusqlite::Result<Vec<Command>>>()
        .context("Failed to read expired commands")?;
    Ok(commands)
}

/// Paginated command history for one host, optionally filtered by status.
pub fn commands_for_host_page(
    conn: &Connection,
    host_id: &str,
    page: u32,
    page_size: u32,
    status: Option<CommandStatus>,
) -> Result<(Vec<Command>, u64)> {
    let status_str = status.map(|s| s.as_str().to_string());

    let total: u64 = conn
        .query_row(
            r#"
            SELECT COUNT(*) FROM commands
            WHERE host_id = ?1 AND (?2 IS NULL OR status = ?2)
            "#,
            params![host_id, status_str],
            |row| row.get(0),
        )
        .context("Failed to count host commands")?;

    let offset = (page.saturating_sub(1)) * page_size;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM commands
            WHERE host_id = ?1 AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .context("Failed to prepare host command page query")?;
    let commands = stmt
        .query_map(params![host_id, status_str, page_size, offset], |row| {
            row_to_command(row)
        })?
        .collect::<rusqlite::Result<Vec<Command>>>()
        .context("Failed to read host command page")?;

    Ok((commands, total))
}

/// The distinct task ids owning the given commands, restricted to commands
/// still in a non-terminal state. Queried before a bulk update so the
/// caller can recompute progress for exactly the affected tasks.
pub fn task_ids_for_active_commands(
    conn: &Connection,
    command_ids: &[String],
) -> Result<Vec<String>> {
    if command_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = command_ids
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT DISTINCT task_id FROM commands \
         WHERE task_id IS NOT NULL AND status IN ('pending', 'running') \
           AND command_id IN ({})",
        placeholders
    );
    let mut stmt = conn
        .prepare(&sql)
        .context("Failed to prepare affected task query")?;
    let values: Vec<&dyn rusqlite::ToSql> =
        command_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    let task_ids = stmt
        .query_map(values.as_slice(), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .context("Failed to read affected tasks")?;
    Ok(task_ids)
}

/// Apply one grouped status update to many commands at once. Every command
/// id in the slice gets the same status and error message; the matching
/// command-host rows are updated in the same statement batch. Only
/// non-terminal rows are touched, and a terminal target status stamps
/// `finished_at`. Used by the batch update pipeline.
pub fn bulk_update_status(
    conn: &Connection,
    command_ids: &[String],
    status: CommandStatus,
    error_msg: &str,
) -> Result<usize> {
    if command_ids.is_empty() {
        return Ok(0);
    }

    let now = current_timestamp();
    let finished_at = if status.is_terminal() { Some(now) } else { None };
    let placeholders = command_ids
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "UPDATE commands \
         SET status = ?1, error_msg = ?2, finished_at = COALESCE(finished_at, ?3), updated_at = ?4 \
         WHERE status IN ('pending', 'running') AND command_id IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare bulk update")?;
    let status_str = status.as_str();
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&status_str, &error_msg, &finished_at, &now];
    for id in command_ids {
        values.push(id);
    }
    let updated = stmt
        .execute(values.as_slice())
        .context("Failed to execute bulk update")?;

    let sql = format!(
        "UPDATE commands_hosts SET status = ?1, updated_at = ?2 \
         WHERE status IN ('pending', 'running') AND command_id IN ({})",
        placeholders
    );
    let mut stmt = conn
        .prepare(&sql)
        .context("Failed to prepare bulk host update")?;
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&status_str, &now];
    for id in command_ids {
        values.push(id);
    }
    stmt.execute(values.as_slice())
        .context("Failed to execute bulk host update")?;

    Ok(updated)
}

/// Count commands per status for the statistics rollup, bounded to one day.
pub fn count_by_status_between(
    conn: &Connection,
    from: i64,
    to: i64,
) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT status, COUNT(*) FROM commands
            WHERE created_at >= ?1 AND created_at < ?2
            GROUP BY status
            "#,
        )
        .context("Failed to prepare command status count query")?;
    let counts = stmt
        .query_map(params![from, to], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, i64)>>>()
        .context("Failed to read command status counts")?;
    Ok(counts)
}

/// Execution time statistics over a task's finished execution records.
pub fn execution_time_stats(
    conn: &Connection,
    task_id: &str,
) -> Result<(Option<i64>, Option<i64>)> {
    conn.query_row(
        r#"
        SELECT CAST(AVG(ch.execution_time_ms) AS INTEGER), MAX(ch.execution_time_ms)
        FROM commands_hosts ch
        JOIN commands c ON c.command_id = ch.command_id
        WHERE c.task_id = ?1 AND ch.execution_time_ms IS NOT NULL
        "#,
        params![task_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .context("Failed to query execution time statistics")
}
