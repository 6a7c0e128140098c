//! Task table operations
//!
//! A task is the operator-submitted unit of work: one command fanned out to
//! a set of hosts. The table also carries the denormalized progress counters
//! the lifecycle engine recomputes inside each transition transaction, and a
//! `task_hosts` mapping the scheduler reads when it admits a task.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{Task, TaskPriority, TaskStatus};
use shared::utils::current_timestamp;

/// Create the tasks and task_hosts tables.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_by TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'normal',
            total_hosts INTEGER NOT NULL DEFAULT 0,
            completed_hosts INTEGER NOT NULL DEFAULT 0,
            failed_hosts INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER,
            finished_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_hosts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            host_id TEXT NOT NULL,
            UNIQUE(task_id, host_id),
            FOREIGN KEY (task_id) REFERENCES tasks (task_id) ON DELETE CASCADE
        )
        "#,
        [],
    )
    .context("Failed to create task_hosts table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_hosts_task ON task_hosts(task_id)",
        [],
    )?;

    Ok(())
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    Ok(Task {
        task_id: row.get("task_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        created_by: row.get("created_by")?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        total_hosts: row.get("total_hosts")?,
        completed_hosts: row.get("completed_hosts")?,
        failed_hosts: row.get("failed_hosts")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Insert a new task together with its host mapping.
pub fn insert_task(
    conn: &Connection,
    task: &Task,
    priority: TaskPriority,
    host_ids: &[String],
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO tasks (task_id, name, description, created_by, status, priority,
                           total_hosts, completed_hosts, failed_hosts, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            task.task_id,
            task.name,
            task.description,
            task.created_by,
            task.status.as_str(),
            priority.as_str(),
            task.total_hosts,
            task.completed_hosts,
            task.failed_hosts,
            task.created_at,
            task.updated_at,
        ],
    )
    .context("Failed to insert task")?;

    for host_id in host_ids {
        conn.execute(
            "INSERT INTO task_hosts (task_id, host_id) VALUES (?1, ?2)",
            params![task.task_id, host_id],
        )
        .context("Failed to insert task host mapping")?;
    }

    Ok(())
}

/// Fetch a task by id.
pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    conn.query_row(
        "SELECT * FROM tasks WHERE task_id = ?1",
        params![task_id],
        |row| row_to_task(row),
    )
    .optional()
    .context("Failed to query task")
}

/// The priority a task was created with.
pub fn get_task_priority(conn: &Connection, task_id: &str) -> Result<Option<TaskPriority>> {
    let priority: Option<String> = conn
        .query_row(
            "SELECT priority FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query task priority")?;

    Ok(priority.map(|p| match p.as_str() {
        "low" => TaskPriority::Low,
        "high" => TaskPriority::High,
        "urgent" => TaskPriority::Urgent,
        _ => TaskPriority::Normal,
    }))
}

/// The host ids a task targets, in insertion order.
pub fn get_task_hosts(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT host_id FROM task_hosts WHERE task_id = ?1 ORDER BY id")
        .context("Failed to prepare task hosts query")?;
    let hosts = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .context("Failed to read task hosts")?;
    Ok(hosts)
}

/// Update a task's status and progress counters. `started_at` and
/// `finished_at` are only ever set once: a COALESCE keeps the first value.
pub fn update_task_progress(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
    completed_hosts: u32,
    failed_hosts: u32,
    started_at: Option<i64>,
    finished_at: Option<i64>,
) -> Result<()> {
    let updated = conn
        .execute(
            r#"
            UPDATE tasks
            SET status = ?1,
                completed_hosts = ?2,
                failed_hosts = ?3,
                started_at = COALESCE(started_at, ?4),
                finished_at = COALESCE(finished_at, ?5),
                updated_at = ?6
            WHERE task_id = ?7
            "#,
            params![
                status.as_str(),
                completed_hosts,
                failed_hosts,
                started_at,
                finished_at,
                current_timestamp(),
                task_id,
            ],
        )
        .context("Failed to update task progress")?;

    if updated == 0 {
        anyhow::bail!("Task not found: {}", task_id);
    }
    Ok(())
}

/// List tasks, newest first, with optional status and name filters.
/// Returns the page plus the total row count for the filter.
pub fn list_tasks(
    conn: &Connection,
    page: u32,
    page_size: u32,
    status: Option<TaskStatus>,
    name_filter: Option<&str>,
) -> Result<(Vec<Task>, u64)> {
    let status_str = status.map(|s| s.as_str().to_string());
    let name_like = name_filter.map(|n| format!("%{}%", n));

    let total: u64 = conn
        .query_row(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR name LIKE ?2)
            "#,
            params![status_str, name_like],
            |row| row.get(0),
        )
        .context("Failed to count tasks")?;

    let offset = (page.saturating_sub(1)) * page_size;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM tasks
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR name LIKE ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .context("Failed to prepare task list query")?;

    let tasks = stmt
        .query_map(params![status_str, name_like, page_size, offset], |row| {
            row_to_task(row)
        })?
        .collect::<rusqlite::Result<Vec<Task>>>()
        .context("Failed to read task list")?;

    Ok((tasks, total))
}

/// Delete a task; commands, command hosts and mappings cascade.
pub fn delete_task(conn: &Connection, task_id: &str) -> Result<bool> {
    let deleted = conn
        .execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])
        .context("Failed to delete task")?;
    Ok(deleted > 0)
}

/// Delete terminal tasks finished before the cutoff. Returns the count.
pub fn delete_terminal_before(conn: &Connection, cutoff: i64) -> Result<usize> {
    conn.execute(
        r#"
        DELETE FROM tasks
        WHERE status IN ('completed', 'failed', 'canceled')
          AND finished_at IS NOT NULL
          AND finished_at < ?1
        "#,
        params![cutoff],
    )
    .context("Failed to delete expired tasks")
}

/// Count tasks per status for the statistics rollup, bounded to one day.
pub fn count_by_status_between(
    conn: &Connection,
    from: i64,
    to: i64,
) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT status, COUNT(*) FROM tasks
            WHERE created_at >= ?1 AND created_at < ?2
            GROUP BY status
            "#,
        )
        .context("Failed to prepare task status count query")?;
    let counts = stmt
        .query_map(params![from, to], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, i64)>>>()
        .context("Failed to read task status counts")?;
    Ok(counts)
}
