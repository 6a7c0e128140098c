//! Audit log operations
//!
//! The audit trail is append-only: every user-visible lifecycle action
//! (task created, started, canceled, command result, retry, host approval)
//! lands here with a JSON detail payload. Rows are never updated.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::AuditLogEntry;
use shared::utils::current_timestamp;

/// Create the audit_logs table.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            host_id TEXT,
            user_id TEXT NOT NULL DEFAULT '',
            details TEXT NOT NULL DEFAULT '{}',
            timestamp INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create audit_logs table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_logs(entity_type, entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp)",
        [],
    )?;

    Ok(())
}

/// Append one audit entry.
pub fn insert_audit(
    conn: &Connection,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    host_id: Option<&str>,
    user_id: &str,
    details: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO audit_logs (action, entity_type, entity_id, host_id, user_id, details, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            action,
            entity_type,
            entity_id,
            host_id,
            user_id,
            details.to_string(),
            current_timestamp(),
        ],
    )
    .context("Failed to insert audit log entry")?;

    Ok(())
}

/// Query audit entries newest first, optionally filtered by entity.
pub fn query_audit(
    conn: &Connection,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
    page: u32,
    page_size: u32,
) -> Result<Vec<AuditLogEntry>> {
    let offset = (page.saturating_sub(1)) * page_size;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, action, entity_type, entity_id, host_id, user_id, details, timestamp
            FROM audit_logs
            WHERE (?1 IS NULL OR entity_type = ?1)
              AND (?2 IS NULL OR entity_id = ?2)
            ORDER BY timestamp DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .context("Failed to prepare audit query")?;

    let entries = stmt
        .query_map(params![entity_type, entity_id, page_size, offset], |row| {
            let details: String = row.get("details")?;
            Ok(AuditLogEntry {
                id: row.get("id")?,
                action: row.get("action")?,
                entity_type: row.get("entity_type")?,
                entity_id: row.get("entity_id")?,
                host_id: row.get("host_id")?,
                user_id: row.get("user_id")?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                timestamp: row.get("timestamp")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<AuditLogEntry>>>()
        .context("Failed to read audit entries")?;

    Ok(entries)
}

/// Delete audit rows older than the cutoff. Returns the count.
pub fn delete_before(conn: &Connection, cutoff: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM audit_logs WHERE timestamp < ?1",
        params![cutoff],
    )
    .context("Failed to delete expired audit rows")
}
