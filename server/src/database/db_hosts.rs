//! Host table operations
//!
//! Approved hosts live here; hosts awaiting approval live in the key-value
//! store and only reach this table through the registry's approve path,
//! which preserves `first_seen` across the move.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{Host, HostApprovalStatus};
use shared::utils::current_timestamp;
use std::collections::HashMap;

/// Create the hosts table.
pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS hosts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            host_id TEXT UNIQUE NOT NULL,
            hostname TEXT NOT NULL DEFAULT '',
            ip TEXT NOT NULL DEFAULT '',
            os TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            created_at INTEGER DEFAULT (strftime('%s', 'now'))
        )
        "#,
        [],
    )
    .context("Failed to create hosts table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hosts_status ON hosts(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hosts_last_seen ON hosts(last_seen)",
        [],
    )?;

    Ok(())
}

fn row_to_host(row: &Row) -> rusqlite::Result<Host> {
    let status: String = row.get("status")?;
    let tags: String = row.get("tags")?;
    Ok(Host {
        host_id: row.get("host_id")?,
        hostname: row.get("hostname")?,
        ip: row.get("ip")?,
        os: row.get("os")?,
        tags: serde_json::from_str::<HashMap<String, String>>(&tags).unwrap_or_default(),
        status: HostApprovalStatus::from_str(&status).unwrap_or(HostApprovalStatus::Pending),
        first_seen: row.get("first_seen")?,
        last_seen: row.get("last_seen")?,
    })
}

/// Insert an approved host, or flip an existing row to approved.
/// This is the approve path: `first_seen` comes from the pending record and
/// is preserved if a row already exists.
pub fn upsert_approved(conn: &Connection, host: &Host) -> Result<()> {
    let tags = serde_json::to_string(&host.tags).context("Failed to serialize host tags")?;

    // Try the update first; zero affected rows means the host is new.
    let updated = conn
        .execute(
            r#"
            UPDATE hosts
            SET hostname = ?1, ip = ?2, os = ?3, tags = ?4, status = 'approved', last_seen = ?5
            WHERE host_id = ?6
            "#,
            params![
                host.hostname,
                host.ip,
                host.os,
                tags,
                host.last_seen,
                host.host_id
            ],
        )
        .context("Failed to update host to approved")?;

    if updated == 0 {
        conn.execute(
            r#"
            INSERT INTO hosts (host_id, hostname, ip, os, tags, status, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, 'approved', ?6, ?7)
            "#,
            params![
                host.host_id,
                host.hostname,
                host.ip,
                host.os,
                tags,
                host.first_seen,
                host.last_seen
            ],
        )
        .context("Failed to insert approved host")?;
    }

    Ok(())
}

/// Fetch a host by id.
pub fn get_host(conn: &Connection, host_id: &str) -> Result<Option<Host>> {
    conn.query_row(
        "SELECT * FROM hosts WHERE host_id = ?1",
        params![host_id],
        |row| row_to_host(row),
    )
    .optional()
    .context("Failed to query host")
}

/// Whether the host exists and is approved to receive commands.
pub fn is_approved(conn: &Connection, host_id: &str) -> Result<bool> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM hosts WHERE host_id = ?1",
            params![host_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query host status")?;
    Ok(status.as_deref() == Some("approved"))
}

/// Refresh a host's last-seen stamp; returns false when the row is missing.
pub fn touch_last_seen(conn: &Connection, host_id: &str) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE hosts SET last_seen = ?1 WHERE host_id = ?2",
            params![current_timestamp(), host_id],
        )
        .context("Failed to update host last_seen")?;
    Ok(updated > 0)
}

/// All hosts, most recently seen first.
pub fn list_hosts(conn: &Connection) -> Result<Vec<Host>> {
    let mut stmt = conn
        .prepare("SELECT * FROM hosts ORDER BY last_seen DESC")
        .context("Failed to prepare host list query")?;
    let hosts = stmt
        .query_map([], |row| row_to_host(row))?
        .collect::<rusqlite::Result<Vec<Host>>>()
        .context("Failed to read host list")?;
    Ok(hosts)
}
