//! Host registry and approval workflow
//!
//! Unknown hosts that register land in the key-value store under
//! `pending_host:{id}` with no TTL; only an operator's approval moves them
//! into the relational hosts table, preserving `first_seen` across the
//! move. Status reports from hosts that are not approved are rejected,
//! which is the signal the agent uses to re-enter registration.

use crate::database::{db_hosts, ServerDatabase};
use crate::kvstore::{KvStore, HOST_PREFIX, HOST_STATUS_PREFIX, PENDING_HOST_PREFIX};
use shared::api::PendingHostView;
use shared::model::{Host, HostApprovalStatus};
use shared::protocol::{HostInfo, HostStatus};
use shared::utils::current_timestamp;
use shared::ControlError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Shared handle to the host registry.
#[derive(Clone)]
pub struct HostRegistry {
    database: Arc<Mutex<ServerDatabase>>,
    kvstore: KvStore,
    /// TTL for cached status snapshots in seconds.
    status_snapshot_ttl: u64,
}

impl HostRegistry {
    pub fn new(
        database: Arc<Mutex<ServerDatabase>>,
        kvstore: KvStore,
        status_snapshot_ttl: u64,
    ) -> Self {
        Self {
            database,
            kvstore,
            status_snapshot_ttl,
        }
    }

    fn pending_key(host_id: &str) -> String {
        format!("{}{}", PENDING_HOST_PREFIX, host_id)
    }

    fn status_key(host_id: &str) -> String {
        format!("{}{}", HOST_STATUS_PREFIX, host_id)
    }

    /// Handle a registration. An approved host gets its last-seen stamp
    /// refreshed; anything else is written (or re-written, preserving
    /// `first_seen`) as a pending record awaiting operator approval.
    pub async fn register(&self, host: &HostInfo) -> Result<(), ControlError> {
        shared::utils::validate_host_id(&host.id)
            .map_err(|e| ControlError::Validation(e.to_string()))?;

        let approved = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            if db_hosts::is_approved(conn, &host.id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
            {
                db_hosts::touch_last_seen(conn, &host.id)
                    .map_err(|e| ControlError::Storage(e.to_string()))?;
                true
            } else {
                false
            }
        };

        if approved {
            debug!(host_id = %host.id, "Registration from approved host");
            return Ok(());
        }

        // Re-registration keeps the original first_seen.
        let key = Self::pending_key(&host.id);
        let first_seen = match self.kvstore.get(&key).await {
            Some(existing) => existing
                .get("first_seen")
                .and_then(|v| v.as_i64())
                .unwrap_or_else(current_timestamp),
            None => current_timestamp(),
        };

        let record = serde_json::json!({
            "host": host,
            "first_seen": first_seen,
        });
        self.kvstore.set(&key, record).await;

        info!(host_id = %host.id, "Host registered, awaiting approval");
        Ok(())
    }

    /// Handle a periodic status report. Rejected unless the host has an
    /// approved relational row; on success the last-seen stamp and the
    /// cached status snapshot are refreshed.
    pub async fn report_status(&self, status: &HostStatus) -> Result<(), ControlError> {
        let mut db = self.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ControlError::Storage(e.to_string()))?;

        if !db_hosts::is_approved(conn, &status.host_id)
            .map_err(|e| ControlError::Storage(e.to_string()))?
        {
            return Err(ControlError::NotFound(format!(
                "Host {} not found or not approved",
                status.host_id
            )));
        }

        db_hosts::touch_last_seen(conn, &status.host_id)
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        drop(db);

        let snapshot = serde_json::to_value(status)
            .map_err(|e| ControlError::Internal(format!("Status snapshot failed: {}", e)))?;
        self.kvstore
            .set_with_ttl(
                &Self::status_key(&status.host_id),
                snapshot,
                self.status_snapshot_ttl,
            )
            .await;

        Ok(())
    }

    /// All hosts awaiting approval.
    pub async fn pending_hosts(&self) -> Vec<PendingHostView> {
        let keys = self.kvstore.keys_with_prefix(PENDING_HOST_PREFIX).await;
        let mut hosts = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(record) = self.kvstore.get(&key).await else {
                continue;
            };
            match serde_json::from_value::<PendingHostView>(record.clone()) {
                Ok(view) => hosts.push(view),
                Err(e) => warn!(key = %key, error = %e, "Malformed pending host record"),
            }
        }
        hosts
    }

    /// Approve a pending host: copy it into the relational table (or flip
    /// an existing row to approved) and delete the pending entry.
    pub async fn approve(&self, host_id: &str) -> Result<(), ControlError> {
        let key = Self::pending_key(host_id);
        let pending = self.kvstore.get(&key).await;

        let (info, first_seen) = match pending {
            Some(record) => {
                let view: PendingHostView = serde_json::from_value(record).map_err(|e| {
                    ControlError::Internal(format!("Malformed pending host record: {}", e))
                })?;
                (view.host, view.first_seen)
            }
            None => {
                // No pending record: the host may already have a row that
                // was rejected or demoted; approving that row is allowed.
                let mut db = self.database.lock().await;
                let conn = db
                    .get_connection()
                    .map_err(|e| ControlError::Storage(e.to_string()))?;
                let existing = db_hosts::get_host(conn, host_id)
                    .map_err(|e| ControlError::Storage(e.to_string()))?
                    .ok_or_else(|| {
                        ControlError::NotFound(format!("No pending host: {}", host_id))
                    })?;
                (
                    HostInfo {
                        id: existing.host_id,
                        hostname: existing.hostname,
                        ip: existing.ip,
                        os: existing.os,
                        tags: existing.tags,
                        last_seen: existing.last_seen,
                    },
                    existing.first_seen,
                )
            }
        };

        let host = Host {
            host_id: info.id.clone(),
            hostname: info.hostname,
            ip: info.ip,
            os: info.os,
            tags: info.tags,
            status: HostApprovalStatus::Approved,
            first_seen,
            last_seen: current_timestamp(),
        };

        {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            db_hosts::upsert_approved(conn, &host)
                .map_err(|e| ControlError::Storage(e.to_string()))?;
        }

        // Mirror the approved record for cheap lookups.
        if let Ok(snapshot) = serde_json::to_value(&host) {
            self.kvstore
                .set_with_ttl(
                    &format!("{}{}", HOST_PREFIX, host_id),
                    snapshot,
                    self.status_snapshot_ttl,
                )
                .await;
        }

        self.kvstore.delete(&key).await;
        info!(host_id = %host_id, "Host approved");
        Ok(())
    }

    /// Reject a pending host: drop its pending entry.
    pub async fn reject(&self, host_id: &str) -> Result<(), ControlError> {
        let removed = self.kvstore.delete(&Self::pending_key(host_id)).await;
        if !removed {
            return Err(ControlError::NotFound(format!(
                "No pending host: {}",
                host_id
            )));
        }
        info!(host_id = %host_id, "Host rejected");
        Ok(())
    }

    /// Approved host row plus its cached status snapshot, if fresh.
    pub async fn host_detail(
        &self,
        host_id: &str,
    ) -> Result<(Host, Option<serde_json::Value>), ControlError> {
        let host = {
            let mut db = self.database.lock().await;
            let conn = db
                .get_connection()
                .map_err(|e| ControlError::Storage(e.to_string()))?;
            db_hosts::get_host(conn, host_id)
                .map_err(|e| ControlError::Storage(e.to_string()))?
                .ok_or_else(|| ControlError::NotFound(format!("Host not found: {}", host_id)))?
        };
        let snapshot = self.kvstore.get(&Self::status_key(host_id)).await;
        Ok((host, snapshot))
    }

    /// All relational host rows.
    pub async fn list_hosts(&self) -> Result<Vec<Host>, ControlError> {
        let mut db = self.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        db_hosts::list_hosts(conn).map_err(|e| ControlError::Storage(e.to_string()))
    }
}
