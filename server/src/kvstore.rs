//! In-process key-value store
//!
//! Holds the transient state the relational store should not own: pending
//! host records awaiting approval (no TTL) and cached host/status snapshots
//! (with TTL). The API is the contract an external key-value service would
//! have to satisfy; the in-process map keeps the server self-contained.

use shared::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Key namespace for hosts awaiting approval.
pub const PENDING_HOST_PREFIX: &str = "pending_host:";
/// Key namespace for cached host records.
pub const HOST_PREFIX: &str = "host:";
/// Key namespace for cached host status snapshots.
pub const HOST_STATUS_PREFIX: &str = "host_status:";

#[derive(Debug, Clone)]
struct KvEntry {
    value: serde_json::Value,
    /// Unix seconds after which the entry is gone; None = no expiry.
    expires_at: Option<i64>,
}

/// Shared handle to the key-value store. Cloning is cheap; all clones see
/// the same data.
#[derive(Clone)]
pub struct KvStore {
    entries: Arc<RwLock<HashMap<String, KvEntry>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a value without expiry.
    pub async fn set(&self, key: &str, value: serde_json::Value) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: None,
            },
        );
    }

    /// Store a value that expires after `ttl_seconds`.
    pub async fn set_with_ttl(&self, key: &str, value: serde_json::Value, ttl_seconds: u64) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Some(current_timestamp() + ttl_seconds as i64),
            },
        );
    }

    /// Fetch a value; expired entries read as absent.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= current_timestamp() {
                return None;
            }
        }
        Some(entry.value.clone())
    }

    /// Remove a key; returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// All live keys under a prefix, sorted for stable iteration.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = current_timestamp();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(prefix) && entry.expires_at.map_or(true, |t| t > now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop expired entries. Called from the periodic maintenance task; the
    /// store stays correct without it, this only reclaims memory.
    pub async fn cleanup_expired(&self) -> usize {
        let now = current_timestamp();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at.map_or(true, |t| t > now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed = removed, "Expired key-value entries removed");
        }
        removed
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = KvStore::new();
        store
            .set("pending_host:web-01", serde_json::json!({"id": "web-01"}))
            .await;

        let value = store.get("pending_host:web-01").await.unwrap();
        assert_eq!(value["id"], "web-01");

        assert!(store.delete("pending_host:web-01").await);
        assert!(store.get("pending_host:web-01").await.is_none());
        assert!(!store.delete("pending_host:web-01").await);
    }

    #[tokio::test]
    async fn test_prefix_listing_is_sorted() {
        let store = KvStore::new();
        store.set("pending_host:b", serde_json::json!(2)).await;
        store.set("pending_host:a", serde_json::json!(1)).await;
        store.set("host:c", serde_json::json!(3)).await;

        let keys = store.keys_with_prefix("pending_host:").await;
        assert_eq!(keys, vec!["pending_host:a", "pending_host:b"]);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let store = KvStore::new();
        store
            .set_with_ttl("host_status:web-01", serde_json::json!({}), 0)
            .await;
        // TTL of zero expires immediately.
        assert!(store.get("host_status:web-01").await.is_none());

        store
            .set_with_ttl("host_status:web-02", serde_json::json!({}), 300)
            .await;
        assert!(store.get("host_status:web-02").await.is_some());

        let removed = store.cleanup_expired().await;
        assert_eq!(removed, 1);
    }
}
