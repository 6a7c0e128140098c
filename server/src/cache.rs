//! Short-TTL memoization of task status, progress, lists and statistics
//!
//! Read-through cache keyed for precise invalidation: the lifecycle engine
//! drops the task-scoped keys and the statistics key on every user-visible
//! transition, and the list/host-task namespaces by prefix scan on task
//! creation, start, cancel and terminal transitions. Stale reads are
//! bounded by the per-key TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// TTL for `task:status:{taskId}` (5 minutes)
pub const TTL_TASK_STATUS: Duration = Duration::from_secs(300);
/// TTL for `task:progress:{taskId}` (2 minutes)
pub const TTL_TASK_PROGRESS: Duration = Duration::from_secs(120);
/// TTL for `task:execution:{taskId}` (1 minute)
pub const TTL_TASK_EXECUTION: Duration = Duration::from_secs(60);
/// TTL for `task:stats:global` (10 minutes)
pub const TTL_TASK_STATS: Duration = Duration::from_secs(600);
/// TTL for `task:list:…` pages (3 minutes)
pub const TTL_TASK_LIST: Duration = Duration::from_secs(180);
/// TTL for `host:tasks:…` pages (5 minutes)
pub const TTL_HOST_TASKS: Duration = Duration::from_secs(300);

/// The key under which global statistics are cached.
pub const KEY_TASK_STATS_GLOBAL: &str = "task:stats:global";

pub fn task_status_key(task_id: &str) -> String {
    format!("task:status:{}", task_id)
}

pub fn task_progress_key(task_id: &str) -> String {
    format!("task:progress:{}", task_id)
}

pub fn task_execution_key(task_id: &str) -> String {
    format!("task:execution:{}", task_id)
}

pub fn task_list_key(page: u32, size: u32, status: &str, name: &str) -> String {
    format!("task:list:page:{}:size:{}:status:{}:name:{}", page, size, status, name)
}

pub fn host_tasks_key(host_id: &str, page: u32, size: u32, status: &str) -> String {
    format!("host:tasks:{}:page:{}:size:{}:status:{}", host_id, page, size, status)
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Shared handle to the status cache. Cloning is cheap.
#[derive(Clone)]
pub struct StatusCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch a cached value; expired entries read as absent.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store a value under its namespace TTL.
    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop one key.
    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Drop every key under a prefix. Returns the number removed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Drop everything derived from one task: its scoped keys, the global
    /// statistics, and (the caller decides when) the list namespaces.
    pub async fn invalidate_task(&self, task_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(&task_status_key(task_id));
        entries.remove(&task_progress_key(task_id));
        entries.remove(&task_execution_key(task_id));
        entries.remove(KEY_TASK_STATS_GLOBAL);
    }

    /// Drop the list and per-host-task namespaces. Called on task creation,
    /// start, cancel and terminal transitions.
    pub async fn invalidate_listings(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|key, _| !key.starts_with("task:list:") && !key.starts_with("host:tasks:"));
    }

    /// Drop expired entries; called from the periodic maintenance task.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed = removed, "Expired cache entries removed");
        }
        removed
    }

    /// Number of live entries, for observability.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_invalidate() {
        let cache = StatusCache::new();
        cache
            .set(
                &task_status_key("t1"),
                serde_json::json!("running"),
                TTL_TASK_STATUS,
            )
            .await;

        assert_eq!(
            cache.get(&task_status_key("t1")).await,
            Some(serde_json::json!("running"))
        );

        cache.invalidate(&task_status_key("t1")).await;
        assert!(cache.get(&task_status_key("t1")).await.is_none());
    }

    #[tokio::test]
    async fn test_task_invalidation_clears_scoped_keys_and_stats() {
        let cache = StatusCache::new();
        cache
            .set(&task_status_key("t1"), serde_json::json!(1), TTL_TASK_STATUS)
            .await;
        cache
            .set(&task_progress_key("t1"), serde_json::json!(2), TTL_TASK_PROGRESS)
            .await;
        cache
            .set(KEY_TASK_STATS_GLOBAL, serde_json::json!(3), TTL_TASK_STATS)
            .await;
        cache
            .set(&task_status_key("t2"), serde_json::json!(4), TTL_TASK_STATUS)
            .await;

        cache.invalidate_task("t1").await;

        assert!(cache.get(&task_status_key("t1")).await.is_none());
        assert!(cache.get(&task_progress_key("t1")).await.is_none());
        assert!(cache.get(KEY_TASK_STATS_GLOBAL).await.is_none());
        // Unrelated task keys survive.
        assert!(cache.get(&task_status_key("t2")).await.is_some());
    }

    #[tokio::test]
    async fn test_listing_invalidation_is_prefix_scoped() {
        let cache = StatusCache::new();
        cache
            .set(
                &task_list_key(1, 20, "all", ""),
                serde_json::json!([]),
                TTL_TASK_LIST,
            )
            .await;
        cache
            .set(
                &host_tasks_key("h1", 1, 20, "all"),
                serde_json::json!([]),
                TTL_HOST_TASKS,
            )
            .await;
        cache
            .set(&task_status_key("t1"), serde_json::json!(1), TTL_TASK_STATUS)
            .await;

        cache.invalidate_listings().await;

        assert!(cache.get(&task_list_key(1, 20, "all", "")).await.is_none());
        assert!(cache.get(&host_tasks_key("h1", 1, 20, "all")).await.is_none());
        assert!(cache.get(&task_status_key("t1")).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept() {
        let cache = StatusCache::new();
        cache
            .set("task:status:old", serde_json::json!(1), Duration::ZERO)
            .await;
        cache
            .set("task:status:new", serde_json::json!(2), TTL_TASK_STATUS)
            .await;

        assert!(cache.get("task:status:old").await.is_none());
        let removed = cache.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
    }
}
