//! Shared test fixtures for the server crate
//!
//! Builds a fully wired engine (temp database, cache, key-value store,
//! batch pipeline, registry) around a recording command sender so tests
//! can observe dispatches without a live agent.

use crate::batch::BatchUpdatePipeline;
use crate::cache::StatusCache;
use crate::database::ServerDatabase;
use crate::kvstore::KvStore;
use crate::lifecycle::{CommandSender, LifecycleEngine};
use crate::registry::HostRegistry;
use async_trait::async_trait;
use shared::api::CreateTaskRequest;
use shared::model::{Task, TaskPriority};
use shared::protocol::{CommandContent, HostInfo};
use shared::utils::current_timestamp;
use shared::ControlError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{broadcast, Mutex};

/// Command sender that records every dispatch and can be told to fail for
/// specific hosts.
pub struct RecordingSender {
    pub sent: Mutex<Vec<CommandContent>>,
    pub cancels: Mutex<Vec<(String, String)>>,
    fail_hosts: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            fail_hosts: Mutex::new(HashSet::new()),
        }
    }

    /// Make every send to the given host fail with a transport error.
    pub async fn fail_host(&self, host_id: &str) {
        self.fail_hosts.lock().await.insert(host_id.to_string());
    }

    pub async fn sent_command_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|c| c.command_id.clone())
            .collect()
    }
}

#[async_trait]
impl CommandSender for RecordingSender {
    async fn send(&self, host_id: &str, content: CommandContent) -> Result<(), ControlError> {
        if self.fail_hosts.lock().await.contains(host_id) {
            return Err(ControlError::Transport(format!(
                "Stream write to {} failed: connection reset",
                host_id
            )));
        }
        self.sent.lock().await.push(content);
        Ok(())
    }

    async fn send_cancel(&self, host_id: &str, command_id: &str) -> Result<(), ControlError> {
        self.cancels
            .lock()
            .await
            .push((host_id.to_string(), command_id.to_string()));
        Ok(())
    }
}

/// Everything a server-side test needs, torn down with the TempDir.
pub struct TestHarness {
    pub database: Arc<Mutex<ServerDatabase>>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub sender: Arc<RecordingSender>,
    pub cache: StatusCache,
    pub kvstore: KvStore,
    pub registry: HostRegistry,
    pub shutdown_tx: broadcast::Sender<()>,
    _temp_dir: TempDir,
}

/// Build a harness with a fast-flushing batch pipeline so disconnect
/// handling settles within a short sleep.
pub async fn harness() -> TestHarness {
    let temp_dir = TempDir::new().unwrap();
    let mut db = ServerDatabase::new(temp_dir.path()).unwrap();
    db.initialize().await.unwrap();
    let database = Arc::new(Mutex::new(db));

    let (shutdown_tx, _) = broadcast::channel(1);
    let batch = BatchUpdatePipeline::start(
        shared::config::BatchSettings {
            batch_size: 8,
            batch_timeout_ms: 25,
            queue_capacity: 64,
        },
        Arc::clone(&database),
        shutdown_tx.subscribe(),
    );

    let cache = StatusCache::new();
    let kvstore = KvStore::new();
    let sender = Arc::new(RecordingSender::new());
    let lifecycle = Arc::new(LifecycleEngine::new(
        Arc::clone(&database),
        Arc::clone(&sender) as Arc<dyn CommandSender>,
        cache.clone(),
        batch,
        300,
    ));
    let registry = HostRegistry::new(Arc::clone(&database), kvstore.clone(), 120);

    TestHarness {
        database,
        lifecycle,
        sender,
        cache,
        kvstore,
        registry,
        shutdown_tx,
        _temp_dir: temp_dir,
    }
}

/// Register a host and approve it, so it can receive commands.
pub async fn approve_host(harness: &TestHarness, host_id: &str) {
    harness
        .registry
        .register(&HostInfo {
            id: host_id.to_string(),
            hostname: format!("{}.test", host_id),
            ip: "10.0.0.1".to_string(),
            os: "linux".to_string(),
            tags: HashMap::new(),
            last_seen: current_timestamp(),
        })
        .await
        .unwrap();
    harness.registry.approve(host_id).await.unwrap();
}

/// Create a task over the given hosts with a plain echo command.
pub async fn create_task(
    harness: &TestHarness,
    host_ids: &[&str],
    command: &str,
    timeout_seconds: u64,
) -> Task {
    harness
        .lifecycle
        .create_task(CreateTaskRequest {
            name: format!("test {}", command),
            description: String::new(),
            host_ids: host_ids.iter().map(|h| h.to_string()).collect(),
            command: command.to_string(),
            parameters: HashMap::new(),
            timeout_seconds,
            priority: TaskPriority::Normal,
            created_by: "tests".to_string(),
        })
        .await
        .unwrap()
}
