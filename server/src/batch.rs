//! Batch update pipeline for high-volume command status writes
//!
//! Status updates arrive on a bounded channel and are flushed either when
//! the buffer reaches the configured batch size or when the batch timeout
//! elapses. A flush groups updates by `(status, error_message)` and applies
//! one multi-row update per group, then recomputes progress for every
//! affected task, all inside one transaction.
//!
//! Backpressure is explicit: when the queue is full the caller applies its
//! single update synchronously in-line instead of dropping it.

use crate::database::{db_commands, ServerDatabase};
use crate::lifecycle::LifecycleEngine;
use anyhow::{Context, Result};
use shared::config::BatchSettings;
use shared::model::CommandStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// One coalesced status write.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub command_id: String,
    pub status: CommandStatus,
    pub error_message: String,
}

/// Producer handle for the pipeline. Cloning is cheap.
#[derive(Clone)]
pub struct BatchUpdatePipeline {
    tx: mpsc::Sender<StatusUpdate>,
    database: Arc<Mutex<ServerDatabase>>,
}

impl BatchUpdatePipeline {
    /// Create the pipeline and spawn its consumer. The consumer drains the
    /// channel until shutdown, then flushes once more.
    pub fn start(
        settings: BatchSettings,
        database: Arc<Mutex<ServerDatabase>>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let consumer = BatchConsumer {
            settings,
            database: Arc::clone(&database),
        };
        tokio::spawn(consumer.run(rx, shutdown_rx));
        Self { tx, database }
    }

    /// Submit a status update. Queued for the next flush when there is
    /// room; applied synchronously in-line when the queue is full.
    pub async fn submit(&self, update: StatusUpdate) -> Result<()> {
        match self.tx.try_send(update) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(update))
            | Err(mpsc::error::TrySendError::Closed(update)) => {
                warn!(
                    command_id = %update.command_id,
                    "Batch queue unavailable, applying status update in-line"
                );
                let mut db = self.database.lock().await;
                apply_batch(&mut db, &[update])
            }
        }
    }
}

struct BatchConsumer {
    settings: BatchSettings,
    database: Arc<Mutex<ServerDatabase>>,
}

impl BatchConsumer {
    async fn run(
        self,
        mut rx: mpsc::Receiver<StatusUpdate>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut buffer: Vec<StatusUpdate> = Vec::with_capacity(self.settings.batch_size);
        let mut flush_tick =
            tokio::time::interval(Duration::from_millis(self.settings.batch_timeout_ms.max(10)));
        info!(
            batch_size = self.settings.batch_size,
            batch_timeout_ms = self.settings.batch_timeout_ms,
            "Batch update pipeline started"
        );

        loop {
            tokio::select! {
                update = rx.recv() => {
                    match update {
                        Some(update) => {
                            buffer.push(update);
                            if buffer.len() >= self.settings.batch_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Batch pipeline received shutdown signal");
                    break;
                }
            }
        }

        // Drain whatever is still queued, then flush one final time.
        while let Ok(update) = rx.try_recv() {
            buffer.push(update);
        }
        if !buffer.is_empty() {
            info!(pending = buffer.len(), "Final batch flush on shutdown");
            self.flush(&mut buffer).await;
        }
    }

    async fn flush(&self, buffer: &mut Vec<StatusUpdate>) {
        let updates = std::mem::take(buffer);
        let count = updates.len();
        let mut db = self.database.lock().await;
        if let Err(e) = apply_batch(&mut db, &updates) {
            error!(count = count, error = %e, "Batch flush failed");
        } else {
            debug!(count = count, "Batch flush applied");
        }
    }
}

/// Apply a set of updates in one transaction: one multi-row update per
/// `(status, error_message)` group, then a progress recomputation for each
/// affected task.
fn apply_batch(db: &mut ServerDatabase, updates: &[StatusUpdate]) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }

    let mut groups: HashMap<(CommandStatus, String), Vec<String>> = HashMap::new();
    for update in updates {
        groups
            .entry((update.status, update.error_message.clone()))
            .or_default()
            .push(update.command_id.clone());
    }

    let conn = db.get_connection()?;
    let tx = conn
        .transaction()
        .context("Failed to begin batch transaction")?;

    let mut affected_tasks = Vec::new();
    for ((status, error_message), command_ids) in &groups {
        let tasks = db_commands::task_ids_for_active_commands(&tx, command_ids)?;
        affected_tasks.extend(tasks);
        db_commands::bulk_update_status(&tx, command_ids, *status, error_message)?;
    }

    affected_tasks.sort();
    affected_tasks.dedup();
    for task_id in &affected_tasks {
        LifecycleEngine::recompute_task_progress(&tx, task_id)
            .map_err(|e| anyhow::anyhow!("Progress recompute failed for {}: {}", task_id, e))?;
    }

    tx.commit().context("Failed to commit batch transaction")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{db_hosts, db_tasks};
    use shared::model::{Command, Host, HostApprovalStatus, Task, TaskPriority, TaskStatus};
    use shared::utils::current_timestamp;
    use tempfile::TempDir;

    async fn setup_database() -> (Arc<Mutex<ServerDatabase>>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut db = ServerDatabase::new(temp_dir.path()).unwrap();
        db.initialize().await.unwrap();
        (Arc::new(Mutex::new(db)), temp_dir)
    }

    fn seed_task(db: &mut ServerDatabase, task_id: &str, command_ids: &[&str]) {
        let now = current_timestamp();
        let conn = db.get_connection().unwrap();

        let host = Host {
            host_id: "h1".to_string(),
            hostname: "h1".to_string(),
            ip: "10.0.0.1".to_string(),
            os: "linux".to_string(),
            tags: HashMap::new(),
            status: HostApprovalStatus::Approved,
            first_seen: now,
            last_seen: now,
        };
        db_hosts::upsert_approved(conn, &host).unwrap();

        let task = Task {
            task_id: task_id.to_string(),
            name: "batch test".to_string(),
            description: String::new(),
            created_by: "tests".to_string(),
            status: TaskStatus::Running,
            total_hosts: command_ids.len() as u32,
            completed_hosts: 0,
            failed_hosts: 0,
            started_at: Some(now),
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        db_tasks::insert_task(conn, &task, TaskPriority::Normal, &["h1".to_string()]).unwrap();

        for command_id in command_ids {
            let command = Command {
                command_id: command_id.to_string(),
                task_id: Some(task_id.to_string()),
                host_id: "h1".to_string(),
                command: "echo hi".to_string(),
                parameters: HashMap::new(),
                timeout_seconds: 30,
                status: CommandStatus::Pending,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                started_at: None,
                finished_at: None,
                error_msg: String::new(),
                created_at: now,
            };
            db_commands::insert_command(conn, &command).unwrap();
        }
    }

    #[tokio::test]
    async fn test_apply_batch_groups_and_recomputes_progress() {
        let (database, _guard) = setup_database().await;
        {
            let mut db = database.lock().await;
            seed_task(&mut db, "t1", &["c1", "c2"]);
        }

        let updates = vec![
            StatusUpdate {
                command_id: "c1".to_string(),
                status: CommandStatus::Failed,
                error_message: "Agent disconnected".to_string(),
            },
            StatusUpdate {
                command_id: "c2".to_string(),
                status: CommandStatus::Failed,
                error_message: "Agent disconnected".to_string(),
            },
        ];

        {
            let mut db = database.lock().await;
            apply_batch(&mut db, &updates).unwrap();
        }

        let mut db = database.lock().await;
        let conn = db.get_connection().unwrap();
        let command = db_commands::get_command(conn, "c1").unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert_eq!(command.error_msg, "Agent disconnected");
        assert!(command.finished_at.is_some());

        // Both hosts failed, so the task is terminal failed.
        let task = db_tasks::get_task(conn, "t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failed_hosts, 2);
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_apply_batch_skips_terminal_commands() {
        let (database, _guard) = setup_database().await;
        {
            let mut db = database.lock().await;
            seed_task(&mut db, "t1", &["c1"]);
            let conn = db.get_connection().unwrap();
            db_commands::update_command_pair(
                conn,
                "c1",
                "h1",
                shared::model::CommandHostStatus::Completed,
                Some(10),
                Some("done"),
                Some(""),
                Some(0),
                Some(current_timestamp()),
                Some(current_timestamp()),
                Some(""),
            )
            .unwrap();
        }

        let updates = vec![StatusUpdate {
            command_id: "c1".to_string(),
            status: CommandStatus::Failed,
            error_message: "late failure".to_string(),
        }];

        {
            let mut db = database.lock().await;
            apply_batch(&mut db, &updates).unwrap();
        }

        let mut db = database.lock().await;
        let conn = db.get_connection().unwrap();
        let command = db_commands::get_command(conn, "c1").unwrap().unwrap();
        // The completed command keeps its terminal state.
        assert_eq!(command.status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn test_pipeline_flushes_by_size() {
        let (database, _guard) = setup_database().await;
        {
            let mut db = database.lock().await;
            seed_task(&mut db, "t1", &["c1", "c2"]);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let settings = BatchSettings {
            batch_size: 2,
            batch_timeout_ms: 60_000,
            queue_capacity: 10,
        };
        let pipeline =
            BatchUpdatePipeline::start(settings, Arc::clone(&database), shutdown_tx.subscribe());

        for command_id in ["c1", "c2"] {
            pipeline
                .submit(StatusUpdate {
                    command_id: command_id.to_string(),
                    status: CommandStatus::Canceled,
                    error_message: "Task canceled".to_string(),
                })
                .await
                .unwrap();
        }

        // Size-triggered flush happens without waiting for the timer.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut db = database.lock().await;
        let conn = db.get_connection().unwrap();
        let command = db_commands::get_command(conn, "c2").unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Canceled);
    }
}
