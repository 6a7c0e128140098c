//! Scheduler admission, ordering and rollback tests
//!
//! These drive the scheduler with a controllable task starter so admitted
//! tasks can be held in flight while the queue and host counters are
//! observed.

use crate::load_monitor::SystemLoadMonitor;
use crate::scheduler::{TaskScheduler, TaskStarter};
use async_trait::async_trait;
use shared::config::{LoadMonitorSettings, SchedulerSettings};
use shared::model::TaskPriority;
use shared::ControlError;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;

/// Starter whose tasks block until permits are released, recording start
/// order.
struct BlockingStarter {
    started: Mutex<Vec<String>>,
    gate: Semaphore,
    fail_ids: Mutex<HashSet<String>>,
}

impl BlockingStarter {
    fn new() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            fail_ids: Mutex::new(HashSet::new()),
        }
    }

    async fn started_ids(&self) -> Vec<String> {
        self.started.lock().await.clone()
    }

    /// Let `n` blocked tasks finish.
    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl TaskStarter for BlockingStarter {
    async fn start_task(&self, task_id: &str) -> Result<(), ControlError> {
        self.started.lock().await.push(task_id.to_string());
        let failing = self.fail_ids.lock().await.contains(task_id);
        // Each release() lets exactly one task through.
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        if failing {
            return Err(ControlError::Storage("induced failure".to_string()));
        }
        Ok(())
    }
}

fn scheduler_with(
    settings: SchedulerSettings,
    starter: Arc<BlockingStarter>,
) -> (TaskScheduler, Arc<SystemLoadMonitor>) {
    let gauge = Arc::new(AtomicUsize::new(0));
    let load_monitor = Arc::new(SystemLoadMonitor::new(
        LoadMonitorSettings::default(),
        Arc::clone(&gauge),
    ));
    let scheduler = TaskScheduler::new(settings, starter, Arc::clone(&load_monitor), gauge);
    (scheduler, load_monitor)
}

fn small_settings() -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_tasks: 2,
        max_tasks_per_host: 1,
        queue_capacity: 100,
        worker_count: 2,
        worker_channel_capacity: 4,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_priority_and_host_cap_admission() {
    let starter = Arc::new(BlockingStarter::new());
    let (scheduler, _) = scheduler_with(small_settings(), Arc::clone(&starter));
    scheduler.start().await;

    // Enqueued low first; ordering is priority desc, then enqueue time.
    scheduler
        .enqueue_task("t-low", TaskPriority::Low, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler
        .enqueue_task("t-urgent", TaskPriority::Urgent, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler
        .enqueue_task("t-normal", TaskPriority::Normal, vec!["h2".to_string()])
        .await
        .unwrap();

    scheduler.tick_once().await;

    // Urgent and normal admitted; low is blocked behind urgent's host cap.
    let stats = scheduler.stats().await;
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 1);

    // Canceling the urgent task frees h1; the low task is admitted next.
    assert!(scheduler.cancel_task("t-urgent").await);
    scheduler.tick_once().await;

    let stats = scheduler.stats().await;
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 0);

    starter.release(8);
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let starter = Arc::new(BlockingStarter::new());
    let settings = SchedulerSettings {
        max_concurrent_tasks: 1,
        max_tasks_per_host: 10,
        worker_count: 1,
        worker_channel_capacity: 4,
        ..Default::default()
    };
    let (scheduler, _) = scheduler_with(settings, Arc::clone(&starter));
    scheduler.start().await;

    scheduler
        .enqueue_task("a", TaskPriority::Normal, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler
        .enqueue_task("b", TaskPriority::Normal, vec!["h2".to_string()])
        .await
        .unwrap();
    scheduler
        .enqueue_task("c", TaskPriority::Urgent, vec!["h3".to_string()])
        .await
        .unwrap();

    // One at a time: c (urgent) first, then a before b.
    for _ in 0..3 {
        scheduler.tick_once().await;
        starter.release(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(starter.started_ids().await, vec!["c", "a", "b"]);
}

#[tokio::test]
async fn test_queue_capacity_and_duplicate_rejection() {
    let starter = Arc::new(BlockingStarter::new());
    let settings = SchedulerSettings {
        queue_capacity: 1,
        ..Default::default()
    };
    let (scheduler, _) = scheduler_with(settings, starter);

    scheduler
        .enqueue_task("t1", TaskPriority::Normal, vec!["h1".to_string()])
        .await
        .unwrap();

    let err = scheduler
        .enqueue_task("t2", TaskPriority::Normal, vec!["h1".to_string()])
        .await;
    assert!(matches!(err, Err(ControlError::Conflict(_))));

    let err = scheduler
        .enqueue_task("t1", TaskPriority::Normal, vec!["h1".to_string()])
        .await;
    assert!(matches!(err, Err(ControlError::Conflict(_))));
}

#[tokio::test]
async fn test_admission_rolls_back_when_worker_channel_full() {
    let starter = Arc::new(BlockingStarter::new());
    let settings = SchedulerSettings {
        max_concurrent_tasks: 10,
        max_tasks_per_host: 5,
        worker_count: 1,
        worker_channel_capacity: 1,
        ..Default::default()
    };
    let (scheduler, _) = scheduler_with(settings, Arc::clone(&starter));
    scheduler.start().await;

    // First task: admitted, pulled by the worker, blocked in the starter.
    scheduler
        .enqueue_task("t1", TaskPriority::Normal, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler.tick_once().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second fills the channel; third cannot be dispatched and must be
    // rolled back to the queue head with no leaked counters.
    scheduler
        .enqueue_task("t2", TaskPriority::Normal, vec!["h2".to_string()])
        .await
        .unwrap();
    scheduler
        .enqueue_task("t3", TaskPriority::Normal, vec!["h3".to_string()])
        .await
        .unwrap();
    scheduler.tick_once().await;

    let stats = scheduler.stats().await;
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 1);

    // Release everything; the rolled-back task is admitted on a later tick,
    // which only works if its host counter was not leaked.
    starter.release(2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.tick_once().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    starter.release(2);

    let started = starter.started_ids().await;
    assert!(started.contains(&"t3".to_string()));
}

#[tokio::test]
async fn test_host_utilisation_blocks_admission() {
    let starter = Arc::new(BlockingStarter::new());
    let (scheduler, _) = scheduler_with(small_settings(), Arc::clone(&starter));
    scheduler.start().await;

    // h1 is reporting CPU above the 80 percent admission ceiling.
    scheduler.update_host_load("h1", 95.0, 10.0).await;

    scheduler
        .enqueue_task("t1", TaskPriority::Normal, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler.tick_once().await;

    let stats = scheduler.stats().await;
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 1);

    // The host recovering unblocks the task.
    scheduler.update_host_load("h1", 20.0, 10.0).await;
    scheduler.tick_once().await;
    assert_eq!(scheduler.stats().await.running, 1);

    starter.release(4);
}

#[tokio::test]
async fn test_adaptive_throttling_widens_under_backlog() {
    let starter = Arc::new(BlockingStarter::new());
    let settings = SchedulerSettings {
        max_concurrent_tasks: 4,
        queue_capacity: 100,
        ..Default::default()
    };
    let (scheduler, _) = scheduler_with(settings, starter);

    // A backlog of more than ten queued tasks with idle load widens the cap.
    for i in 0..12 {
        scheduler
            .enqueue_task(
                &format!("t{}", i),
                TaskPriority::Normal,
                vec![format!("h{}", i)],
            )
            .await
            .unwrap();
    }

    scheduler.adjust_concurrency().await;
    assert_eq!(scheduler.stats().await.max_concurrent_tasks, 6);

    // The backlog persists, so the next adjustment widens again.
    scheduler.adjust_concurrency().await;
    assert_eq!(scheduler.stats().await.max_concurrent_tasks, 8);
}

#[tokio::test]
async fn test_fresh_hosts_survive_liveness_sweep() {
    let starter = Arc::new(BlockingStarter::new());
    let (scheduler, _) = scheduler_with(small_settings(), Arc::clone(&starter));
    scheduler.start().await;

    scheduler.update_host_load("h1", 10.0, 10.0).await;
    scheduler.sweep_stale_hosts().await;

    // A just-reported host stays available and admissible.
    scheduler
        .enqueue_task("t1", TaskPriority::Normal, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler.tick_once().await;
    assert_eq!(scheduler.stats().await.running, 1);

    starter.release(2);
}

#[tokio::test]
async fn test_failed_start_schedules_retry_without_counter_leak() {
    let starter = Arc::new(BlockingStarter::new());
    starter.fail_ids.lock().await.insert("t1".to_string());

    let settings = SchedulerSettings {
        max_concurrent_tasks: 2,
        max_tasks_per_host: 1,
        worker_count: 1,
        worker_channel_capacity: 4,
        ..Default::default()
    };
    let (scheduler, _) = scheduler_with(settings, Arc::clone(&starter));
    scheduler.start().await;

    scheduler
        .enqueue_task("t1", TaskPriority::Normal, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler.tick_once().await;
    starter.release(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The failed task has left the running set; its retry is waiting on the
    // backoff timer, not occupying the host.
    let stats = scheduler.stats().await;
    assert_eq!(stats.running, 0);

    // The host is free for other work in the meantime.
    scheduler
        .enqueue_task("t2", TaskPriority::Normal, vec!["h1".to_string()])
        .await
        .unwrap();
    scheduler.tick_once().await;
    assert_eq!(scheduler.stats().await.running, 1);

    starter.release(4);
}
