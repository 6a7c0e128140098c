//! Task admission scheduler
//!
//! A priority-ordered admission queue with per-host concurrency caps, a
//! worker pool, retry with backoff and adaptive throttling against the
//! system load signal. The scheduler owns a queued task until admission;
//! from the moment a worker hands it to the lifecycle engine, the engine
//! owns it.
//!
//! Ordering is strict: priority descending, then enqueue time ascending.
//! Insertion keeps the vector sorted (O(n)), which preserves FIFO within a
//! priority, including across retry re-insertions.

use crate::lifecycle::LifecycleEngine;
use crate::load_monitor::SystemLoadMonitor;
use async_trait::async_trait;
use shared::config::{LoadBalanceStrategy, SchedulerSettings};
use shared::model::TaskPriority;
use shared::utils::{current_timestamp, current_timestamp_millis};
use shared::ControlError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Maximum admission retries per task before it is dropped with an error.
const MAX_RETRIES: u32 = 3;
/// Backoff unit: a task's n-th retry waits n times this long.
const RETRY_BACKOFF: Duration = Duration::from_secs(30);
/// Hosts whose load report is older than this are swept unavailable.
const HOST_STALE_AFTER_SECS: i64 = 300;
/// Ceiling for adaptive tuning of the global concurrency cap.
const ADAPTIVE_MAX_CEILING: usize = 100;
/// Floor for adaptive tuning of the global concurrency cap.
const ADAPTIVE_MAX_FLOOR: usize = 5;
/// Per-host CPU ceiling for admission.
const HOST_CPU_LIMIT: f64 = 80.0;
/// Per-host memory ceiling for admission.
const HOST_MEM_LIMIT: f64 = 80.0;

/// What a worker does with an admitted task. The lifecycle engine is the
/// production implementation; tests substitute their own.
#[async_trait]
pub trait TaskStarter: Send + Sync {
    async fn start_task(&self, task_id: &str) -> Result<(), ControlError>;
}

#[async_trait]
impl TaskStarter for LifecycleEngine {
    async fn start_task(&self, task_id: &str) -> Result<(), ControlError> {
        LifecycleEngine::start_task(self, task_id).await
    }
}

/// A task waiting for admission.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: String,
    pub priority: TaskPriority,
    /// Enqueue time in milliseconds; kept across retries so a retried task
    /// does not jump ahead of its peers.
    pub created_at: i64,
    pub host_ids: Vec<String>,
    pub retries: u32,
}

/// Mutable load state per host, fed by status reports and admission.
#[derive(Debug, Clone)]
pub struct HostLoad {
    pub running_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub available: bool,
    pub last_updated: i64,
}

impl HostLoad {
    fn new(max_concurrent_tasks: usize) -> Self {
        Self {
            running_tasks: 0,
            max_concurrent_tasks,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            available: true,
            last_updated: current_timestamp(),
        }
    }
}

/// Counters exposed for observability and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent_tasks: usize,
    pub tracked_hosts: usize,
}

struct SchedulerState {
    queue: Vec<QueuedTask>,
    running: HashMap<String, QueuedTask>,
    host_loads: HashMap<String, HostLoad>,
    /// Current global cap; adaptively tuned when enabled.
    max_concurrent_tasks: usize,
    /// Worker channels, filled by `start`.
    workers: Vec<mpsc::Sender<QueuedTask>>,
}

struct SchedulerCore {
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
    starter: Arc<dyn TaskStarter>,
    load_monitor: Arc<SystemLoadMonitor>,
    /// Gauge the load monitor reads as its concurrency signal.
    active_gauge: Arc<AtomicUsize>,
}

/// Shared handle to the scheduler. Cloning is cheap.
#[derive(Clone)]
pub struct TaskScheduler {
    core: Arc<SchedulerCore>,
}

impl TaskScheduler {
    pub fn new(
        settings: SchedulerSettings,
        starter: Arc<dyn TaskStarter>,
        load_monitor: Arc<SystemLoadMonitor>,
        active_gauge: Arc<AtomicUsize>,
    ) -> Self {
        let max_concurrent_tasks = settings.max_concurrent_tasks;
        Self {
            core: Arc::new(SchedulerCore {
                settings,
                state: Mutex::new(SchedulerState {
                    queue: Vec::new(),
                    running: HashMap::new(),
                    host_loads: HashMap::new(),
                    max_concurrent_tasks,
                    workers: Vec::new(),
                }),
                starter,
                load_monitor,
                active_gauge,
            }),
        }
    }

    /// Spawn the worker pool. Called once before `run`.
    pub async fn start(&self) {
        let mut state = self.core.state.lock().await;
        for worker_id in 0..self.core.settings.worker_count {
            let (tx, rx) = mpsc::channel(self.core.settings.worker_channel_capacity);
            state.workers.push(tx);
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.worker_loop(worker_id, rx).await;
            });
        }
        info!(
            workers = self.core.settings.worker_count,
            strategy = ?self.core.settings.load_balance_strategy,
            "Scheduler worker pool started"
        );
    }

    /// Main scheduler loop: admission ticks, adaptive throttling and host
    /// liveness sweeps on independent cadences, until shutdown.
    pub async fn run(&self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_millis(
            self.core.settings.tick_interval_ms.max(10),
        ));
        let mut throttle_tick = tokio::time::interval(Duration::from_secs(30));
        let mut liveness_tick = tokio::time::interval(Duration::from_secs(
            self.core.settings.host_load_update_interval_seconds.max(1),
        ));

        info!("Scheduler loop started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.admit_ready_tasks().await;
                }
                _ = throttle_tick.tick() => {
                    if self.core.settings.adaptive_throttling {
                        self.adjust_concurrency().await;
                    }
                }
                _ = liveness_tick.tick() => {
                    self.sweep_stale_hosts().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        // Dropping the worker channels lets the workers drain and exit.
        let mut state = self.core.state.lock().await;
        state.workers.clear();
        info!(
            queued = state.queue.len(),
            running = state.running.len(),
            "Scheduler stopped"
        );
    }

    /// Put a task on the admission queue. Fails when the queue is at
    /// capacity or the task is already queued or running.
    pub async fn enqueue_task(
        &self,
        task_id: &str,
        priority: TaskPriority,
        host_ids: Vec<String>,
    ) -> Result<(), ControlError> {
        let mut state = self.core.state.lock().await;

        if state.queue.len() >= self.core.settings.queue_capacity {
            return Err(ControlError::Conflict(format!(
                "Admission queue is full ({} tasks)",
                state.queue.len()
            )));
        }
        if state.running.contains_key(task_id)
            || state.queue.iter().any(|t| t.task_id == task_id)
        {
            return Err(ControlError::Conflict(format!(
                "Task already scheduled: {}",
                task_id
            )));
        }

        let task = QueuedTask {
            task_id: task_id.to_string(),
            priority,
            created_at: current_timestamp_millis(),
            host_ids,
            retries: 0,
        };
        Self::insert_by_priority(&mut state.queue, task);

        debug!(task_id = %task_id, priority = %priority.as_str(), "Task enqueued");
        Ok(())
    }

    /// Remove a task from the queue, or from the running set with counter
    /// rollback. Returns whether anything was removed.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = self.core.state.lock().await;

        if let Some(pos) = state.queue.iter().position(|t| t.task_id == task_id) {
            state.queue.remove(pos);
            debug!(task_id = %task_id, "Canceled queued task");
            return true;
        }

        if let Some(task) = state.running.remove(task_id) {
            Self::release_hosts(&mut state, &task);
            self.core.active_gauge.store(state.running.len(), Ordering::Relaxed);
            debug!(task_id = %task_id, "Canceled running task");
            return true;
        }

        false
    }

    /// Feed a host's reported utilisation into the admission table.
    pub async fn update_host_load(&self, host_id: &str, cpu_usage: f64, memory_usage: f64) {
        let mut state = self.core.state.lock().await;
        let max_per_host = self.core.settings.max_tasks_per_host;
        let load = state
            .host_loads
            .entry(host_id.to_string())
            .or_insert_with(|| HostLoad::new(max_per_host));
        load.cpu_usage = cpu_usage;
        load.memory_usage = memory_usage;
        load.available = true;
        load.last_updated = current_timestamp();
    }

    /// Snapshot of queue/running/host counters.
    pub async fn stats(&self) -> SchedulerStats {
        let state = self.core.state.lock().await;
        SchedulerStats {
            queued: state.queue.len(),
            running: state.running.len(),
            max_concurrent_tasks: state.max_concurrent_tasks,
            tracked_hosts: state.host_loads.len(),
        }
    }

    /// Insert keeping priority-desc, enqueue-time-asc order.
    fn insert_by_priority(queue: &mut Vec<QueuedTask>, task: QueuedTask) {
        let pos = queue
            .iter()
            .position(|existing| {
                existing.priority < task.priority
                    || (existing.priority == task.priority && existing.created_at > task.created_at)
            })
            .unwrap_or(queue.len());
        queue.insert(pos, task);
    }

    /// One scheduler tick, also callable directly: admit every task whose
    /// invariants hold.
    pub async fn tick_once(&self) {
        self.admit_ready_tasks().await;
    }

    /// One admission pass: admit every task whose invariants hold, skipping
    /// blocked tasks so a lower-priority task on idle hosts is not starved
    /// by a blocked higher-priority one.
    async fn admit_ready_tasks(&self) {
        // The system load gate applies to the whole pass.
        let system_load = self.core.load_monitor.current_load().await;
        let load_ok = !self.core.settings.adaptive_throttling
            || system_load <= self.core.settings.system_load_threshold;
        if !load_ok {
            debug!(load = system_load, "Admission paused: system load above threshold");
            return;
        }

        loop {
            let mut state = self.core.state.lock().await;

            if state.workers.is_empty() {
                return;
            }
            if state.running.len() >= state.max_concurrent_tasks {
                return;
            }

            let Some(pos) = Self::find_admissible(&state) else {
                return;
            };

            // Admit: dequeue, count as running, charge every host.
            let task = state.queue.remove(pos);
            for host_id in &task.host_ids {
                let max_per_host = self.core.settings.max_tasks_per_host;
                let load = state
                    .host_loads
                    .entry(host_id.clone())
                    .or_insert_with(|| HostLoad::new(max_per_host));
                load.running_tasks += 1;
            }
            state.running.insert(task.task_id.clone(), task.clone());
            self.core.active_gauge.store(state.running.len(), Ordering::Relaxed);

            let worker_index = self.select_worker(&state, &task);
            let worker = state.workers[worker_index].clone();

            match worker.try_send(task.clone()) {
                Ok(()) => {
                    debug!(
                        task_id = %task.task_id,
                        worker = worker_index,
                        "Task dispatched to worker"
                    );
                }
                Err(mpsc::error::TrySendError::Full(task))
                | Err(mpsc::error::TrySendError::Closed(task)) => {
                    // Roll the admission back completely: no side effects
                    // may leak when the worker cannot take the task.
                    state.running.remove(&task.task_id);
                    Self::release_hosts(&mut state, &task);
                    self.core.active_gauge.store(state.running.len(), Ordering::Relaxed);
                    state.queue.insert(0, task);
                    warn!(worker = worker_index, "Worker channel full, admission rolled back");
                    return;
                }
            }
        }
    }

    /// Index of the first queued task whose admission invariants all hold.
    fn find_admissible(state: &SchedulerState) -> Option<usize> {
        state.queue.iter().position(|task| {
            task.host_ids.iter().all(|host_id| {
                match state.host_loads.get(host_id) {
                    Some(load) => {
                        load.available
                            && load.running_tasks < load.max_concurrent_tasks
                            && load.cpu_usage <= HOST_CPU_LIMIT
                            && load.memory_usage <= HOST_MEM_LIMIT
                    }
                    // A host we have never heard about gets the benefit of
                    // the doubt; its entry is created on admission.
                    None => true,
                }
            })
        })
    }

    /// Pick a worker index according to the configured strategy.
    fn select_worker(&self, state: &SchedulerState, task: &QueuedTask) -> usize {
        let worker_count = state.workers.len();
        match self.core.settings.load_balance_strategy {
            LoadBalanceStrategy::RoundRobin => rand::random::<u32>() as usize % worker_count,
            LoadBalanceStrategy::LeastConnections => {
                // The worker with the most free capacity has the shortest
                // pending queue.
                (0..worker_count)
                    .max_by_key(|&i| state.workers[i].capacity())
                    .unwrap_or(0)
            }
            LoadBalanceStrategy::ResourceBased => {
                let host_pressure = if task.host_ids.is_empty() {
                    0.0
                } else {
                    task.host_ids
                        .iter()
                        .map(|h| {
                            state
                                .host_loads
                                .get(h)
                                .map(|l| l.cpu_usage + l.memory_usage)
                                .unwrap_or(0.0)
                        })
                        .sum::<f64>()
                        / task.host_ids.len() as f64
                };
                (0..worker_count)
                    .min_by(|&a, &b| {
                        let queue_len = |i: usize| {
                            self.core.settings.worker_channel_capacity
                                - state.workers[i].capacity()
                        };
                        let score_a = 10.0 * queue_len(a) as f64 + host_pressure;
                        let score_b = 10.0 * queue_len(b) as f64 + host_pressure;
                        score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(0)
            }
        }
    }

    fn release_hosts(state: &mut SchedulerState, task: &QueuedTask) {
        for host_id in &task.host_ids {
            if let Some(load) = state.host_loads.get_mut(host_id) {
                load.running_tasks = load.running_tasks.saturating_sub(1);
            }
        }
    }

    /// Worker loop: start each admitted task through the lifecycle engine,
    /// retry with linear backoff on failure, and always release the
    /// admission bookkeeping afterwards.
    async fn worker_loop(&self, worker_id: usize, mut rx: mpsc::Receiver<QueuedTask>) {
        debug!(worker = worker_id, "Worker started");
        while let Some(task) = rx.recv().await {
            let result = self.core.starter.start_task(&task.task_id).await;

            // Admission bookkeeping is released whatever the outcome.
            {
                let mut state = self.core.state.lock().await;
                if state.running.remove(&task.task_id).is_some() {
                    Self::release_hosts(&mut state, &task);
                    self.core.active_gauge.store(state.running.len(), Ordering::Relaxed);
                }
            }

            match result {
                Ok(()) => {
                    debug!(worker = worker_id, task_id = %task.task_id, "Task started");
                }
                Err(e) if task.retries < MAX_RETRIES => {
                    let mut retry = task.clone();
                    retry.retries += 1;
                    let backoff = RETRY_BACKOFF * retry.retries;
                    warn!(
                        worker = worker_id,
                        task_id = %retry.task_id,
                        attempt = retry.retries,
                        error = %e,
                        "Task start failed, retrying after backoff"
                    );
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        let mut state = scheduler.core.state.lock().await;
                        // created_at is kept so peers enqueued later stay
                        // behind the retried task.
                        Self::insert_by_priority(&mut state.queue, retry);
                    });
                }
                Err(e) => {
                    error!(
                        worker = worker_id,
                        task_id = %task.task_id,
                        error = %e,
                        "Task start failed permanently after retries"
                    );
                }
            }
        }
        debug!(worker = worker_id, "Worker stopped");
    }

    /// Adaptive tuning of the global concurrency cap, every 30 seconds:
    /// widen under low load with a backlog, narrow under high load.
    pub(crate) async fn adjust_concurrency(&self) {
        let system_load = self.core.load_monitor.current_load().await;
        let mut state = self.core.state.lock().await;

        let old = state.max_concurrent_tasks;
        if system_load < 50.0 && state.queue.len() > 10 && state.running.len() < old {
            state.max_concurrent_tasks = (old + 2).min(ADAPTIVE_MAX_CEILING);
        } else if system_load > 80.0 && old > ADAPTIVE_MAX_FLOOR {
            state.max_concurrent_tasks = old - 2;
        }

        if state.max_concurrent_tasks != old {
            info!(
                load = system_load,
                from = old,
                to = state.max_concurrent_tasks,
                "Adaptive throttling adjusted concurrency cap"
            );
        }
    }

    /// Mark hosts with stale load reports unavailable.
    pub(crate) async fn sweep_stale_hosts(&self) {
        let now = current_timestamp();
        let mut state = self.core.state.lock().await;
        let mut swept = 0;
        for (host_id, load) in state.host_loads.iter_mut() {
            if load.available && now - load.last_updated > HOST_STALE_AFTER_SECS {
                load.available = false;
                swept += 1;
                debug!(host_id = %host_id, "Host marked unavailable: stale load report");
            }
        }
        if swept > 0 {
            info!(swept = swept, "Host liveness sweep marked hosts unavailable");
        }
    }
}
