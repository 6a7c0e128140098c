//! System load monitor
//!
//! Periodically computes a composite 0–100 load scalar from three signals:
//! process CPU time, process memory against system memory, and the active
//! task count normalized to a design cap. Weights 0.4 / 0.4 / 0.2, clamped.
//! The scheduler consumes the composite for admission and adaptive
//! throttling; operators read it from the system endpoint.
//!
//! Threshold crossings are published as messages on a broadcast channel
//! rather than via registered callbacks, so consumers pick their own
//! delivery context.
//!
//! The CPU and memory probes read /proc and degrade to zero on platforms
//! without it.

use shared::api::LoadWindowStats;
use shared::config::LoadMonitorSettings;
use shared::utils::current_timestamp;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Composite weight of the CPU dimension.
const WEIGHT_CPU: f64 = 0.4;
/// Composite weight of the memory dimension.
const WEIGHT_MEMORY: f64 = 0.4;
/// Composite weight of the concurrency dimension.
const WEIGHT_CONCURRENCY: f64 = 0.2;
/// Clock ticks per second for /proc/self/stat CPU fields.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Severity of a load alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
}

/// Message published when a dimension crosses a threshold.
#[derive(Debug, Clone)]
pub struct LoadAlert {
    /// `cpu`, `memory`, `concurrency` or `composite`.
    pub dimension: &'static str,
    pub level: AlertLevel,
    pub value: f64,
}

/// One sample in the rolling window.
#[derive(Debug, Clone, Copy)]
struct LoadSample {
    timestamp: i64,
    cpu: f64,
    memory: f64,
    concurrency: f64,
    composite: f64,
}

struct MonitorState {
    window: VecDeque<LoadSample>,
    /// Previous cumulative CPU ticks and when they were read.
    prev_cpu: Option<(u64, Instant)>,
    /// Last published level per dimension, to alert only on crossings.
    levels: [(&'static str, AlertLevel); 4],
}

/// Shared handle to the load monitor.
pub struct SystemLoadMonitor {
    settings: LoadMonitorSettings,
    state: Mutex<MonitorState>,
    /// Active scheduler tasks; written by the scheduler.
    active_gauge: Arc<AtomicUsize>,
    alerts: broadcast::Sender<LoadAlert>,
}

impl SystemLoadMonitor {
    pub fn new(settings: LoadMonitorSettings, active_gauge: Arc<AtomicUsize>) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            settings,
            state: Mutex::new(MonitorState {
                window: VecDeque::new(),
                prev_cpu: None,
                levels: [
                    ("cpu", AlertLevel::Normal),
                    ("memory", AlertLevel::Normal),
                    ("concurrency", AlertLevel::Normal),
                    ("composite", AlertLevel::Normal),
                ],
            }),
            active_gauge,
            alerts,
        }
    }

    /// Subscribe to threshold-crossing alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<LoadAlert> {
        self.alerts.subscribe()
    }

    /// Sampling loop, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.settings.sample_interval_seconds.max(1),
        ));
        info!(
            interval = self.settings.sample_interval_seconds,
            window = self.settings.window_size,
            "System load monitor started"
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sample_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Load monitor received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Take one sample: probe the three dimensions, push into the window,
    /// publish alerts for crossings.
    pub async fn sample_once(&self) {
        let mut state = self.state.lock().await;

        let cpu = self.probe_cpu_percent(&mut state);
        let memory = Self::probe_memory_percent();
        let active = self.active_gauge.load(Ordering::Relaxed);
        let concurrency =
            (active as f64 / self.settings.concurrency_cap.max(1) as f64 * 100.0).min(100.0);

        let composite = (WEIGHT_CPU * cpu + WEIGHT_MEMORY * memory + WEIGHT_CONCURRENCY * concurrency)
            .clamp(0.0, 100.0);

        let sample = LoadSample {
            timestamp: current_timestamp(),
            cpu,
            memory,
            concurrency,
            composite,
        };
        state.window.push_back(sample);
        while state.window.len() > self.settings.window_size {
            state.window.pop_front();
        }

        debug!(
            cpu = cpu,
            memory = memory,
            concurrency = concurrency,
            composite = composite,
            "Load sample taken"
        );

        let thresholds = [
            ("cpu", cpu),
            ("memory", memory),
            ("concurrency", concurrency),
            ("composite", composite),
        ];
        for (i, (dimension, value)) in thresholds.into_iter().enumerate() {
            let level = if value >= self.settings.critical_threshold {
                AlertLevel::Critical
            } else if value >= self.settings.warning_threshold {
                AlertLevel::Warning
            } else {
                AlertLevel::Normal
            };
            if level != state.levels[i].1 {
                state.levels[i].1 = level;
                if level != AlertLevel::Normal {
                    warn!(dimension = dimension, value = value, level = ?level, "Load threshold crossed");
                }
                // Nobody listening is fine.
                let _ = self.alerts.send(LoadAlert {
                    dimension,
                    level,
                    value,
                });
            }
        }
    }

    /// Current composite load; 0 before the first sample.
    pub async fn current_load(&self) -> f64 {
        let state = self.state.lock().await;
        state.window.back().map(|s| s.composite).unwrap_or(0.0)
    }

    /// Whether the composite load is at or above the warning threshold.
    pub async fn is_overloaded(&self) -> bool {
        self.current_load().await >= self.settings.warning_threshold
    }

    /// Concurrency the system can take at the current load:
    /// `ceil(max × (1 − load/100))`, never below 1.
    pub async fn recommended_concurrency(&self, max: usize) -> usize {
        let load = self.current_load().await;
        let recommended = (max as f64 * (1.0 - load / 100.0)).ceil() as usize;
        recommended.max(1)
    }

    /// Mean/min/max statistics over the rolling window.
    pub async fn window_stats(&self) -> LoadWindowStats {
        let state = self.state.lock().await;
        let samples = state.window.len();
        if samples == 0 {
            return LoadWindowStats::default();
        }

        let mut stats = LoadWindowStats {
            samples,
            load_min: f64::MAX,
            load_max: f64::MIN,
            ..Default::default()
        };
        for sample in &state.window {
            stats.load_mean += sample.composite;
            stats.cpu_mean += sample.cpu;
            stats.memory_mean += sample.memory;
            stats.concurrency_mean += sample.concurrency;
            stats.load_min = stats.load_min.min(sample.composite);
            stats.load_max = stats.load_max.max(sample.composite);
        }
        let n = samples as f64;
        stats.load_mean /= n;
        stats.cpu_mean /= n;
        stats.memory_mean /= n;
        stats.concurrency_mean /= n;
        stats
    }

    /// The most recent per-dimension values, for the operator endpoint.
    pub async fn current_dimensions(&self) -> (f64, f64, f64) {
        let state = self.state.lock().await;
        state
            .window
            .back()
            .map(|s| (s.cpu, s.memory, s.concurrency))
            .unwrap_or((0.0, 0.0, 0.0))
    }

    /// Process CPU usage as a percentage of one core times the core count,
    /// from the utime/stime delta in /proc/self/stat.
    fn probe_cpu_percent(&self, state: &mut MonitorState) -> f64 {
        let Some(ticks) = Self::read_process_cpu_ticks() else {
            return 0.0;
        };
        let now = Instant::now();

        let percent = match state.prev_cpu {
            Some((prev_ticks, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    let cores = std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1) as f64;
                    let cpu_seconds =
                        ticks.saturating_sub(prev_ticks) as f64 / CLOCK_TICKS_PER_SEC;
                    (cpu_seconds / elapsed / cores * 100.0).clamp(0.0, 100.0)
                }
            }
            None => 0.0,
        };

        state.prev_cpu = Some((ticks, now));
        percent
    }

    /// Cumulative utime+stime of this process in clock ticks.
    fn read_process_cpu_ticks() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // The command field may contain spaces; fields are counted after
        // the closing parenthesis.
        let rest = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // utime and stime are fields 14 and 15 of the full line, i.e.
        // indexes 11 and 12 after the comm field.
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    /// Process resident set size against total system memory.
    fn probe_memory_percent() -> f64 {
        let Some(rss_kb) = Self::read_status_kb("/proc/self/status", "VmRSS:") else {
            return 0.0;
        };
        let Some(total_kb) = Self::read_status_kb("/proc/meminfo", "MemTotal:") else {
            return 0.0;
        };
        if total_kb == 0 {
            return 0.0;
        }
        (rss_kb as f64 / total_kb as f64 * 100.0).clamp(0.0, 100.0)
    }

    fn read_status_kb(path: &str, key: &str) -> Option<u64> {
        let content = std::fs::read_to_string(path).ok()?;
        content
            .lines()
            .find(|line| line.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }
}
