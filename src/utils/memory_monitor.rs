//! Process memory health monitoring
//!
//! Samples process RSS on a fixed interval, keeps a bounded ring of
//! snapshots, and classifies the latest reading against two thresholds
//! derived from the configured memory budget. Status transitions are
//! published over a broadcast channel so the scheduler and caches can react
//! without polling.
//!
//! Classification is deliberately pure and edge-exclusive: a reading exactly
//! at a threshold still belongs to the lower class.

use crate::config::MemoryConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum snapshots retained in the ring
const SNAPSHOT_RING_CAPACITY: usize = 60;

/// Growth/shrink factor for trend detection (first vs last ring entry)
const TREND_FACTOR: f64 = 0.1;

/// One RSS observation
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTrend {
    Growing,
    Shrinking,
    Stable,
    /// Not enough samples yet
    Unknown,
}

/// Published on every status transition
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub from: MemoryStatus,
    pub to: MemoryStatus,
    pub rss_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time statistics for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub rss_bytes: u64,
    pub peak_rss_bytes: u64,
    pub status: MemoryStatus,
    pub trend: MemoryTrend,
    pub snapshot_count: usize,
    pub caches_disabled: bool,
    pub budget_bytes: u64,
}

#[derive(Debug)]
struct MonitorState {
    ring: VecDeque<MemorySnapshot>,
    status: MemoryStatus,
    peak_rss: u64,
}

/// Memory health monitor shared across the service
#[derive(Clone)]
pub struct MemoryMonitor {
    warning_threshold: u64,
    critical_threshold: u64,
    budget_bytes: u64,
    sample_interval: std::time::Duration,
    state: Arc<RwLock<MonitorState>>,
    caches_disabled: Arc<AtomicBool>,
    status_tx: broadcast::Sender<StatusChange>,
    system: Arc<Mutex<System>>,
}

impl MemoryMonitor {
    pub fn new(config: &MemoryConfig) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            warning_threshold: config.warning_threshold_bytes(),
            critical_threshold: config.critical_threshold_bytes(),
            budget_bytes: config.budget_mb * 1024 * 1024,
            sample_interval: config.sample_interval,
            state: Arc::new(RwLock::new(MonitorState {
                ring: VecDeque::with_capacity(SNAPSHOT_RING_CAPACITY),
                status: MemoryStatus::Healthy,
                peak_rss: 0,
            })),
            caches_disabled: Arc::new(AtomicBool::new(false)),
            status_tx,
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Pure classification of an RSS reading. Exactly at a threshold is the
    /// lower class.
    pub fn classify(&self, rss_bytes: u64) -> MemoryStatus {
        if rss_bytes > self.critical_threshold {
            MemoryStatus::Critical
        } else if rss_bytes > self.warning_threshold {
            MemoryStatus::Warning
        } else {
            MemoryStatus::Healthy
        }
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Spawn the sampling loop. Runs until the token is cancelled.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        let interval = self.sample_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("memory monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.sample_now().await;
                    }
                }
            }
        })
    }

    /// Take one RSS sample and record it.
    pub async fn sample_now(&self) {
        let snapshot = {
            let mut system = self.system.lock().await;
            let pid = Pid::from_u32(std::process::id());
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            match system.process(pid) {
                Some(process) => MemorySnapshot {
                    timestamp: Utc::now(),
                    rss_bytes: process.memory(),
                    virtual_bytes: process.virtual_memory(),
                },
                None => {
                    warn!("could not read own process memory");
                    return;
                }
            }
        };
        self.record_snapshot(snapshot).await;
    }

    /// Record a snapshot into the ring and react to status transitions.
    ///
    /// Public so callers with their own readings (and tests) can drive the
    /// monitor deterministically.
    pub async fn record_snapshot(&self, snapshot: MemorySnapshot) {
        let new_status = self.classify(snapshot.rss_bytes);
        let change = {
            let mut state = self.state.write().await;
            if state.ring.len() == SNAPSHOT_RING_CAPACITY {
                state.ring.pop_front();
            }
            state.peak_rss = state.peak_rss.max(snapshot.rss_bytes);
            state.ring.push_back(snapshot.clone());

            let old_status = state.status;
            if old_status != new_status {
                state.status = new_status;
                Some(StatusChange {
                    from: old_status,
                    to: new_status,
                    rss_bytes: snapshot.rss_bytes,
                    timestamp: snapshot.timestamp,
                })
            } else {
                None
            }
        };

        if let Some(change) = change {
            match change.to {
                MemoryStatus::Critical => {
                    warn!(
                        rss_mb = change.rss_bytes / 1024 / 1024,
                        "memory status critical, disabling caches"
                    );
                    self.emergency_cleanup();
                }
                MemoryStatus::Warning => {
                    warn!(
                        rss_mb = change.rss_bytes / 1024 / 1024,
                        from = ?change.from,
                        "memory status warning"
                    );
                }
                MemoryStatus::Healthy => {
                    info!(
                        rss_mb = change.rss_bytes / 1024 / 1024,
                        "memory status recovered, re-enabling caches"
                    );
                    self.caches_disabled.store(false, Ordering::SeqCst);
                }
            }
            // Receivers may come and go; a send with no subscribers is fine.
            let _ = self.status_tx.send(change);
        }
    }

    pub async fn current_status(&self) -> MemoryStatus {
        self.state.read().await.status
    }

    /// Admission predicate: only a critical status refuses new work.
    pub async fn should_accept_new_requests(&self) -> bool {
        self.current_status().await != MemoryStatus::Critical
    }

    /// Latest RSS as a fraction of the configured budget.
    pub async fn usage_fraction(&self) -> f64 {
        let state = self.state.read().await;
        match state.ring.back() {
            Some(snapshot) if self.budget_bytes > 0 => {
                snapshot.rss_bytes as f64 / self.budget_bytes as f64
            }
            _ => 0.0,
        }
    }

    /// Coarse trend over the ring: last vs first sample, ±10%.
    pub async fn trend(&self) -> MemoryTrend {
        let state = self.state.read().await;
        let (Some(first), Some(last)) = (state.ring.front(), state.ring.back()) else {
            return MemoryTrend::Unknown;
        };
        if state.ring.len() < 2 {
            return MemoryTrend::Unknown;
        }
        let first = first.rss_bytes as f64;
        let last = last.rss_bytes as f64;
        if last > first * (1.0 + TREND_FACTOR) {
            MemoryTrend::Growing
        } else if last < first * (1.0 - TREND_FACTOR) {
            MemoryTrend::Shrinking
        } else {
            MemoryTrend::Stable
        }
    }

    /// Disable dependent caches. They are flagged off rather than cleared;
    /// the owners decide what to drop.
    pub fn emergency_cleanup(&self) {
        self.caches_disabled.store(true, Ordering::SeqCst);
    }

    /// Checked by cache owners before admitting new entries.
    pub fn caches_disabled(&self) -> bool {
        self.caches_disabled.load(Ordering::SeqCst)
    }

    pub async fn get_stats(&self) -> MemoryStats {
        let state = self.state.read().await;
        let trend = {
            // Inline trend over the already-held lock.
            match (state.ring.front(), state.ring.back()) {
                (Some(first), Some(last)) if state.ring.len() >= 2 => {
                    let first = first.rss_bytes as f64;
                    let last = last.rss_bytes as f64;
                    if last > first * (1.0 + TREND_FACTOR) {
                        MemoryTrend::Growing
                    } else if last < first * (1.0 - TREND_FACTOR) {
                        MemoryTrend::Shrinking
                    } else {
                        MemoryTrend::Stable
                    }
                }
                _ => MemoryTrend::Unknown,
            }
        };
        MemoryStats {
            rss_bytes: state.ring.back().map(|s| s.rss_bytes).unwrap_or(0),
            peak_rss_bytes: state.peak_rss,
            status: state.status,
            trend,
            snapshot_count: state.ring.len(),
            caches_disabled: self.caches_disabled(),
            budget_bytes: self.budget_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_monitor() -> MemoryMonitor {
        // 100 MB budget, warning at 50 MB, critical at 80 MB.
        MemoryMonitor::new(&MemoryConfig {
            budget_mb: 100,
            warning_fraction: 0.5,
            critical_fraction: 0.8,
            sample_interval: Duration::from_secs(1),
        })
    }

    fn snapshot(rss_mb: u64) -> MemorySnapshot {
        MemorySnapshot {
            timestamp: Utc::now(),
            rss_bytes: rss_mb * 1024 * 1024,
            virtual_bytes: rss_mb * 2 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn exactly_at_threshold_is_lower_class() {
        let monitor = test_monitor();
        assert_eq!(monitor.classify(50 * 1024 * 1024), MemoryStatus::Healthy);
        assert_eq!(monitor.classify(50 * 1024 * 1024 + 1), MemoryStatus::Warning);
        assert_eq!(monitor.classify(80 * 1024 * 1024), MemoryStatus::Warning);
        assert_eq!(monitor.classify(80 * 1024 * 1024 + 1), MemoryStatus::Critical);
    }

    #[tokio::test]
    async fn ring_is_bounded() {
        let monitor = test_monitor();
        for _ in 0..200 {
            monitor.record_snapshot(snapshot(10)).await;
        }
        assert_eq!(monitor.get_stats().await.snapshot_count, 60);
    }

    #[tokio::test]
    async fn transition_to_critical_disables_caches_and_broadcasts() {
        let monitor = test_monitor();
        let mut rx = monitor.subscribe();

        monitor.record_snapshot(snapshot(10)).await;
        monitor.record_snapshot(snapshot(90)).await;

        assert!(monitor.caches_disabled());
        assert!(!monitor.should_accept_new_requests().await);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, MemoryStatus::Healthy);
        assert_eq!(change.to, MemoryStatus::Critical);

        // Recovery re-enables caches.
        monitor.record_snapshot(snapshot(10)).await;
        assert!(!monitor.caches_disabled());
        assert!(monitor.should_accept_new_requests().await);
    }

    #[tokio::test]
    async fn warning_still_accepts_requests() {
        let monitor = test_monitor();
        monitor.record_snapshot(snapshot(60)).await;
        assert_eq!(monitor.current_status().await, MemoryStatus::Warning);
        assert!(monitor.should_accept_new_requests().await);
    }

    #[tokio::test]
    async fn trend_compares_first_and_last() {
        let monitor = test_monitor();
        assert_eq!(monitor.trend().await, MemoryTrend::Unknown);

        monitor.record_snapshot(snapshot(10)).await;
        assert_eq!(monitor.trend().await, MemoryTrend::Unknown);

        monitor.record_snapshot(snapshot(20)).await;
        assert_eq!(monitor.trend().await, MemoryTrend::Growing);

        let monitor = test_monitor();
        monitor.record_snapshot(snapshot(20)).await;
        monitor.record_snapshot(snapshot(5)).await;
        assert_eq!(monitor.trend().await, MemoryTrend::Shrinking);

        let monitor = test_monitor();
        monitor.record_snapshot(snapshot(20)).await;
        monitor.record_snapshot(snapshot(21)).await;
        assert_eq!(monitor.trend().await, MemoryTrend::Stable);
    }
}
