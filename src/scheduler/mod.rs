//! Memory-aware request scheduler
//!
//! A bounded priority queue drained by a fixed-interval tick loop. Lower
//! priority numbers are more urgent; insertion is stable, so requests of
//! equal priority run in arrival order. The drain loop defers to the memory
//! monitor: above the configured usage threshold it backs off exponentially
//! instead of dequeuing, and a transition to critical status cancels every
//! queued request outside the top-priority tier. Work that is already
//! running is never interrupted; pressure only throttles admission.

use crate::config::SchedulerConfig;
use crate::errors::SchedulerError;
use crate::utils::jitter::backoff_delay;
use crate::utils::memory_monitor::{MemoryMonitor, MemoryStatus};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Highest-urgency priority; the only tier that survives a critical
/// memory transition.
pub const PRIORITY_CRITICAL: u8 = 0;
pub const PRIORITY_HIGH: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 2;
pub const PRIORITY_LOW: u8 = 3;

type Operation = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct ScheduledRequest {
    id: Uuid,
    priority: u8,
    operation: Operation,
    enqueued_at: Instant,
    retries: u32,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
}

/// Handle returned from `schedule`; resolves when the request finishes.
pub struct RequestHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<(), SchedulerError>>,
}

impl RequestHandle {
    pub async fn await_result(self) -> Result<(), SchedulerError> {
        self.rx
            .await
            .unwrap_or(Err(SchedulerError::ShuttingDown))
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub pressure_ticks: u32,
    pub max_wait_ms: u64,
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    rejected: u64,
    max_wait_ms: u64,
}

struct SchedulerState {
    queue: VecDeque<ScheduledRequest>,
    running: usize,
    pressure_ticks: u32,
    backoff_until: Option<Instant>,
    counters: Counters,
}

/// Memory-aware priority scheduler
#[derive(Clone)]
pub struct RequestScheduler {
    config: SchedulerConfig,
    monitor: MemoryMonitor,
    state: Arc<Mutex<SchedulerState>>,
}

impl RequestScheduler {
    pub fn new(config: SchedulerConfig, monitor: MemoryMonitor) -> Self {
        Self {
            config,
            monitor,
            state: Arc::new(Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                running: 0,
                pressure_ticks: 0,
                backoff_until: None,
                counters: Counters::default(),
            })),
        }
    }

    /// Enqueue an operation. Fails fast when the queue is full or memory
    /// status is critical; the operation is stored as a factory so it can
    /// be re-invoked on retry.
    pub async fn schedule<F, Fut>(
        &self,
        priority: u8,
        operation: F,
    ) -> Result<RequestHandle, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        if !self.monitor.should_accept_new_requests().await {
            let mut state = self.state.lock().await;
            state.counters.rejected += 1;
            return Err(SchedulerError::MemoryPressure);
        }

        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let request = ScheduledRequest {
            id,
            priority,
            operation: Arc::new(move || Box::pin(operation()) as BoxFuture<'static, _>),
            enqueued_at: Instant::now(),
            retries: 0,
            responder: tx,
        };

        let mut state = self.state.lock().await;
        if state.queue.len() >= self.config.max_queue_size {
            state.counters.rejected += 1;
            return Err(SchedulerError::QueueFull {
                size: state.queue.len(),
                max: self.config.max_queue_size,
            });
        }
        Self::insert_by_priority(&mut state.queue, request);
        debug!(request_id = %id, priority = priority, queued = state.queue.len(), "request queued");
        Ok(RequestHandle { id, rx })
    }

    /// Stable insert: before the first entry with a numerically greater
    /// priority, after every entry with the same or smaller one.
    fn insert_by_priority(queue: &mut VecDeque<ScheduledRequest>, request: ScheduledRequest) {
        let position = queue
            .iter()
            .position(|queued| queued.priority > request.priority)
            .unwrap_or(queue.len());
        queue.insert(position, request);
    }

    /// Spawn the drain loop. Runs until the token is cancelled; on shutdown
    /// every queued request resolves with `ShuttingDown`.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut status_rx = self.monitor.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        scheduler.drain_on_shutdown().await;
                        break;
                    }
                    change = status_rx.recv() => {
                        if let Ok(change) = change
                            && change.to == MemoryStatus::Critical
                        {
                            scheduler.cancel_non_critical().await;
                        }
                    }
                    _ = ticker.tick() => {
                        scheduler.tick().await;
                    }
                }
            }
        })
    }

    async fn tick(&self) {
        let now = Instant::now();
        {
            let state = self.state.lock().await;
            if let Some(until) = state.backoff_until
                && now < until
            {
                return;
            }
        }

        // Memory gate first: under pressure, nothing leaves the queue.
        let usage = self.monitor.usage_fraction().await;
        if usage > self.config.memory_threshold_percent {
            let mut state = self.state.lock().await;
            state.pressure_ticks += 1;
            let delay = backoff_delay(
                self.config.backoff_base,
                state.pressure_ticks.saturating_sub(1),
                self.config.backoff_max,
                0.0,
            );
            state.backoff_until = Some(now + delay);
            warn!(
                usage_percent = (usage * 100.0) as u64,
                pressure_ticks = state.pressure_ticks,
                backoff_ms = delay.as_millis() as u64,
                "scheduler backing off under memory pressure"
            );
            return;
        }

        let request = {
            let mut state = self.state.lock().await;
            if state.pressure_ticks > 0 {
                info!(pressure_ticks = state.pressure_ticks, "memory pressure cleared");
                state.pressure_ticks = 0;
                state.backoff_until = None;
            }
            if state.running >= self.config.max_concurrent {
                return;
            }
            // One dequeue per tick keeps admission smooth under bursts.
            let Some(request) = state.queue.pop_front() else {
                return;
            };
            state.running += 1;
            let waited = request.enqueued_at.elapsed().as_millis() as u64;
            state.counters.max_wait_ms = state.counters.max_wait_ms.max(waited);
            debug!(
                request_id = %request.id,
                priority = request.priority,
                waited_ms = waited,
                "request dequeued"
            );
            request
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.execute(request).await;
        });
    }

    async fn execute(&self, mut request: ScheduledRequest) {
        loop {
            let result = (request.operation)().await;
            match result {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state.running -= 1;
                    state.counters.completed += 1;
                    drop(state);
                    let _ = request.responder.send(Ok(()));
                    return;
                }
                Err(message) if request.retries < self.config.max_retries => {
                    request.retries += 1;
                    let delay = backoff_delay(
                        self.config.backoff_base,
                        request.retries - 1,
                        self.config.backoff_max,
                        0.0,
                    );
                    debug!(
                        request_id = %request.id,
                        retry = request.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(message) => {
                    let mut state = self.state.lock().await;
                    state.running -= 1;
                    state.counters.failed += 1;
                    drop(state);
                    warn!(
                        request_id = %request.id,
                        retries = request.retries,
                        error = %message,
                        "request failed permanently"
                    );
                    let _ = request
                        .responder
                        .send(Err(SchedulerError::OperationFailed { message }));
                    return;
                }
            }
        }
    }

    /// Reject everything outside the top-priority tier. Called on a
    /// transition to critical memory status.
    async fn cancel_non_critical(&self) {
        let mut state = self.state.lock().await;
        let before = state.queue.len();
        let drained: Vec<ScheduledRequest> = state.queue.drain(..).collect();
        let mut kept = VecDeque::with_capacity(before);
        for request in drained {
            if request.priority == PRIORITY_CRITICAL {
                kept.push_back(request);
            } else {
                state.counters.rejected += 1;
                let _ = request.responder.send(Err(SchedulerError::MemoryPressure));
            }
        }
        let cancelled = before - kept.len();
        state.queue = kept;
        if cancelled > 0 {
            warn!(
                cancelled = cancelled,
                kept = state.queue.len(),
                "cancelled queued requests on critical memory status"
            );
        }
    }

    async fn drain_on_shutdown(&self) {
        let mut state = self.state.lock().await;
        for request in state.queue.drain(..) {
            let _ = request.responder.send(Err(SchedulerError::ShuttingDown));
        }
        info!("scheduler stopped");
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        SchedulerStats {
            queued: state.queue.len(),
            running: state.running,
            completed: state.counters.completed,
            failed: state.counters.failed,
            rejected: state.counters.rejected,
            pressure_ticks: state.pressure_ticks,
            max_wait_ms: state.counters.max_wait_ms,
        }
    }
}
