//! Fixed-window rate limiting and windowed circuit breaking
//!
//! Both utilities share the same record shape: a per-context counter plus a
//! window expiry instant, kept in an `Arc<RwLock<HashMap>>` so clones share
//! state across tasks. The limiter counts admitted operations; the breaker
//! counts failures. Neither spawns background tasks; expiry is evaluated
//! lazily on access.

use crate::errors::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One fixed window for one context
#[derive(Debug, Clone)]
struct WindowRecord {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window rate limiter keyed by context string
///
/// A window is never sliding: when it expires the record is replaced
/// wholesale with `count = 1`. After any successful check the invariant
/// `count <= max_requests` holds.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: String,
    max_requests: u32,
    window: Duration,
    records: Arc<RwLock<HashMap<String, WindowRecord>>>,
}

impl RateLimiter {
    /// A limiter that can never admit anything is a configuration bug, so
    /// zero `max_requests` or a zero window fails construction.
    pub fn new(name: &str, max_requests: u32, window: Duration) -> Result<Self, AppError> {
        if max_requests == 0 {
            return Err(AppError::configuration(format!(
                "rate limiter '{name}': max_requests must be greater than zero"
            )));
        }
        if window.is_zero() {
            return Err(AppError::configuration(format!(
                "rate limiter '{name}': window must be greater than zero"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            max_requests,
            window,
            records: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Check and consume one slot for `context`. Returns `false` when the
    /// current window is exhausted.
    pub async fn is_operation_allowed(&self, context: &str) -> bool {
        let now = Instant::now();
        let mut records = self.records.write().await;

        match records.get_mut(context) {
            Some(record) if now < record.reset_at => {
                if record.count < self.max_requests {
                    record.count += 1;
                    true
                } else {
                    debug!(
                        limiter = %self.name,
                        context = context,
                        count = record.count,
                        "rate limit window exhausted"
                    );
                    false
                }
            }
            _ => {
                // Expired or absent: start a fresh window with this request.
                records.insert(
                    context.to_string(),
                    WindowRecord {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }

    /// Time until the context's current window resets. Zero when there is no
    /// active window.
    pub async fn time_until_reset(&self, context: &str) -> Duration {
        let records = self.records.read().await;
        records
            .get(context)
            .map(|r| r.reset_at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until a slot is available for `context`, then consume it.
    ///
    /// Polling is adaptive: with more than a second left in the window the
    /// task sleeps through to the reset (plus a small buffer) in one go
    /// instead of spinning.
    pub async fn wait_for_permit(&self, context: &str) {
        const POLL_INTERVAL: Duration = Duration::from_millis(100);
        const RESET_BUFFER: Duration = Duration::from_millis(50);

        loop {
            if self.is_operation_allowed(context).await {
                return;
            }
            let remaining = self.time_until_reset(context).await;
            let sleep_for = if remaining > Duration::from_secs(1) {
                remaining + RESET_BUFFER
            } else {
                remaining.min(POLL_INTERVAL).max(Duration::from_millis(10))
            };
            debug!(
                limiter = %self.name,
                context = context,
                sleep_ms = sleep_for.as_millis() as u64,
                "waiting for rate limit window"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Drop records whose window has passed. Called from the periodic
    /// cleanup tick; correctness does not depend on it.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| now < record.reset_at);
        before - records.len()
    }

    pub async fn tracked_contexts(&self) -> usize {
        self.records.read().await.len()
    }
}

/// Failure-counting circuit breaker on the fixed-window record shape
///
/// After `failure_threshold` failures within `reset_timeout` the context is
/// open and calls fail fast. There is no half-open probe state: once the
/// window expires the record is discarded and the circuit is fully closed
/// again.
#[derive(Debug, Clone)]
pub struct WindowedCircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    records: Arc<RwLock<HashMap<String, WindowRecord>>>,
}

impl WindowedCircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, reset_timeout: Duration) -> Result<Self, AppError> {
        if failure_threshold == 0 {
            return Err(AppError::configuration(format!(
                "circuit breaker '{name}': failure_threshold must be greater than zero"
            )));
        }
        if reset_timeout.is_zero() {
            return Err(AppError::configuration(format!(
                "circuit breaker '{name}': reset_timeout must be greater than zero"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            failure_threshold,
            reset_timeout,
            records: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// True when the context has tripped and its window has not expired.
    pub async fn is_open(&self, context: &str) -> bool {
        let now = Instant::now();
        let records = self.records.read().await;
        match records.get(context) {
            Some(record) if now < record.reset_at => record.count >= self.failure_threshold,
            _ => false,
        }
    }

    /// Record one failure for `context`. Returns `true` when this failure
    /// tripped the circuit open.
    pub async fn record_failure(&self, context: &str) -> bool {
        let now = Instant::now();
        let mut records = self.records.write().await;

        let record = records
            .entry(context.to_string())
            .and_modify(|record| {
                if now < record.reset_at {
                    record.count += 1;
                } else {
                    record.count = 1;
                    record.reset_at = now + self.reset_timeout;
                }
            })
            .or_insert_with(|| WindowRecord {
                count: 1,
                reset_at: now + self.reset_timeout,
            });

        let tripped = record.count == self.failure_threshold;
        if tripped {
            warn!(
                breaker = %self.name,
                context = context,
                failures = record.count,
                reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                "circuit opened"
            );
        }
        tripped
    }

    /// A success closes the circuit immediately by discarding the record.
    pub async fn record_success(&self, context: &str) {
        self.records.write().await.remove(context);
    }

    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| now < record.reset_at);
        before - records.len()
    }

    pub async fn open_contexts(&self) -> usize {
        let now = Instant::now();
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| now < r.reset_at && r.count >= self.failure_threshold)
            .count()
    }
}
