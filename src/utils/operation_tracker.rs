//! Async operation tracking
//!
//! Keeps a registry of in-flight named operations so slow or wedged work is
//! visible in stats and logs. `track` races an operation against a timeout
//! and reports `TimedOut` distinctly from the operation's own error, which
//! the fetch pipeline uses to tell a slow origin from a broken one.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// A currently running tracked operation
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

/// Counters exposed through the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

#[derive(Error, Debug)]
pub enum TrackedError<E> {
    #[error("Operation '{name}' timed out after {timeout:?}")]
    TimedOut { name: String, timeout: Duration },

    #[error(transparent)]
    Failed(E),
}

/// Registry of named in-flight async operations
#[derive(Debug, Default)]
pub struct OperationTracker {
    active: Arc<RwLock<HashMap<Uuid, ActiveOperation>>>,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` under `timeout`, recording start/end and outcome.
    ///
    /// The registry entry is removed on every exit path, including timeout.
    pub async fn track<T, E, F>(
        &self,
        name: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T, TrackedError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let id = Uuid::new_v4();
        {
            let mut active = self.active.write().await;
            active.insert(
                id,
                ActiveOperation {
                    id,
                    name: name.to_string(),
                    started_at: Utc::now(),
                },
            );
        }
        debug!(operation = name, operation_id = %id, "operation started");

        let result = tokio::time::timeout(timeout, operation).await;

        self.active.write().await.remove(&id);

        match result {
            Ok(Ok(value)) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(operation = name, operation_id = %id, "operation completed");
                Ok(value)
            }
            Ok(Err(err)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                debug!(operation = name, operation_id = %id, "operation failed");
                Err(TrackedError::Failed(err))
            }
            Err(_elapsed) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation = name,
                    operation_id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "operation timed out"
                );
                Err(TrackedError::TimedOut {
                    name: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Snapshot of operations currently in flight.
    pub async fn active_operations(&self) -> Vec<ActiveOperation> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn get_stats(&self) -> OperationStats {
        OperationStats {
            active: self.active.read().await.len(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
