//! Durable domain failure tracking
//!
//! A bounded map of repeatedly-failing domains, persisted as a single JSON
//! blob so blocklisting survives restarts. Failure counts only move up;
//! the sole way out is `remove_failure`, called on a successful fetch.
//! A blob that fails to load yields an empty tracker rather than an error,
//! so a corrupt blocklist degrades to extra fetch attempts instead of an
//! unusable service.

use crate::config::FailureConfig;
use crate::errors::StorageResult;
use crate::models::DomainFailureRecord;
use crate::storage::BlobStore;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct FailureTrackerStats {
    pub tracked: usize,
    pub permanently_blocked: usize,
}

/// Durable, bounded blocklist of failing domains
pub struct FailureTracker {
    store: Arc<dyn BlobStore>,
    blob_key: String,
    blocklist_threshold: u32,
    cooldown: std::time::Duration,
    max_items: usize,
    records: RwLock<HashMap<String, DomainFailureRecord>>,
}

impl FailureTracker {
    /// Load the tracker from storage. Missing or unreadable blobs start
    /// an empty tracker.
    pub async fn load(store: Arc<dyn BlobStore>, config: &FailureConfig) -> Self {
        let records = match store.read(&config.blocklist_key).await {
            Ok(data) => match serde_json::from_slice::<Vec<DomainFailureRecord>>(&data) {
                Ok(list) => {
                    info!(records = list.len(), "loaded domain failure records");
                    list.into_iter().map(|r| (r.key.clone(), r)).collect()
                }
                Err(e) => {
                    warn!(error = %e, "failure blob unparseable, starting empty");
                    HashMap::new()
                }
            },
            Err(e) => {
                debug!(error = %e, "no failure blob found, starting empty");
                HashMap::new()
            }
        };
        Self {
            store,
            blob_key: config.blocklist_key.clone(),
            blocklist_threshold: config.blocklist_threshold,
            cooldown: config.cooldown,
            max_items: config.blocklist_max_items,
            records: RwLock::new(records),
        }
    }

    /// Fast-path check: should this domain be skipped without any network?
    /// True while permanently blocked, or while a recent failure is still
    /// inside the cooldown window.
    pub async fn should_skip(&self, domain: &str) -> bool {
        let records = self.records.read().await;
        let Some(record) = records.get(domain) else {
            return false;
        };
        if record.permanently_blocked {
            return true;
        }
        let cooldown = chrono::Duration::from_std(self.cooldown).unwrap_or_default();
        record.failure_count > 0
            && Utc::now().signed_duration_since(record.last_failure_at) < cooldown
    }

    /// Record one exhausted pipeline run for `domain`. Returns `true` when
    /// this failure crossed the threshold and the domain is now blocked.
    pub async fn record_failure(&self, domain: &str) -> bool {
        let now = Utc::now();
        let newly_blocked = {
            let mut records = self.records.write().await;
            let record = records
                .entry(domain.to_string())
                .or_insert_with(|| DomainFailureRecord {
                    key: domain.to_string(),
                    failure_count: 0,
                    first_failure_at: now,
                    last_failure_at: now,
                    permanently_blocked: false,
                });
            record.failure_count += 1;
            record.last_failure_at = now;
            let newly_blocked =
                !record.permanently_blocked && record.failure_count >= self.blocklist_threshold;
            if newly_blocked {
                record.permanently_blocked = true;
                warn!(
                    domain = domain,
                    failures = record.failure_count,
                    "domain permanently blocklisted"
                );
            }
            Self::evict_overflow(&mut records, self.max_items);
            newly_blocked
        };

        if let Err(e) = self.save().await {
            warn!(error = %e, "failed to persist failure records");
        }
        newly_blocked
    }

    /// A success wipes the domain's record entirely, blocked or not.
    pub async fn remove_failure(&self, domain: &str) {
        let removed = self.records.write().await.remove(domain).is_some();
        if removed {
            debug!(domain = domain, "failure record cleared after success");
            if let Err(e) = self.save().await {
                warn!(error = %e, "failed to persist failure records");
            }
        }
    }

    /// Oldest-first eviction by first failure time, keeping the map at
    /// `max_items`.
    fn evict_overflow(records: &mut HashMap<String, DomainFailureRecord>, max_items: usize) {
        while records.len() > max_items {
            let oldest = records
                .values()
                .min_by_key(|r| r.first_failure_at)
                .map(|r| r.key.clone());
            match oldest {
                Some(key) => {
                    debug!(domain = %key, "evicting oldest failure record");
                    records.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Persist the records as a sorted JSON list (stable blob contents).
    pub async fn save(&self) -> StorageResult<()> {
        let mut list: Vec<DomainFailureRecord> =
            self.records.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        let data = serde_json::to_vec_pretty(&list)?;
        self.store.write(&self.blob_key, Bytes::from(data)).await
    }

    pub async fn get_stats(&self) -> FailureTrackerStats {
        let records = self.records.read().await;
        FailureTrackerStats {
            tracked: records.len(),
            permanently_blocked: records.values().filter(|r| r.permanently_blocked).count(),
        }
    }
}
