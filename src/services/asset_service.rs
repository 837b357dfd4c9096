//! Unified image/logo acquisition service
//!
//! The orchestrator behind the public API. A logo request flows through:
//! durable blocklist -> in-process result cache -> durable storage lookup
//! (with legacy key migration) -> candidate walk over favicon variants and
//! third-party logo services, rate-limited and circuit-broken per origin.
//! Concurrent requests for the same domain coalesce onto one shared
//! pipeline future. Storage writes that fail under memory pressure land in
//! a bounded retry queue drained in the background.
//!
//! Storage keys are content-addressed by origin:
//! `logos/{domain_slug}_{source}_{hash8}[_inverted].{ext}`, where `hash8`
//! is the first 8 hex chars of the SHA-256 of the origin URL. Keys without
//! the hash segment predate this scheme and are migrated on first touch.

use crate::config::Config;
use crate::errors::{AppError, AppResult, FetchError, StorageError};
use crate::models::{
    AssetSource, ImageFetchResult, LogoFetchResult, LogoOptions, UploadRetryEntry,
};
use crate::scheduler::{PRIORITY_LOW, RequestScheduler};
use crate::services::failure_tracker::FailureTracker;
use crate::services::fetcher::AssetFetcher;
use crate::storage::streaming::StreamingStorage;
use crate::utils::jitter::backoff_delay;
use crate::utils::memory_monitor::MemoryMonitor;
use crate::utils::operation_tracker::{OperationTracker, TrackedError};
use crate::utils::rate_limiter::{RateLimiter, WindowedCircuitBreaker};
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Extensions recognized in storage keys, in lookup preference order
const KNOWN_EXTENSIONS: [&str; 6] = ["png", "svg", "webp", "jpg", "gif", "ico"];

/// Retry-queue entries older than this are dropped by the cleanup tick
const RETRY_ENTRY_MAX_AGE_HOURS: i64 = 24;

/// In-flight pipeline entries older than this are abandoned; the longest
/// legitimate walk finishes well inside it.
const IN_FLIGHT_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct Candidate {
    url: String,
    source: AssetSource,
}

struct CachedResult {
    result: LogoFetchResult,
    stored_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetServiceStats {
    pub result_cache_entries: usize,
    pub in_flight: usize,
    pub retry_queue: usize,
    pub session_failures: usize,
}

type SharedPipeline = Shared<BoxFuture<'static, LogoFetchResult>>;

struct InFlightPipeline {
    pipeline: SharedPipeline,
    started_at: Instant,
}

/// Orchestrating service for logo and image acquisition
#[derive(Clone)]
pub struct AssetService {
    config: Arc<Config>,
    fetcher: Arc<dyn AssetFetcher>,
    storage: StreamingStorage,
    monitor: MemoryMonitor,
    limiter: RateLimiter,
    breaker: WindowedCircuitBreaker,
    failures: Arc<FailureTracker>,
    scheduler: RequestScheduler,
    operations: Arc<OperationTracker>,
    result_cache: Arc<Mutex<LruCache<String, CachedResult>>>,
    in_flight: Arc<Mutex<HashMap<String, InFlightPipeline>>>,
    session_failures: Arc<Mutex<HashMap<String, (u32, Instant)>>>,
    retry_queue: Arc<Mutex<VecDeque<UploadRetryEntry>>>,
    migrating: Arc<Mutex<HashSet<String>>>,
}

impl AssetService {
    pub fn new(
        config: Arc<Config>,
        fetcher: Arc<dyn AssetFetcher>,
        storage: StreamingStorage,
        monitor: MemoryMonitor,
        scheduler: RequestScheduler,
        failures: Arc<FailureTracker>,
    ) -> AppResult<Self> {
        let limiter = RateLimiter::new(
            "origin",
            config.rate_limit.max_requests,
            config.rate_limit.window,
        )?;
        let breaker = WindowedCircuitBreaker::new(
            "origin",
            config.rate_limit.failure_threshold,
            config.rate_limit.reset_timeout,
        )?;
        let capacity = NonZeroUsize::new(config.cache.result_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            config,
            fetcher,
            storage,
            monitor,
            limiter,
            breaker,
            failures,
            scheduler,
            operations: Arc::new(OperationTracker::new()),
            result_cache: Arc::new(Mutex::new(LruCache::new(capacity))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            session_failures: Arc::new(Mutex::new(HashMap::new())),
            retry_queue: Arc::new(Mutex::new(VecDeque::new())),
            migrating: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn operations(&self) -> &Arc<OperationTracker> {
        &self.operations
    }

    // ---- public API -------------------------------------------------------

    /// Fetch (or serve from cache) the logo for `domain`.
    ///
    /// Concurrent calls for the same domain share one pipeline run,
    /// whatever their options; the dark-mode variant is derived from the
    /// shared base result afterwards. Results are cached in-process per
    /// (domain, options) with a TTL, negative outcomes included.
    pub async fn get_logo(&self, domain: &str, options: LogoOptions) -> LogoFetchResult {
        let Some(domain) = normalize_domain(domain) else {
            return LogoFetchResult::not_found(domain, "invalid domain");
        };

        // Blocklisted (or cooling-down) domains fail fast: zero network.
        if self.failures.should_skip(&domain).await {
            debug!(domain = %domain, "domain blocklisted, failing fast");
            return LogoFetchResult::not_found(domain, "domain blocklisted");
        }

        let cache_key = result_cache_key(&domain, options.invert_for_dark_mode);
        if let Some(hit) = self.cached_result(&cache_key).await {
            return hit;
        }

        let pipeline = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&domain) {
                Some(existing) => existing.pipeline.clone(),
                None => {
                    let service = self.clone();
                    let key = domain.clone();
                    let fut: SharedPipeline = async move {
                        let result = service.run_logo_pipeline(&key).await;
                        service.in_flight.lock().await.remove(&key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(
                        domain.clone(),
                        InFlightPipeline {
                            pipeline: fut.clone(),
                            started_at: Instant::now(),
                        },
                    );
                    fut
                }
            }
        };
        let base = pipeline.await;

        if !options.invert_for_dark_mode || !base.is_valid {
            return base;
        }
        let result = self.inverted_view(&domain, base).await;
        self.cache_result(&cache_key, &result).await;
        result
    }

    /// Fetch (or serve from storage) an arbitrary page image by URL.
    pub async fn get_image(&self, url: &str) -> AppResult<ImageFetchResult> {
        if !self.monitor.should_accept_new_requests().await {
            return Err(AppError::Fetch(FetchError::MemoryPressure));
        }
        let parsed = Url::parse(url)
            .map_err(|e| AppError::validation(format!("invalid image url: {e}")))?;

        let key = image_key(&parsed);
        if self.storage.store().exists(&key).await? {
            debug!(key = %key, "image already stored");
            return Ok(ImageFetchResult {
                url: url.to_string(),
                cdn_url: self.cdn_url(&key),
                storage_key: key,
                content_type: None,
                size_bytes: None,
                from_cache: true,
                timestamp: Utc::now(),
            });
        }

        let timeout = self.config.fetch.candidate_timeout;
        let response = self
            .operations
            .track("image-fetch", timeout * 2, self.fetcher.fetch(url, timeout))
            .await
            .map_err(|e| match e {
                TrackedError::TimedOut { .. } => AppError::Fetch(FetchError::Timeout {
                    url: url.to_string(),
                    seconds: timeout.as_secs(),
                }),
                TrackedError::Failed(e) => AppError::Fetch(e),
            })?;

        let content_type = response.content_type.clone();
        let size = if self.storage.should_stream(response.content_length) {
            match self.storage.store_streamed(&key, response.stream).await {
                Ok(written) => written,
                Err(e @ StorageError::SizeCapExceeded { .. }) => return Err(e.into()),
                Err(e) => {
                    // Any other streaming failure falls back to a buffered
                    // re-fetch; the partial object is already cleaned up.
                    warn!(key = %key, error = %e, "streamed write failed, falling back to buffered");
                    let response = self
                        .fetcher
                        .fetch(url, timeout)
                        .await
                        .map_err(AppError::Fetch)?;
                    let bytes = response
                        .into_bytes(self.config.storage.max_asset_bytes)
                        .await
                        .map_err(AppError::Fetch)?;
                    self.write_or_queue(&key, bytes, url, content_type.as_deref())
                        .await?
                }
            }
        } else {
            let bytes = response
                .into_bytes(self.config.storage.max_asset_bytes)
                .await
                .map_err(AppError::Fetch)?;
            self.write_or_queue(&key, bytes, url, content_type.as_deref())
                .await?
        };

        Ok(ImageFetchResult {
            url: url.to_string(),
            cdn_url: self.cdn_url(&key),
            storage_key: key,
            content_type,
            size_bytes: Some(size),
            from_cache: false,
            timestamp: Utc::now(),
        })
    }

    /// Resolve the public URL for a storage key: CDN base, then storage
    /// endpoint + bucket, then a relative path.
    pub fn cdn_url(&self, key: &str) -> String {
        let storage = &self.config.storage;
        if let Some(base) = &storage.cdn_base_url {
            return format!("{}/{key}", base.trim_end_matches('/'));
        }
        if let (Some(endpoint), Some(bucket)) = (&storage.endpoint_url, &storage.bucket) {
            return format!("{}/{bucket}/{key}", endpoint.trim_end_matches('/'));
        }
        format!("/{key}")
    }

    // ---- logo pipeline ----------------------------------------------------

    /// Resolve the base (non-inverted) logo for a domain. Runs at most once
    /// concurrently per domain via the in-flight map.
    async fn run_logo_pipeline(&self, domain: &str) -> LogoFetchResult {
        let cache_key = result_cache_key(domain, false);

        // Durable storage beats the network.
        if let Some(result) = self.lookup_stored_logo(domain).await {
            self.cache_result(&cache_key, &result).await;
            return result;
        }

        // Session-level short circuit: repeatedly exhausted domains are not
        // retried within this process lifetime.
        if self.session_attempts_exhausted(domain).await {
            let result = LogoFetchResult::not_found(domain, "session attempts exhausted");
            self.cache_result(&cache_key, &result).await;
            return result;
        }

        if !self.monitor.should_accept_new_requests().await {
            // Pressure rejections are transient; deliberately not cached.
            return LogoFetchResult::not_found(domain, "rejected under memory pressure");
        }

        let result = self.walk_candidates(domain).await;
        match &result {
            Some(result) => {
                self.failures.remove_failure(domain).await;
                self.session_failures.lock().await.remove(domain);
                self.cache_result(&cache_key, result).await;
                result.clone()
            }
            None => {
                self.record_exhaustion(domain).await;
                let result = LogoFetchResult::not_found(domain, "all candidates exhausted");
                self.cache_result(&cache_key, &result).await;
                result
            }
        }
    }

    /// Walk candidates in fidelity order; first validated asset wins.
    async fn walk_candidates(&self, domain: &str) -> Option<LogoFetchResult> {
        let timeout = self.config.fetch.candidate_timeout;

        for candidate in candidate_urls(domain) {
            let host = Url::parse(&candidate.url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| domain.to_string());

            if self.breaker.is_open(&host).await {
                debug!(url = %candidate.url, host = %host, "skipping candidate, circuit open");
                continue;
            }
            if !self.limiter.is_operation_allowed(&host).await {
                debug!(url = %candidate.url, host = %host, "skipping candidate, rate limited");
                continue;
            }

            let fetched = self
                .operations
                .track(
                    "logo-fetch",
                    timeout * 2,
                    self.fetcher.fetch(&candidate.url, timeout),
                )
                .await;
            let response = match fetched {
                Ok(response) => response,
                Err(TrackedError::TimedOut { .. }) => {
                    self.breaker.record_failure(&host).await;
                    continue;
                }
                Err(TrackedError::Failed(e)) => {
                    // Origin-level trouble trips the breaker; an HTTP error
                    // status is a functioning origin saying no.
                    if matches!(e, FetchError::Transient { .. } | FetchError::Timeout { .. }) {
                        self.breaker.record_failure(&host).await;
                    }
                    debug!(url = %candidate.url, error = %e, "candidate fetch failed");
                    continue;
                }
            };

            let bytes = match response
                .into_bytes(self.config.storage.max_asset_bytes)
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(url = %candidate.url, error = %e, "candidate body unreadable");
                    continue;
                }
            };

            let validated = match validate_logo(&bytes, candidate.source, &self.config) {
                Ok(validated) => validated,
                Err(reason) => {
                    debug!(url = %candidate.url, reason = %reason, "candidate rejected");
                    continue;
                }
            };

            self.breaker.record_success(&host).await;
            info!(
                domain = %domain,
                source = %candidate.source,
                url = %candidate.url,
                content_type = %validated.content_type,
                bytes = bytes.len(),
                "logo acquired"
            );
            return Some(self.persist_logo(domain, &candidate, bytes, validated).await);
        }
        None
    }

    /// Write the base logo object and build the result. Inverted variants
    /// are derived on demand from the stored base.
    async fn persist_logo(
        &self,
        domain: &str,
        candidate: &Candidate,
        bytes: Bytes,
        validated: ValidatedLogo,
    ) -> LogoFetchResult {
        let slug = domain_slug(domain);
        let hash8 = origin_hash8(&candidate.url);
        let base_key = logo_key(&slug, candidate.source, &hash8, false, &validated.extension);

        let mut storage_key = Some(base_key.clone());
        match self.storage.store_buffered(&base_key, bytes).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                self.enqueue_retry(&base_key, &candidate.url, &validated.content_type)
                    .await;
            }
            Err(e) => {
                warn!(key = %base_key, error = %e, "logo write failed, dropping");
                storage_key = None;
            }
        }

        LogoFetchResult {
            domain: domain.to_string(),
            source: Some(candidate.source),
            content_type: Some(validated.content_type),
            cdn_url: storage_key.as_deref().map(|k| self.cdn_url(k)),
            storage_key,
            url: Some(candidate.url.clone()),
            timestamp: Utc::now(),
            is_valid: true,
            error: None,
        }
    }

    // ---- storage lookup & legacy migration --------------------------------

    /// Look for an already-stored base logo across sources and extensions,
    /// and kick off migration when only a legacy (non-hashed) key exists.
    async fn lookup_stored_logo(&self, domain: &str) -> Option<LogoFetchResult> {
        let slug = domain_slug(domain);
        let keys = match self
            .storage
            .store()
            .list_prefix(&format!("logos/{slug}_"))
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!(domain = %domain, error = %e, "storage lookup failed");
                return None;
            }
        };
        if keys.is_empty() {
            return None;
        }

        for source in AssetSource::all() {
            let parsed: Vec<ParsedKey> = keys
                .iter()
                .filter_map(|k| parse_logo_key(k, &slug, source))
                .collect();
            if parsed.is_empty() {
                continue;
            }

            // Prefer current-scheme base keys, then legacy.
            let base = parsed.iter().find(|p| p.hash8.is_some() && !p.inverted);
            let legacy = parsed.iter().find(|p| p.hash8.is_none() && !p.inverted);

            if let Some(hit) = base {
                return Some(self.stored_result(domain, source, &hit.key));
            }

            if let Some(legacy) = legacy {
                self.spawn_legacy_migration(domain, source, legacy).await;
                return Some(self.stored_result(domain, source, &legacy.key));
            }
        }
        None
    }

    fn stored_result(&self, domain: &str, source: AssetSource, key: &str) -> LogoFetchResult {
        LogoFetchResult {
            domain: domain.to_string(),
            source: Some(source),
            content_type: content_type_for_extension(extension_of(key)),
            storage_key: Some(key.to_string()),
            cdn_url: Some(self.cdn_url(key)),
            url: None,
            timestamp: Utc::now(),
            is_valid: true,
            error: None,
        }
    }

    /// Dark-mode view of a base result: point it at the `_inverted` object,
    /// deriving and persisting that object first if it does not exist yet.
    /// Legacy keys and underivable formats fall back to the base object.
    async fn inverted_view(&self, domain: &str, base: LogoFetchResult) -> LogoFetchResult {
        let Some(source) = base.source else {
            return base;
        };
        let Some(key) = base.storage_key.clone() else {
            return base;
        };
        let slug = domain_slug(domain);
        let Some(parsed) = parse_logo_key(&key, &slug, source) else {
            return base;
        };
        if parsed.inverted {
            return base;
        }
        match self.ensure_inverted_variant(&key, &slug, source, &parsed).await {
            Some(inverted_key) => LogoFetchResult {
                cdn_url: Some(self.cdn_url(&inverted_key)),
                storage_key: Some(inverted_key),
                ..base
            },
            None => base,
        }
    }

    /// Derive and persist the inverted variant from a stored base object.
    async fn ensure_inverted_variant(
        &self,
        base_key: &str,
        slug: &str,
        source: AssetSource,
        parsed: &ParsedKey,
    ) -> Option<String> {
        let hash8 = parsed.hash8.as_deref()?;
        let inverted_key = logo_key(slug, source, hash8, true, &parsed.extension);
        match self.storage.store().exists(&inverted_key).await {
            Ok(true) => return Some(inverted_key),
            Ok(false) => {}
            Err(_) => return None,
        }
        let bytes = self.storage.store().read(base_key).await.ok()?;
        let inverted = invert_image(&bytes)?;
        match self.storage.store().write(&inverted_key, inverted).await {
            Ok(()) => Some(inverted_key),
            Err(e) => {
                warn!(key = %inverted_key, error = %e, "inverted variant write failed");
                None
            }
        }
    }

    /// Move a legacy key onto the hashed scheme without blocking the
    /// caller. A per-(domain, source) guard keeps concurrent hits from
    /// migrating twice.
    async fn spawn_legacy_migration(&self, domain: &str, source: AssetSource, legacy: &ParsedKey) {
        let guard_key = format!("{domain}|{source}");
        {
            let mut migrating = self.migrating.lock().await;
            if !migrating.insert(guard_key.clone()) {
                return;
            }
        }

        let service = self.clone();
        let domain = domain.to_string();
        let legacy_key = legacy.key.clone();
        let extension = legacy.extension.clone();
        tokio::spawn(async move {
            let slug = domain_slug(&domain);
            // Legacy objects predate origin hashing; hash the canonical
            // origin URL for the source so the target is deterministic.
            let origin = canonical_origin_url(&domain, source, &extension);
            let target = logo_key(&slug, source, &origin_hash8(&origin), false, &extension);
            match service.storage.store().rename(&legacy_key, &target).await {
                Ok(()) => {
                    info!(from = %legacy_key, to = %target, "migrated legacy logo key")
                }
                Err(StorageError::NotFound { .. }) => {} // raced another process
                Err(e) => warn!(from = %legacy_key, error = %e, "legacy migration failed"),
            }
            service.migrating.lock().await.remove(&guard_key);
        });
    }

    // ---- result cache & session failures ----------------------------------

    async fn cached_result(&self, cache_key: &str) -> Option<LogoFetchResult> {
        if self.monitor.caches_disabled() {
            return None;
        }
        let mut cache = self.result_cache.lock().await;
        match cache.get(cache_key) {
            Some(entry) if entry.stored_at.elapsed() < self.config.cache.result_ttl => {
                Some(entry.result.clone())
            }
            Some(_) => {
                cache.pop(cache_key);
                None
            }
            None => None,
        }
    }

    async fn cache_result(&self, cache_key: &str, result: &LogoFetchResult) {
        if self.monitor.caches_disabled() {
            return;
        }
        self.result_cache.lock().await.put(
            cache_key.to_string(),
            CachedResult {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    async fn session_attempts_exhausted(&self, domain: &str) -> bool {
        let session = self.session_failures.lock().await;
        session
            .get(domain)
            .map(|(count, _)| *count >= self.config.failures.session_max_attempts)
            .unwrap_or(false)
    }

    /// One exhausted pipeline run: bump both the session counter and the
    /// durable tracker (the durable one alone drives blocklisting).
    async fn record_exhaustion(&self, domain: &str) {
        {
            let mut session = self.session_failures.lock().await;
            let entry = session
                .entry(domain.to_string())
                .or_insert((0, Instant::now()));
            entry.0 += 1;
            entry.1 = Instant::now();
        }
        self.failures.record_failure(domain).await;
    }

    // ---- upload retry queue ------------------------------------------------

    async fn write_or_queue(
        &self,
        key: &str,
        bytes: Bytes,
        source_url: &str,
        content_type: Option<&str>,
    ) -> AppResult<u64> {
        let len = bytes.len() as u64;
        match self.storage.store_buffered(key, bytes).await {
            Ok(written) => Ok(written),
            Err(e) if e.is_retryable() => {
                self.enqueue_retry(key, source_url, content_type.unwrap_or("application/octet-stream"))
                    .await;
                Ok(len)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a pressure-failed write for later. The queue is bounded; at
    /// capacity the oldest ~20% of entries are evicted first.
    async fn enqueue_retry(&self, key: &str, source_url: &str, content_type: &str) {
        let mut queue = self.retry_queue.lock().await;
        let max = self.config.retry_queue.max_entries;
        if queue.len() >= max {
            let evict = (max / 5).max(1).min(queue.len());
            queue.drain(..evict);
            warn!(evicted = evict, "retry queue full, evicted oldest entries");
        }
        let now = Utc::now();
        let delay = backoff_delay(
            self.config.retry_queue.base_delay,
            0,
            self.config.retry_queue.max_delay,
            self.config.retry_queue.jitter_fraction,
        );
        queue.push_back(UploadRetryEntry {
            storage_key: key.to_string(),
            source_url: source_url.to_string(),
            content_type: content_type.to_string(),
            attempts: 0,
            last_attempt: now,
            next_retry: now + chrono::Duration::from_std(delay).unwrap_or_default(),
        });
        debug!(key = %key, queued = queue.len(), "upload queued for retry");
    }

    /// Re-attempt due retry entries. Runs on a timer; skipped entirely
    /// while the monitor refuses new work.
    pub async fn drain_retry_queue(&self) {
        if !self.monitor.should_accept_new_requests().await {
            debug!("skipping retry drain under memory pressure");
            return;
        }
        let now = Utc::now();
        let due: Vec<UploadRetryEntry> = {
            let mut queue = self.retry_queue.lock().await;
            let mut due = Vec::new();
            let mut rest = VecDeque::new();
            for entry in queue.drain(..) {
                if entry.next_retry <= now {
                    due.push(entry);
                } else {
                    rest.push_back(entry);
                }
            }
            *queue = rest;
            due
        };

        for mut entry in due {
            // The payload was never kept in memory; re-fetch from origin.
            let fetched = self
                .fetcher
                .fetch(&entry.source_url, self.config.fetch.candidate_timeout)
                .await;
            let bytes = match fetched {
                Ok(response) => {
                    match response.into_bytes(self.config.storage.max_asset_bytes).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!(url = %entry.source_url, error = %e, "retry refetch unreadable, dropping");
                            continue;
                        }
                    }
                }
                Err(e) => {
                    debug!(url = %entry.source_url, error = %e, "retry refetch failed, dropping");
                    continue;
                }
            };

            match self.storage.store_buffered(&entry.storage_key, bytes).await {
                Ok(_) => {
                    info!(key = %entry.storage_key, attempts = entry.attempts + 1, "retried upload succeeded");
                }
                Err(e) if e.is_retryable() => {
                    entry.attempts += 1;
                    entry.last_attempt = now;
                    let delay = backoff_delay(
                        self.config.retry_queue.base_delay,
                        entry.attempts,
                        self.config.retry_queue.max_delay,
                        self.config.retry_queue.jitter_fraction,
                    );
                    entry.next_retry = now + chrono::Duration::from_std(delay).unwrap_or_default();
                    self.retry_queue.lock().await.push_back(entry);
                }
                Err(e) => {
                    warn!(key = %entry.storage_key, error = %e, "retried upload failed, dropping");
                }
            }
        }
    }

    // ---- maintenance -------------------------------------------------------

    /// Periodic trim of all in-memory bookkeeping.
    pub async fn cleanup_tick(&self) {
        let expired_windows = self.limiter.cleanup_expired().await;
        let expired_circuits = self.breaker.cleanup_expired().await;

        let ttl = self.config.cache.result_ttl;
        let mut expired_results = 0usize;
        {
            let mut cache = self.result_cache.lock().await;
            let stale: Vec<String> = cache
                .iter()
                .filter(|(_, v)| v.stored_at.elapsed() >= ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                cache.pop(&key);
                expired_results += 1;
            }
        }

        {
            let mut session = self.session_failures.lock().await;
            session.retain(|_, (_, last)| last.elapsed() < ttl);
        }

        {
            let cutoff = Utc::now() - chrono::Duration::hours(RETRY_ENTRY_MAX_AGE_HOURS);
            let mut queue = self.retry_queue.lock().await;
            queue.retain(|entry| entry.last_attempt > cutoff);
        }

        let stale_pipelines = self.prune_in_flight(IN_FLIGHT_MAX_AGE).await;

        debug!(
            expired_windows = expired_windows,
            expired_circuits = expired_circuits,
            expired_results = expired_results,
            stale_pipelines = stale_pipelines,
            "cleanup tick"
        );
    }

    /// Drop in-flight entries older than `max_age`. A pipeline whose every
    /// caller went away never runs its removal epilogue, so the map needs
    /// this backstop.
    async fn prune_in_flight(&self, max_age: Duration) -> usize {
        let mut in_flight = self.in_flight.lock().await;
        let before = in_flight.len();
        in_flight.retain(|_, entry| entry.started_at.elapsed() < max_age);
        before - in_flight.len()
    }

    /// Spawn the retry-drain and cleanup tickers.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut drain = tokio::time::interval(service.config.retry_queue.drain_interval);
            let mut cleanup = tokio::time::interval(service.config.cache.cleanup_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("asset service maintenance stopping");
                        break;
                    }
                    _ = drain.tick() => {
                        // Deferrable background work goes through the
                        // scheduler so memory pressure can hold it back;
                        // interactive requests consult the monitor directly.
                        let drainer = service.clone();
                        let scheduled = service
                            .scheduler
                            .schedule(PRIORITY_LOW, move || {
                                let drainer = drainer.clone();
                                async move {
                                    drainer.drain_retry_queue().await;
                                    Ok(())
                                }
                            })
                            .await;
                        if let Err(e) = scheduled {
                            debug!(error = %e, "retry drain not scheduled");
                        }
                    }
                    _ = cleanup.tick() => service.cleanup_tick().await,
                }
            }
        })
    }

    pub async fn get_stats(&self) -> AssetServiceStats {
        AssetServiceStats {
            result_cache_entries: self.result_cache.lock().await.len(),
            in_flight: self.in_flight.lock().await.len(),
            retry_queue: self.retry_queue.lock().await.len(),
            session_failures: self.session_failures.lock().await.len(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn retry_queue_len(&self) -> usize {
        self.retry_queue.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn push_retry_for_test(&self, entry: UploadRetryEntry) {
        self.enqueue_retry(&entry.storage_key, &entry.source_url, &entry.content_type)
            .await;
    }
}

// ---- key scheme ------------------------------------------------------------

/// Lowercase the domain, strip scheme/path/port, reject anything that is
/// not a plausible hostname.
pub fn normalize_domain(input: &str) -> Option<String> {
    let trimmed = input.trim().to_lowercase();
    let host = if trimmed.contains("://") {
        Url::parse(&trimmed).ok()?.host_str()?.to_string()
    } else {
        trimmed
            .split(['/', ':', '?'])
            .next()
            .unwrap_or_default()
            .to_string()
    };
    let host = host.trim_end_matches('.').to_string();
    if host.is_empty()
        || !host.contains('.')
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return None;
    }
    Some(host)
}

/// `example.com` -> `example_com`
fn domain_slug(domain: &str) -> String {
    domain.replace(['.', '-'], "_")
}

fn result_cache_key(domain: &str, inverted: bool) -> String {
    format!("{domain}|{inverted}")
}

/// First 8 hex chars of SHA-256 of the origin URL. Idempotent: the same
/// origin always writes the same key.
fn origin_hash8(origin_url: &str) -> String {
    let digest = Sha256::digest(origin_url.as_bytes());
    hex::encode(&digest[..4])
}

fn logo_key(slug: &str, source: AssetSource, hash8: &str, inverted: bool, ext: &str) -> String {
    if inverted {
        format!("logos/{slug}_{source}_{hash8}_inverted.{ext}")
    } else {
        format!("logos/{slug}_{source}_{hash8}.{ext}")
    }
}

/// Deterministic storage key for an arbitrary image URL.
fn image_key(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    let ext = url
        .path()
        .rsplit('.')
        .next()
        .filter(|ext| KNOWN_EXTENSIONS.contains(ext))
        .unwrap_or("bin");
    format!("images/{}.{ext}", hex::encode(&digest[..8]))
}

#[derive(Debug)]
struct ParsedKey {
    key: String,
    hash8: Option<String>,
    inverted: bool,
    extension: String,
}

/// Parse a storage key for (slug, source); returns `None` when it belongs
/// to a different source or domain.
fn parse_logo_key(key: &str, slug: &str, source: AssetSource) -> Option<ParsedKey> {
    let name = key.strip_prefix("logos/")?;
    let (stem, extension) = name.rsplit_once('.')?;
    if !KNOWN_EXTENSIONS.contains(&extension) {
        return None;
    }
    let rest = stem.strip_prefix(&format!("{slug}_{source}"))?;

    let (hash8, inverted) = match rest {
        "" => (None, false),
        rest => {
            let rest = rest.strip_prefix('_')?;
            let (hash, inverted) = match rest.strip_suffix("_inverted") {
                Some(hash) => (hash, true),
                None => (rest, false),
            };
            if hash.len() != 8 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            (Some(hash.to_string()), inverted)
        }
    };
    Some(ParsedKey {
        key: key.to_string(),
        hash8,
        inverted,
        extension: extension.to_string(),
    })
}

fn extension_of(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or("")
}

fn content_type_for_extension(ext: &str) -> Option<String> {
    let mime = match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Canonical origin URL used when hashing keys for legacy objects.
fn canonical_origin_url(domain: &str, source: AssetSource, ext: &str) -> String {
    match source {
        AssetSource::Direct => format!("https://{domain}/favicon.{ext}"),
        AssetSource::Google => {
            format!("https://www.google.com/s2/favicons?domain={domain}&sz=128")
        }
        AssetSource::Duckduckgo => format!("https://icons.duckduckgo.com/ip3/{domain}.ico"),
        AssetSource::Clearbit => format!("https://logo.clearbit.com/{domain}"),
    }
}

/// Candidate URLs in decreasing fidelity: self-hosted favicon variants
/// across domain variants (bare + www.), then third-party services.
fn candidate_urls(domain: &str) -> Vec<Candidate> {
    let mut variants = vec![domain.to_string()];
    if !domain.starts_with("www.") {
        variants.push(format!("www.{domain}"));
    }

    let mut candidates = Vec::new();
    for path in [
        "favicon-512.png",
        "favicon-192.png",
        "apple-touch-icon.png",
        "favicon.svg",
        "favicon.png",
        "favicon.ico",
    ] {
        for variant in &variants {
            candidates.push(Candidate {
                url: format!("https://{variant}/{path}"),
                source: AssetSource::Direct,
            });
        }
    }
    candidates.push(Candidate {
        url: format!("https://www.google.com/s2/favicons?domain={domain}&sz=128"),
        source: AssetSource::Google,
    });
    candidates.push(Candidate {
        url: format!("https://icons.duckduckgo.com/ip3/{domain}.ico"),
        source: AssetSource::Duckduckgo,
    });
    candidates.push(Candidate {
        url: format!("https://logo.clearbit.com/{domain}"),
        source: AssetSource::Clearbit,
    });
    candidates
}

// ---- validation & transforms -----------------------------------------------

struct ValidatedLogo {
    content_type: String,
    extension: String,
}

/// Validate a candidate body: size floor, recognizable format, roughly
/// square for raster formats, and not a flat placeholder tile from a
/// third-party icon service.
fn validate_logo(bytes: &Bytes, source: AssetSource, config: &Config) -> Result<ValidatedLogo, String> {
    if (bytes.len() as u64) < config.fetch.min_asset_bytes {
        return Err(format!("{} bytes is below the minimum", bytes.len()));
    }

    // Magic numbers first; Content-Type headers lie.
    if let Some(kind) = infer::get(bytes) {
        let extension = kind.extension();
        if !KNOWN_EXTENSIONS.contains(&extension) {
            return Err(format!("unsupported format {}", kind.mime_type()));
        }
        if matches!(extension, "png" | "jpg" | "gif" | "webp") {
            let img = image::load_from_memory(bytes)
                .map_err(|e| format!("undecodable image: {e}"))?;
            let (w, h) = (img.width() as f64, img.height() as f64);
            if h == 0.0 || (w / h - 1.0).abs() > config.fetch.aspect_ratio_tolerance {
                return Err(format!("aspect ratio {w}x{h} outside tolerance"));
            }
            if source != AssetSource::Direct && is_flat_placeholder(&img) {
                return Err("flat placeholder tile".to_string());
            }
        }
        return Ok(ValidatedLogo {
            content_type: kind.mime_type().to_string(),
            extension: extension.to_string(),
        });
    }

    // `infer` has no SVG matcher; detect by document shape.
    let head = &bytes[..bytes.len().min(512)];
    let text = String::from_utf8_lossy(head);
    if text.trim_start().starts_with("<svg") || text.contains("<svg") {
        return Ok(ValidatedLogo {
            content_type: "image/svg+xml".to_string(),
            extension: "svg".to_string(),
        });
    }
    Err("unrecognized content".to_string())
}

/// Third-party icon services answer unknown domains with a flat tile (or a
/// single-letter placeholder). A sparse pixel sample with almost no color
/// variety is a strong signal.
fn is_flat_placeholder(img: &image::DynamicImage) -> bool {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return true;
    }
    let mut colors: HashSet<[u8; 4]> = HashSet::new();
    let step_x = (width / 8).max(1);
    let step_y = (height / 8).max(1);
    for y in (0..height).step_by(step_y as usize) {
        for x in (0..width).step_by(step_x as usize) {
            let pixel = rgba.get_pixel(x, y).0;
            // Quantize so JPEG noise does not inflate the count.
            colors.insert([pixel[0] & 0xF0, pixel[1] & 0xF0, pixel[2] & 0xF0, pixel[3] & 0xF0]);
        }
    }
    colors.len() < 3
}

/// Invert RGB channels, preserving alpha; re-encoded as PNG. Returns `None`
/// for formats the image crate cannot decode (svg, ico).
fn invert_image(bytes: &Bytes) -> Option<Bytes> {
    let img = image::load_from_memory(bytes).ok()?;
    let mut rgba = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        pixel.0[0] = 255 - pixel.0[0];
        pixel.0[1] = 255 - pixel.0[1];
        pixel.0[2] = 255 - pixel.0[2];
    }
    let mut out = Vec::new();
    rgba.write_to(
        &mut std::io::Cursor::new(&mut out),
        image::ImageFormat::Png,
    )
    .ok()?;
    Some(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, FailureConfig, RetryQueueConfig};
    use crate::errors::StorageResult;
    use crate::services::fetcher::mock::MockFetcher;
    use crate::storage::{BlobStore, ByteStream, MemoryBlobStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Encode a PNG. `colorful` draws a gradient; otherwise a flat tile.
    fn png(width: u32, height: u32, colorful: bool) -> Bytes {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            if colorful {
                image::Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
            } else {
                image::Rgba([40, 90, 200, 255])
            }
        });
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        Bytes::from(out)
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.fetch.min_asset_bytes = 64;
        config.rate_limit.max_requests = 1000;
        config.rate_limit.failure_threshold = 2;
        config.failures = FailureConfig {
            session_max_attempts: 2,
            cooldown: Duration::ZERO,
            blocklist_threshold: 2,
            blocklist_max_items: 100,
            blocklist_key: "meta/domain-failures.json".to_string(),
        };
        config.retry_queue = RetryQueueConfig {
            max_entries: 10,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter_fraction: 0.0,
            drain_interval: Duration::from_secs(3600),
        };
        config.cache = CacheConfig {
            result_ttl: Duration::from_secs(3600),
            result_capacity: 64,
            cleanup_interval: Duration::from_secs(3600),
        };
        config
    }

    struct Fixture {
        service: AssetService,
        fetcher: Arc<MockFetcher>,
        store: Arc<MemoryBlobStore>,
    }

    async fn fixture(config: Config, fetcher: MockFetcher) -> Fixture {
        let store = Arc::new(MemoryBlobStore::new());
        let dyn_store: Arc<dyn BlobStore> = store.clone();
        let config = Arc::new(config);
        let fetcher = Arc::new(fetcher);
        let monitor = MemoryMonitor::new(&config.memory);
        let storage = StreamingStorage::new(
            dyn_store.clone(),
            config.storage.streaming_threshold_bytes,
            config.storage.max_asset_bytes,
        );
        let failures = Arc::new(FailureTracker::load(dyn_store, &config.failures).await);
        let scheduler = RequestScheduler::new(config.scheduler.clone(), monitor.clone());
        let service = AssetService::new(
            config,
            fetcher.clone(),
            storage,
            monitor,
            scheduler,
            failures,
        )
        .unwrap();
        Fixture {
            service,
            fetcher,
            store,
        }
    }

    #[tokio::test]
    async fn placeholder_heuristic_flags_flat_tiles() {
        let flat = image::load_from_memory(&png(64, 64, false)).unwrap();
        assert!(is_flat_placeholder(&flat));
        let colorful = image::load_from_memory(&png(64, 64, true)).unwrap();
        assert!(!is_flat_placeholder(&colorful));
    }

    #[test]
    fn domain_normalization() {
        assert_eq!(
            normalize_domain("Example.COM").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            normalize_domain("https://example.com/path?q=1").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            normalize_domain("example.com:8080/x").as_deref(),
            Some("example.com")
        );
        assert!(normalize_domain("").is_none());
        assert!(normalize_domain("nodots").is_none());
        assert!(normalize_domain("bad domain.com").is_none());
    }

    #[test]
    fn key_scheme_round_trips() {
        let key = logo_key("example_com", AssetSource::Direct, "1a2b3c4d", false, "png");
        assert_eq!(key, "logos/example_com_direct_1a2b3c4d.png");
        let parsed = parse_logo_key(&key, "example_com", AssetSource::Direct).unwrap();
        assert_eq!(parsed.hash8.as_deref(), Some("1a2b3c4d"));
        assert!(!parsed.inverted);
        assert_eq!(parsed.extension, "png");

        let inverted = logo_key("example_com", AssetSource::Direct, "1a2b3c4d", true, "png");
        let parsed = parse_logo_key(&inverted, "example_com", AssetSource::Direct).unwrap();
        assert!(parsed.inverted);

        // Legacy key: no hash segment.
        let parsed =
            parse_logo_key("logos/example_com_direct.png", "example_com", AssetSource::Direct)
                .unwrap();
        assert!(parsed.hash8.is_none());

        // Wrong source does not match.
        assert!(parse_logo_key(&key, "example_com", AssetSource::Google).is_none());
    }

    #[test]
    fn origin_hash_is_deterministic() {
        let a = origin_hash8("https://example.com/favicon-512.png");
        let b = origin_hash8("https://example.com/favicon-512.png");
        let c = origin_hash8("https://example.com/favicon-192.png");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn direct_512_favicon_wins_first() {
        let fetcher = MockFetcher::new();
        fetcher
            .respond_with(
                "https://site.example/favicon-512.png",
                "image/png",
                png(512, 512, true),
            )
            .await;
        let f = fixture(test_config(), fetcher).await;

        let result = f.service.get_logo("site.example", LogoOptions::default()).await;
        assert!(result.is_valid);
        assert_eq!(result.source, Some(AssetSource::Direct));
        assert_eq!(result.content_type.as_deref(), Some("image/png"));

        let key = result.storage_key.unwrap();
        assert!(key.starts_with("logos/site_example_direct_"));
        assert!(key.ends_with(".png"));
        assert!(f.store.exists(&key).await.unwrap());
        assert_eq!(result.cdn_url.unwrap(), format!("/{key}"));

        // The first candidate satisfied the walk; nothing else was fetched.
        assert_eq!(f.fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_into_one_pipeline() {
        let fetcher = MockFetcher::new().with_delay(Duration::from_millis(50));
        fetcher
            .respond_with(
                "https://site.example/favicon-512.png",
                "image/png",
                png(512, 512, true),
            )
            .await;
        let f = fixture(test_config(), fetcher).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let service = f.service.clone();
            handles.push(tokio::spawn(async move {
                service.get_logo("site.example", LogoOptions::default()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_valid);
        }

        assert_eq!(f.fetcher.call_count(), 1);
        assert_eq!(f.service.get_stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn negative_results_are_cached() {
        let f = fixture(test_config(), MockFetcher::new()).await;

        let result = f.service.get_logo("nope.example", LogoOptions::default()).await;
        assert!(!result.is_valid);
        let calls_after_first = f.fetcher.call_count();
        assert!(calls_after_first > 0);

        let result = f.service.get_logo("nope.example", LogoOptions::default()).await;
        assert!(!result.is_valid);
        assert_eq!(f.fetcher.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn blocklisted_domain_never_touches_network() {
        let f = fixture(test_config(), MockFetcher::new()).await;
        f.service.failures.record_failure("banned.example").await;
        f.service.failures.record_failure("banned.example").await;
        assert!(f.service.failures.should_skip("banned.example").await);

        let result = f.service.get_logo("banned.example", LogoOptions::default()).await;
        assert!(!result.is_valid);
        assert_eq!(result.error.as_deref(), Some("domain blocklisted"));
        assert_eq!(f.fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn repeated_exhaustion_blocklists_durably() {
        let mut config = test_config();
        // No result caching so every call runs the pipeline.
        config.cache.result_ttl = Duration::ZERO;
        let f = fixture(config, MockFetcher::new()).await;

        f.service.get_logo("dead.example", LogoOptions::default()).await;
        let calls_after_first = f.fetcher.call_count();
        f.service.get_logo("dead.example", LogoOptions::default()).await;
        assert!(f.fetcher.call_count() > calls_after_first);

        // Two exhausted runs crossed blocklist_threshold = 2.
        assert!(f.service.failures.should_skip("dead.example").await);
        let calls_after_second = f.fetcher.call_count();
        let result = f.service.get_logo("dead.example", LogoOptions::default()).await;
        assert!(!result.is_valid);
        assert_eq!(f.fetcher.call_count(), calls_after_second);
    }

    #[tokio::test]
    async fn stored_logo_short_circuits_network() {
        let f = fixture(test_config(), MockFetcher::new()).await;
        f.store
            .write("logos/site_example_direct_1a2b3c4d.png", png(64, 64, true))
            .await
            .unwrap();

        let result = f.service.get_logo("site.example", LogoOptions::default()).await;
        assert!(result.is_valid);
        assert_eq!(
            result.storage_key.as_deref(),
            Some("logos/site_example_direct_1a2b3c4d.png")
        );
        assert_eq!(f.fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn legacy_key_is_served_and_migrated() {
        let f = fixture(test_config(), MockFetcher::new()).await;
        f.store
            .write("logos/site_example_direct.png", png(64, 64, true))
            .await
            .unwrap();

        let result = f.service.get_logo("site.example", LogoOptions::default()).await;
        // Served immediately from the legacy object.
        assert!(result.is_valid);
        assert_eq!(f.fetcher.call_count(), 0);

        // Migration runs in the background.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!f.store.exists("logos/site_example_direct.png").await.unwrap());
        let expected = logo_key(
            "site_example",
            AssetSource::Direct,
            &origin_hash8(&canonical_origin_url("site.example", AssetSource::Direct, "png")),
            false,
            "png",
        );
        assert!(f.store.exists(&expected).await.unwrap());
    }

    #[tokio::test]
    async fn dark_mode_variant_is_persisted_separately() {
        let fetcher = MockFetcher::new();
        fetcher
            .respond_with(
                "https://site.example/favicon-512.png",
                "image/png",
                png(512, 512, true),
            )
            .await;
        let f = fixture(test_config(), fetcher).await;

        let result = f
            .service
            .get_logo(
                "site.example",
                LogoOptions {
                    invert_for_dark_mode: true,
                },
            )
            .await;
        assert!(result.is_valid);
        let key = result.storage_key.unwrap();
        assert!(key.ends_with("_inverted.png"));
        assert!(f.store.exists(&key).await.unwrap());

        // The base variant exists alongside.
        let base = key.replace("_inverted.png", ".png");
        assert!(f.store.exists(&base).await.unwrap());
    }

    #[tokio::test]
    async fn variants_share_one_pipeline_per_domain() {
        let fetcher = MockFetcher::new().with_delay(Duration::from_millis(50));
        fetcher
            .respond_with(
                "https://site.example/favicon-512.png",
                "image/png",
                png(512, 512, true),
            )
            .await;
        let f = fixture(test_config(), fetcher).await;

        let plain = f.service.clone();
        let dark = f.service.clone();
        let plain = tokio::spawn(async move {
            plain.get_logo("site.example", LogoOptions::default()).await
        });
        let dark = tokio::spawn(async move {
            dark.get_logo(
                "site.example",
                LogoOptions {
                    invert_for_dark_mode: true,
                },
            )
            .await
        });
        let plain = plain.await.unwrap();
        let dark = dark.await.unwrap();

        // One walk served both option sets.
        assert_eq!(f.fetcher.call_count(), 1);
        assert!(plain.is_valid && dark.is_valid);
        assert!(!plain.storage_key.unwrap().ends_with("_inverted.png"));
        assert!(dark.storage_key.unwrap().ends_with("_inverted.png"));
    }

    #[tokio::test]
    async fn cleanup_prunes_abandoned_pipelines() {
        let f = fixture(test_config(), MockFetcher::new()).await;
        let pipeline: SharedPipeline = async {
            LogoFetchResult::not_found("stale.example", "abandoned")
        }
        .boxed()
        .shared();
        f.service.in_flight.lock().await.insert(
            "stale.example".to_string(),
            InFlightPipeline {
                pipeline,
                started_at: Instant::now(),
            },
        );

        // Young entries survive; anything past the age bound goes.
        assert_eq!(f.service.prune_in_flight(Duration::from_secs(600)).await, 0);
        assert_eq!(f.service.get_stats().await.in_flight, 1);
        assert_eq!(f.service.prune_in_flight(Duration::ZERO).await, 1);
        assert_eq!(f.service.get_stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn flat_third_party_tiles_are_rejected() {
        let fetcher = MockFetcher::new();
        // Third-party placeholder: flat tile for an unknown domain.
        fetcher
            .respond_with(
                "https://www.google.com/s2/favicons?domain=unknown.example&sz=128",
                "image/png",
                png(128, 128, false),
            )
            .await;
        let f = fixture(test_config(), fetcher).await;

        let result = f.service.get_logo("unknown.example", LogoOptions::default()).await;
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn non_square_logos_are_rejected() {
        let fetcher = MockFetcher::new();
        fetcher
            .respond_with(
                "https://site.example/favicon-512.png",
                "image/png",
                png(300, 100, true),
            )
            .await;
        let f = fixture(test_config(), fetcher).await;

        let result = f.service.get_logo("site.example", LogoOptions::default()).await;
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn tripped_circuit_skips_remaining_candidates_for_host() {
        let fetcher = MockFetcher::new();
        for url in [
            "https://flaky.example/favicon-512.png",
            "https://flaky.example/favicon-192.png",
            "https://flaky.example/apple-touch-icon.png",
            "https://flaky.example/favicon.svg",
            "https://flaky.example/favicon.png",
            "https://flaky.example/favicon.ico",
        ] {
            fetcher
                .fail_with(url, |u| FetchError::Transient {
                    url: u.to_string(),
                    message: "connection reset".to_string(),
                })
                .await;
        }
        let f = fixture(test_config(), fetcher).await;

        f.service.get_logo("flaky.example", LogoOptions::default()).await;

        // failure_threshold = 2: after two transient failures against
        // flaky.example the remaining candidates for that host are skipped
        // without a fetch.
        let urls = f.fetcher.requested_urls().await;
        let flaky_hits = urls
            .iter()
            .filter(|u| u.starts_with("https://flaky.example/"))
            .count();
        assert_eq!(flaky_hits, 2);
        // Third-party services are a different host and still consulted.
        assert!(urls.iter().any(|u| u.contains("google.com")));
    }

    #[tokio::test]
    async fn retry_queue_evicts_oldest_fifth_when_full() {
        let f = fixture(test_config(), MockFetcher::new()).await;
        for i in 0..10 {
            f.service
                .push_retry_for_test(UploadRetryEntry {
                    storage_key: format!("logos/k{i}.png"),
                    source_url: format!("https://s.example/{i}.png"),
                    content_type: "image/png".to_string(),
                    attempts: 0,
                    last_attempt: Utc::now(),
                    next_retry: Utc::now(),
                })
                .await;
        }
        assert_eq!(f.service.retry_queue_len().await, 10);

        f.service
            .push_retry_for_test(UploadRetryEntry {
                storage_key: "logos/k10.png".to_string(),
                source_url: "https://s.example/10.png".to_string(),
                content_type: "image/png".to_string(),
                attempts: 0,
                last_attempt: Utc::now(),
                next_retry: Utc::now(),
            })
            .await;

        // max_entries = 10, so the oldest 2 (10/5) were evicted first.
        assert_eq!(f.service.retry_queue_len().await, 9);
        let queue = f.service.retry_queue.lock().await;
        assert!(!queue.iter().any(|e| e.storage_key == "logos/k0.png"));
        assert!(!queue.iter().any(|e| e.storage_key == "logos/k1.png"));
        assert!(queue.iter().any(|e| e.storage_key == "logos/k10.png"));
    }

    #[tokio::test]
    async fn retry_drain_runs_through_the_scheduler() {
        let mut config = test_config();
        config.scheduler.tick_interval = Duration::from_millis(10);
        let fetcher = MockFetcher::new();
        fetcher
            .respond_with(
                "https://s.example/logo.png",
                "image/png",
                png(64, 64, true),
            )
            .await;
        let f = fixture(config, fetcher).await;

        // An already-due entry, as if a write failed under pressure earlier.
        f.service.retry_queue.lock().await.push_back(UploadRetryEntry {
            storage_key: "logos/queued_upload.png".to_string(),
            source_url: "https://s.example/logo.png".to_string(),
            content_type: "image/png".to_string(),
            attempts: 0,
            last_attempt: Utc::now(),
            next_retry: Utc::now() - chrono::Duration::seconds(1),
        });

        let cancel = CancellationToken::new();
        let scheduler_task = f.service.scheduler.start(cancel.clone());
        let service_task = f.service.start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.service.retry_queue_len().await, 0);
        assert!(f.store.exists("logos/queued_upload.png").await.unwrap());
        assert!(f.service.scheduler.get_stats().await.completed >= 1);

        cancel.cancel();
        let _ = scheduler_task.await;
        let _ = service_task.await;
    }

    #[tokio::test]
    async fn get_image_is_idempotent_by_url() {
        let fetcher = MockFetcher::new();
        fetcher
            .respond_with(
                "https://cdn.example/photo.jpg",
                "image/jpeg",
                Bytes::from(vec![0xFFu8; 1024]),
            )
            .await;
        let f = fixture(test_config(), fetcher).await;

        let first = f.service.get_image("https://cdn.example/photo.jpg").await.unwrap();
        assert!(!first.from_cache);
        assert!(first.storage_key.starts_with("images/"));
        assert!(first.storage_key.ends_with(".jpg"));
        assert!(f.store.exists(&first.storage_key).await.unwrap());

        let second = f.service.get_image("https://cdn.example/photo.jpg").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.storage_key, first.storage_key);
        assert_eq!(f.fetcher.call_count(), 1);
    }

    /// Store wrapper that fails writes with `MemoryPressure` while a flag
    /// is set, for exercising the retry queue end to end.
    struct PressureStore {
        inner: Arc<MemoryBlobStore>,
        pressured: AtomicBool,
    }

    #[async_trait]
    impl BlobStore for PressureStore {
        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }
        async fn read(&self, key: &str) -> StorageResult<Bytes> {
            self.inner.read(key).await
        }
        async fn write(&self, key: &str, data: Bytes) -> StorageResult<()> {
            if self.pressured.load(Ordering::SeqCst) {
                return Err(StorageError::MemoryPressure {
                    key: key.to_string(),
                });
            }
            self.inner.write(key, data).await
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
        async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list_prefix(prefix).await
        }
        async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
            self.inner.rename(from, to).await
        }
        async fn write_stream(&self, key: &str, stream: ByteStream) -> StorageResult<u64> {
            self.inner.write_stream(key, stream).await
        }
    }

    #[tokio::test]
    async fn pressured_write_is_queued_then_drained() {
        let inner = Arc::new(MemoryBlobStore::new());
        let pressure_store = Arc::new(PressureStore {
            inner: inner.clone(),
            pressured: AtomicBool::new(true),
        });

        let config = Arc::new(test_config());
        let fetcher = Arc::new(MockFetcher::new());
        fetcher
            .respond_with(
                "https://site.example/favicon-512.png",
                "image/png",
                png(512, 512, true),
            )
            .await;
        let monitor = MemoryMonitor::new(&config.memory);
        let storage = StreamingStorage::new(
            pressure_store.clone() as Arc<dyn BlobStore>,
            config.storage.streaming_threshold_bytes,
            config.storage.max_asset_bytes,
        );
        let failures = Arc::new(
            FailureTracker::load(pressure_store.clone() as Arc<dyn BlobStore>, &config.failures)
                .await,
        );
        let scheduler = RequestScheduler::new(config.scheduler.clone(), monitor.clone());
        let service = AssetService::new(
            config,
            fetcher.clone(),
            storage,
            monitor,
            scheduler,
            failures,
        )
        .unwrap();

        let result = service.get_logo("site.example", LogoOptions::default()).await;
        // The fetch succeeded; only persistence was deferred.
        assert!(result.is_valid);
        assert_eq!(service.retry_queue_len().await, 1);
        let key = result.storage_key.unwrap();
        assert!(!inner.exists(&key).await.unwrap());

        // Pressure clears; the drain re-fetches and lands the write.
        pressure_store.pressured.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.drain_retry_queue().await;
        assert_eq!(service.retry_queue_len().await, 0);
        assert!(inner.exists(&key).await.unwrap());
    }
}
