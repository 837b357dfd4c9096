//! Application configuration
//!
//! Deserialized from a TOML file with environment-variable overrides
//! (`LOGO_PROXY_` prefix). Every field has a default so an empty file is a
//! valid configuration; durations are human-readable strings ("30s", "5m").

pub mod duration_serde;

use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub failures: FailureConfig,
    #[serde(default)]
    pub retry_queue: RetryQueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the blob store
    #[serde(default = "default_storage_root")]
    pub root: String,
    /// Public CDN base URL; preferred for resolving object URLs
    #[serde(default)]
    pub cdn_base_url: Option<String>,
    /// Storage endpoint + bucket, used when no CDN base is configured
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    /// Bodies with a known length above this are streamed straight to storage
    #[serde(default = "default_streaming_threshold")]
    pub streaming_threshold_bytes: u64,
    /// Hard per-asset cap; downloads crossing it are aborted
    #[serde(default = "default_max_asset_bytes")]
    pub max_asset_bytes: u64,
}

fn default_storage_root() -> String {
    "./data/blobs".to_string()
}
fn default_streaming_threshold() -> u64 {
    5 * 1024 * 1024
}
fn default_max_asset_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            cdn_base_url: None,
            endpoint_url: None,
            bucket: None,
            streaming_threshold_bytes: default_streaming_threshold(),
            max_asset_bytes: default_max_asset_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Overall memory budget for the process, in megabytes
    #[serde(default = "default_memory_budget_mb")]
    pub budget_mb: u64,
    /// RSS above this fraction of the budget is Warning
    #[serde(default = "default_warning_fraction")]
    pub warning_fraction: f64,
    /// RSS above this fraction of the budget is Critical
    #[serde(default = "default_critical_fraction")]
    pub critical_fraction: f64,
    /// Interval between RSS samples
    #[serde(default = "default_sample_interval", with = "duration_serde::duration")]
    pub sample_interval: Duration,
}

fn default_memory_budget_mb() -> u64 {
    1024
}
fn default_warning_fraction() -> f64 {
    0.75
}
fn default_critical_fraction() -> f64 {
    0.90
}
fn default_sample_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_mb: default_memory_budget_mb(),
            warning_fraction: default_warning_fraction(),
            critical_fraction: default_critical_fraction(),
            sample_interval: default_sample_interval(),
        }
    }
}

impl MemoryConfig {
    pub fn warning_threshold_bytes(&self) -> u64 {
        (self.budget_mb as f64 * 1024.0 * 1024.0 * self.warning_fraction) as u64
    }

    pub fn critical_threshold_bytes(&self) -> u64 {
        (self.budget_mb as f64 * 1024.0 * 1024.0 * self.critical_fraction) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-candidate request timeout
    #[serde(default = "default_fetch_timeout", with = "duration_serde::duration")]
    pub candidate_timeout: Duration,
    /// Connect timeout for the HTTP client
    #[serde(default = "default_connect_timeout", with = "duration_serde::duration")]
    pub connect_timeout: Duration,
    /// Smallest acceptable asset body, in bytes
    #[serde(default = "default_min_asset_bytes")]
    pub min_asset_bytes: u64,
    /// Maximum |width/height - 1| for a logo to count as square-ish
    #[serde(default = "default_aspect_tolerance")]
    pub aspect_ratio_tolerance: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(8)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_min_asset_bytes() -> u64 {
    128
}
fn default_aspect_tolerance() -> f64 {
    0.25
}
fn default_user_agent() -> String {
    format!("logo-proxy/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            candidate_timeout: default_fetch_timeout(),
            connect_timeout: default_connect_timeout(),
            min_asset_bytes: default_min_asset_bytes(),
            aspect_ratio_tolerance: default_aspect_tolerance(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window per context
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Fixed window length
    #[serde(default = "default_window", with = "duration_serde::duration")]
    pub window: Duration,
    /// Failures within the window that open the circuit for a context
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Window after which an open circuit closes again
    #[serde(default = "default_reset_timeout", with = "duration_serde::duration")]
    pub reset_timeout: Duration,
}

fn default_max_requests() -> u32 {
    30
}
fn default_window() -> Duration {
    Duration::from_secs(60)
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Queue drain tick
    #[serde(default = "default_tick_interval", with = "duration_serde::duration")]
    pub tick_interval: Duration,
    /// Fraction of the memory budget above which the drain loop backs off
    #[serde(default = "default_memory_threshold_percent")]
    pub memory_threshold_percent: f64,
    /// Base backoff under memory pressure, doubled per consecutive pressured tick
    #[serde(default = "default_backoff_base", with = "duration_serde::duration")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_max", with = "duration_serde::duration")]
    pub backoff_max: Duration,
    /// Per-request retry budget
    #[serde(default = "default_request_max_retries")]
    pub max_retries: u32,
}

fn default_max_queue_size() -> usize {
    256
}
fn default_max_concurrent() -> usize {
    8
}
fn default_tick_interval() -> Duration {
    Duration::from_millis(200)
}
fn default_memory_threshold_percent() -> f64 {
    0.80
}
fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}
fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}
fn default_request_max_retries() -> u32 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_concurrent: default_max_concurrent(),
            tick_interval: default_tick_interval(),
            memory_threshold_percent: default_memory_threshold_percent(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            max_retries: default_request_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    /// Attempts within one process before a domain is skipped for the session
    #[serde(default = "default_session_max_attempts")]
    pub session_max_attempts: u32,
    /// Cooldown after a failed run before the domain is attempted again
    #[serde(default = "default_failure_cooldown", with = "duration_serde::duration")]
    pub cooldown: Duration,
    /// Durable failure count at which a domain is permanently blocklisted
    #[serde(default = "default_blocklist_threshold")]
    pub blocklist_threshold: u32,
    /// Maximum domains kept in the durable blocklist
    #[serde(default = "default_blocklist_max_items")]
    pub blocklist_max_items: usize,
    /// Storage key of the durable blocklist blob
    #[serde(default = "default_blocklist_key")]
    pub blocklist_key: String,
}

fn default_session_max_attempts() -> u32 {
    2
}
fn default_failure_cooldown() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_blocklist_threshold() -> u32 {
    5
}
fn default_blocklist_max_items() -> usize {
    10_000
}
fn default_blocklist_key() -> String {
    "meta/domain-failures.json".to_string()
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            session_max_attempts: default_session_max_attempts(),
            cooldown: default_failure_cooldown(),
            blocklist_threshold: default_blocklist_threshold(),
            blocklist_max_items: default_blocklist_max_items(),
            blocklist_key: default_blocklist_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueConfig {
    #[serde(default = "default_retry_queue_size")]
    pub max_entries: usize,
    #[serde(default = "default_retry_base_delay", with = "duration_serde::duration")]
    pub base_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "duration_serde::duration")]
    pub max_delay: Duration,
    /// Jitter applied to each computed delay, as a fraction (0.2 = ±20%)
    #[serde(default = "default_retry_jitter")]
    pub jitter_fraction: f64,
    #[serde(default = "default_drain_interval", with = "duration_serde::duration")]
    pub drain_interval: Duration,
}

fn default_retry_queue_size() -> usize {
    100
}
fn default_retry_base_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_retry_max_delay() -> Duration {
    Duration::from_secs(600)
}
fn default_retry_jitter() -> f64 {
    0.2
}
fn default_drain_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_entries: default_retry_queue_size(),
            base_delay: default_retry_base_delay(),
            max_delay: default_retry_max_delay(),
            jitter_fraction: default_retry_jitter(),
            drain_interval: default_drain_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for in-process fetch results, positive and negative alike
    #[serde(default = "default_result_ttl", with = "duration_serde::duration")]
    pub result_ttl: Duration,
    /// Maximum in-process result cache entries
    #[serde(default = "default_result_capacity")]
    pub result_capacity: usize,
    /// Interval of the periodic in-memory cleanup tick
    #[serde(default = "default_cleanup_interval", with = "duration_serde::duration")]
    pub cleanup_interval: Duration,
}

fn default_result_ttl() -> Duration {
    Duration::from_secs(6 * 3600)
}
fn default_result_capacity() -> usize {
    2048
}
fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            result_ttl: default_result_ttl(),
            result_capacity: default_result_capacity(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file plus `LOGO_PROXY_*` env overrides.
    ///
    /// A missing file is not an error; defaults are written out so the
    /// operator has something to edit.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !std::path::Path::new(config_file).exists() {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
        }

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("LOGO_PROXY_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on configurations that would silently disable safety rails.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_requests == 0 {
            anyhow::bail!("rate_limit.max_requests must be greater than zero");
        }
        if self.rate_limit.window.is_zero() {
            anyhow::bail!("rate_limit.window must be greater than zero");
        }
        if self.memory.warning_fraction >= self.memory.critical_fraction {
            anyhow::bail!("memory.warning_fraction must be below memory.critical_fraction");
        }
        if self.storage.streaming_threshold_bytes > self.storage.max_asset_bytes {
            anyhow::bail!("storage.streaming_threshold_bytes exceeds storage.max_asset_bytes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.streaming_threshold_bytes, 5 * 1024 * 1024);
        assert_eq!(config.storage.max_asset_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn zero_rate_limit_window_is_rejected() {
        let mut config = Config::default();
        config.rate_limit.window = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_requests_is_rejected() {
        let mut config = Config::default();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_strings_parse() {
        let config: Config = toml::from_str(
            r#"
            [memory]
            sample_interval = "10s"

            [cache]
            result_ttl = "1h"
            "#,
        )
        .unwrap();
        assert_eq!(config.memory.sample_interval, Duration::from_secs(10));
        assert_eq!(config.cache.result_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn memory_thresholds_derive_from_budget() {
        let config = MemoryConfig {
            budget_mb: 1000,
            warning_fraction: 0.5,
            critical_fraction: 0.8,
            sample_interval: Duration::from_secs(1),
        };
        assert_eq!(config.warning_threshold_bytes(), 500 * 1024 * 1024);
        assert_eq!(config.critical_threshold_bytes(), 800 * 1024 * 1024);
    }
}
