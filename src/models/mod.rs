//! Shared data models
//!
//! Records that cross module boundaries or are persisted/serialized live
//! here; module-internal state (queue entries, snapshots) stays with its
//! owning module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a logo came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetSource {
    /// Fetched from the site itself (favicon variants, apple-touch icons)
    Direct,
    /// Google favicon service
    Google,
    /// DuckDuckGo icon service
    Duckduckgo,
    /// Clearbit logo API
    Clearbit,
}

impl AssetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetSource::Direct => "direct",
            AssetSource::Google => "google",
            AssetSource::Duckduckgo => "duckduckgo",
            AssetSource::Clearbit => "clearbit",
        }
    }

    /// All sources, in storage-lookup order.
    pub fn all() -> [AssetSource; 4] {
        [
            AssetSource::Direct,
            AssetSource::Google,
            AssetSource::Duckduckgo,
            AssetSource::Clearbit,
        ]
    }
}

impl std::fmt::Display for AssetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(AssetSource::Direct),
            "google" => Ok(AssetSource::Google),
            "duckduckgo" => Ok(AssetSource::Duckduckgo),
            "clearbit" => Ok(AssetSource::Clearbit),
            _ => Err(()),
        }
    }
}

/// Options for a logo request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogoOptions {
    /// Also produce and persist a dark-mode (inverted) variant
    #[serde(default)]
    pub invert_for_dark_mode: bool,
}

/// Outcome of a logo pipeline run
///
/// Cached in-process with a TTL; negative outcomes (`is_valid == false`)
/// are cached with the same TTL so failing domains are not hammered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoFetchResult {
    pub domain: String,
    pub source: Option<AssetSource>,
    pub content_type: Option<String>,
    pub storage_key: Option<String>,
    pub cdn_url: Option<String>,
    /// Origin URL the bytes came from, when freshly fetched
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_valid: bool,
    pub error: Option<String>,
}

impl LogoFetchResult {
    pub fn not_found<D: Into<String>, E: Into<String>>(domain: D, error: E) -> Self {
        Self {
            domain: domain.into(),
            source: None,
            content_type: None,
            storage_key: None,
            cdn_url: None,
            url: None,
            timestamp: Utc::now(),
            is_valid: false,
            error: Some(error.into()),
        }
    }
}

/// Outcome of a page-image request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFetchResult {
    pub url: String,
    pub storage_key: String,
    pub cdn_url: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub from_cache: bool,
    pub timestamp: DateTime<Utc>,
}

/// Durable failure record for one domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainFailureRecord {
    pub key: String,
    pub failure_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    /// Once set this never reverts except through `remove_failure`
    pub permanently_blocked: bool,
}

/// Pending storage re-upload for a write that failed under memory pressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRetryEntry {
    pub storage_key: String,
    pub source_url: String,
    pub content_type: String,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
    pub next_retry: DateTime<Utc>,
}
