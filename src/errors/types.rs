//! Error type definitions for the logo-proxy application
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the application.
/// It uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Fetch pipeline errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Blob storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// External service errors
    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from the acquisition pipeline
///
/// The taxonomy matters to the orchestrator: transient errors advance to the
/// next candidate, validation errors exclude a candidate, circuit/blocklist
/// errors fail fast without touching the network.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Network-level failure for a single candidate (timeout, DNS, reset)
    #[error("Transient network error for {url}: {message}")]
    Transient { url: String, message: String },

    /// Candidate fetch timed out
    #[error("Fetch timeout after {seconds}s: {url}")]
    Timeout { url: String, seconds: u64 },

    /// Response body failed validation (too small, wrong shape, placeholder)
    #[error("Invalid asset from {url}: {reason}")]
    InvalidAsset { url: String, reason: String },

    /// Circuit breaker is open for this origin
    #[error("Circuit open for {context}")]
    CircuitOpen { context: String },

    /// Domain is permanently blocklisted
    #[error("Domain blocklisted: {domain}")]
    Blocklisted { domain: String },

    /// Rate limit window is exhausted for this context
    #[error("Rate limited: {context} - retry after {retry_after_ms}ms")]
    RateLimited { context: String, retry_after_ms: u64 },

    /// Request refused before any work due to memory pressure
    #[error("Rejected under memory pressure")]
    MemoryPressure,

    /// Upstream returned an HTTP error status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Every candidate was tried and none validated
    #[error("All candidates exhausted for {domain}")]
    Exhausted { domain: String },
}

/// Blob storage specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Object not found
    #[error("Not found: {key}")]
    NotFound { key: String },

    /// Write refused or failed under transient memory pressure; retryable
    #[error("Write deferred under memory pressure: {key}")]
    MemoryPressure { key: String },

    /// Streamed body exceeded the hard size cap
    #[error("Size cap exceeded for {key}: {received} > {cap} bytes")]
    SizeCapExceeded { key: String, received: u64, cap: u64 },

    /// Key failed validation (empty, absolute, traversal)
    #[error("Invalid storage key: {key}")]
    InvalidKey { key: String },

    /// Serialization of a durable record failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Scheduler specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Queue is at max_queue_size
    #[error("Queue full ({size}/{max})")]
    QueueFull { size: usize, max: usize },

    /// Request rejected because memory status is critical
    #[error("Rejected under memory pressure")]
    MemoryPressure,

    /// Request exceeded its retry budget
    #[error("Retries exhausted after {retries} attempts")]
    RetriesExhausted { retries: u32 },

    /// Scheduler is stopping; queued work was cancelled
    #[error("Scheduler shutting down")]
    ShuttingDown,

    /// The executed operation itself failed
    #[error("Operation failed: {message}")]
    OperationFailed { message: String },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an external service error
    pub fn external_service<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl FetchError {
    /// True when the orchestrator should move on to the next candidate
    /// instead of aborting the pipeline.
    pub fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            FetchError::Transient { .. }
                | FetchError::Timeout { .. }
                | FetchError::InvalidAsset { .. }
                | FetchError::HttpStatus { .. }
        )
    }
}

impl StorageError {
    pub fn io<K: Into<String>>(key: K, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }

    /// Writes queued for retry are only those that failed under pressure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::MemoryPressure { .. })
    }
}
