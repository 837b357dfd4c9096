//! Error handling for the logo-proxy application

pub mod types;

pub use types::{AppError, FetchError, SchedulerError, StorageError};

/// Convenient result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;

/// Result alias for fetch pipeline operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
