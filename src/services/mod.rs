//! Service layer
//!
//! Business logic composed from the utility modules: HTTP fetching behind a
//! trait seam, the durable domain blocklist, and the orchestrating asset
//! service.

pub mod asset_service;
pub mod failure_tracker;
pub mod fetcher;

pub use asset_service::AssetService;
pub use failure_tracker::FailureTracker;
pub use fetcher::{AssetFetcher, FetchedResponse, HttpFetcher};
