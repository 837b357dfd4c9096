//! HTTP API
//!
//! Thin axum layer over the asset service: health probes honoring the
//! memory contract, the logo/image endpoints, and a stats endpoint.

pub mod handlers;

use crate::scheduler::RequestScheduler;
use crate::services::AssetService;
use crate::utils::memory_monitor::MemoryMonitor;
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub service: AssetService,
    pub monitor: MemoryMonitor,
    pub scheduler: RequestScheduler,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/live", get(handlers::liveness))
        .route("/ready", get(handlers::readiness))
        .route("/api/v1/logos/{domain}", get(handlers::get_logo))
        .route("/api/v1/images", get(handlers::get_image))
        .route("/api/v1/stats", get(handlers::stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
