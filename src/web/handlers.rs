//! HTTP handlers

use crate::errors::{AppError, FetchError};
use crate::models::LogoOptions;
use crate::utils::memory_monitor::MemoryStatus;
use crate::web::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

/// Health endpoint honoring the memory contract: healthy and warning are
/// 200, critical is 503.
pub async fn health(State(state): State<AppState>) -> Response {
    let stats = state.monitor.get_stats().await;
    let body = json!({
        "status": stats.status,
        "memory": {
            "rss_bytes": stats.rss_bytes,
            "peak_rss_bytes": stats.peak_rss_bytes,
            "budget_bytes": stats.budget_bytes,
            "trend": stats.trend,
            "caches_disabled": stats.caches_disabled,
        },
    });
    match stats.status {
        MemoryStatus::Critical => (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response(),
        _ => (StatusCode::OK, Json(body)).into_response(),
    }
}

pub async fn liveness() -> Response {
    (StatusCode::OK, Json(json!({"status": "alive"}))).into_response()
}

pub async fn readiness(State(state): State<AppState>) -> Response {
    if state.monitor.should_accept_new_requests().await {
        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not ready", "reason": "memory pressure"})),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct LogoQuery {
    #[serde(default)]
    pub invert: bool,
}

pub async fn get_logo(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Query(query): Query<LogoQuery>,
) -> Response {
    let result = state
        .service
        .get_logo(
            &domain,
            LogoOptions {
                invert_for_dark_mode: query.invert,
            },
        )
        .await;
    let status = if result.is_valid {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(result)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: String,
}

pub async fn get_image(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> Response {
    match state.service.get_image(&query.url).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn stats(State(state): State<AppState>) -> Response {
    let body = json!({
        "memory": state.monitor.get_stats().await,
        "scheduler": state.scheduler.get_stats().await,
        "service": state.service.get_stats().await,
        "operations": state.service.operations().get_stats().await,
    });
    (StatusCode::OK, Json(body)).into_response()
}

fn error_response(error: AppError) -> Response {
    let status = match &error {
        AppError::Validation { .. } => StatusCode::BAD_REQUEST,
        AppError::Fetch(FetchError::MemoryPressure) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Fetch(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": error.to_string()}))).into_response()
}
