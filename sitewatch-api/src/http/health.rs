//! Health check endpoints
//!
//! `/health` is the bare liveness probe; `/api/camera/health` is the richer
//! variant the dashboards poll.

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/camera/health", get(camera_health))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct CameraHealth {
    pub status: &'static str,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub service: &'static str,
    pub version: &'static str,
}

pub async fn camera_health() -> Json<CameraHealth> {
    Json(CameraHealth {
        status: "ok",
        timestamp: chrono::Utc::now().timestamp_millis(),
        service: "camera-api",
        version: env!("CARGO_PKG_VERSION"),
    })
}
