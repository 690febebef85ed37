//! Camera status API
//!
//! `GET /api/camera/ws` describes the relay; `POST /api/camera/ws` takes an
//! `action` of either `stats` or `update_stats`. The latter lets a relay running
//! in another process push its counts here.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};

use sitewatch_relay::{StatsSnapshot, StatsUpdate};

use crate::http::{AppError, AppResult, AppState};

pub fn create_status_router() -> Router<AppState> {
    Router::new().route("/api/camera/ws", get(camera_status).post(camera_action))
}

#[derive(Debug, Serialize)]
pub struct CameraStatus {
    pub status: &'static str,
    pub websocket_url: String,
    pub stats: StatsSnapshot,
}

pub async fn camera_status(State(state): State<AppState>) -> Json<CameraStatus> {
    Json(CameraStatus {
        status: "Camera API ready",
        websocket_url: state.config.websocket_url(),
        stats: state.hub.get_stats(),
    })
}

pub async fn camera_action(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(body) = payload?;

    match body.get("action").and_then(Value::as_str) {
        Some("stats") => Ok(Json(serde_json::to_value(state.hub.get_stats())?)),
        Some("update_stats") => {
            let update: StatsUpdate = serde_json::from_value(body)?;
            if !update.is_empty() {
                tracing::debug!(?update, "Merging externally reported stats");
                state.hub.update_stats(update);
            }
            Ok(Json(json!({ "success": true })))
        }
        _ => Err(AppError::bad_request("Invalid action")),
    }
}
