//! Sensor board ingest
//!
//! Sensor boards POST arbitrary JSON readings; each reading is broadcast to
//! every connected viewer and kept for viewers that join later.

use axum::{extract::rejection::JsonRejection, extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use tracing::debug;

use crate::http::{AppResult, AppState};

pub fn create_sensor_router() -> Router<AppState> {
    Router::new().route("/api/sensor/data", post(receive_sensor_data))
}

pub async fn receive_sensor_data(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(data) = payload?;
    let delivery = state.hub.router().publish_sensor(&data)?;
    debug!(
        delivered = delivery.delivered,
        dropped = delivery.dropped + delivery.failed,
        "Sensor reading broadcast"
    );

    Ok(Json(json!({ "status": "ok", "received": data })))
}
