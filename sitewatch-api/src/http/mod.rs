// Module: http
// Relay WebSocket endpoint plus the JSON status API consumed by the dashboards

pub mod error;
pub mod health;
pub mod relay;
pub mod sensor;
pub mod status;

use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sitewatch_core::Config;
use sitewatch_relay::RelayHub;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: RelayHub,
    pub config: Arc<Config>,
}

/// Create the HTTP router with all routes
pub fn create_router(hub: RelayHub, config: Arc<Config>) -> Router {
    let state = AppState { hub, config };

    Router::new()
        // Relay endpoint (camera clients connect to the bare host)
        .merge(relay::create_relay_router())
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        .merge(status::create_status_router())
        .merge(sensor::create_sensor_router())
        // Dashboards are served from another origin
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
