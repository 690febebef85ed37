// SiteWatch API Library
//
// HTTP surface of the camera relay: the relay WebSocket endpoint, the camera
// status API, sensor ingest and health probes

pub mod http;

pub use http::{create_router, AppState};
