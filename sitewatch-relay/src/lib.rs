//! Live camera relay
//!
//! Senders push JPEG frames for a camera id; the relay fans each frame out to
//! every viewer subscribed to that camera.

pub mod auth;
pub mod error;
pub mod hub;
pub mod message;
pub mod registry;
pub mod reporter;
pub mod router;
pub mod session;
pub mod stats;

pub use auth::{HandshakeParams, SharedSecretValidator, TokenValidator};
pub use error::{RelayError, Result};
pub use hub::{RelayHub, RelaySettings};
pub use registry::{Connection, ConnectionRegistry};
pub use reporter::StatsReporter;
pub use router::{FrameRouter, RouteOutcome};
pub use session::{FrameSink, FrameSource, SessionOutcome, TransportMessage};
pub use stats::{RelayStats, StatsSnapshot, StatsUpdate};
