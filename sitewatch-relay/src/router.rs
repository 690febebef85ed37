//! Frame router
//!
//! Decides what happens to every inbound message. Fan-out never blocks: each
//! viewer has a bounded queue and a full queue means the frame is dropped for
//! that viewer only. Frames from one sender are routed sequentially from that
//! sender's session, so each viewer sees them in emission order.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::message::{now_millis, FrameMessage, InboundMessage, OutboundMessage};
use crate::registry::{Connection, ConnectionRegistry, DeliveryTarget, Outbound};
use crate::stats::RelayStats;

/// Per-message fan-out result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Viewer queue was full
    pub dropped: usize,
    /// Viewer queue was closed; the viewer has been unregistered
    pub failed: usize,
}

/// What the router did with one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Consumed as a keep-alive
    KeepAlive,
    /// Keep-alive answered with a pong
    Pong,
    /// Frame fanned out to the camera's viewers
    FrameRelayed(Delivery),
    /// Sensor reading fanned out to the camera's viewers
    SensorRelayed(Delivery),
    /// Dropped without effect
    Ignored(&'static str),
    /// Neither structured JSON nor a plausible frame
    Malformed,
}

pub struct FrameRouter {
    registry: Arc<ConnectionRegistry>,
    stats: Arc<RelayStats>,
    latest_sensor: RwLock<Option<Outbound>>,
}

impl FrameRouter {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, stats: Arc<RelayStats>) -> Self {
        Self {
            registry,
            stats,
            latest_sensor: RwLock::new(None),
        }
    }

    /// Decode and route a text message
    pub fn route_text(&self, origin: &Connection, text: &str) -> RouteOutcome {
        match InboundMessage::parse_text(text) {
            Ok(message) => self.route(origin, message),
            Err(e) => self.malformed(origin, &e),
        }
    }

    /// Decode and route a binary message
    pub fn route_binary(&self, origin: &Connection, bytes: &[u8]) -> RouteOutcome {
        match InboundMessage::parse_binary(bytes) {
            Ok(message) => self.route(origin, message),
            Err(e) => self.malformed(origin, &e),
        }
    }

    pub fn route(&self, origin: &Connection, message: InboundMessage) -> RouteOutcome {
        match message {
            InboundMessage::KeepAlive => RouteOutcome::KeepAlive,
            InboundMessage::Ping => {
                self.reply_pong(origin);
                RouteOutcome::Pong
            }
            InboundMessage::Frame(frame) => {
                if !origin.user_type.is_sender() {
                    debug!(
                        connection_id = %origin.connection_id,
                        "Ignoring frame sent by a viewer"
                    );
                    return RouteOutcome::Ignored("viewers cannot publish frames");
                }
                self.relay_frame(origin, frame)
            }
            InboundMessage::Sensor { camera_id, data } => {
                if !origin.user_type.is_sender() {
                    return RouteOutcome::Ignored("viewers cannot publish sensor data");
                }
                if let Some(claimed) = camera_id.filter(|id| id != &origin.camera_id) {
                    debug!(
                        connection_id = %origin.connection_id,
                        claimed = %claimed,
                        camera_id = %origin.camera_id,
                        "Sensor camera_id differs from registration, using registration"
                    );
                }
                let encoded = match (OutboundMessage::Sensor {
                    camera_id: Some(origin.camera_id.as_str()),
                    data: &data,
                })
                .encode()
                {
                    Ok(encoded) => encoded,
                    Err(e) => return self.malformed(origin, &e),
                };
                let targets = self.registry.viewer_targets(&origin.camera_id);
                RouteOutcome::SensorRelayed(self.fan_out(targets, &encoded))
            }
            InboundMessage::Unknown(kind) => {
                debug!(
                    connection_id = %origin.connection_id,
                    message_type = %kind,
                    "Ignoring message of unhandled type"
                );
                RouteOutcome::Ignored("unhandled message type")
            }
        }
    }

    fn relay_frame(&self, origin: &Connection, frame: FrameMessage) -> RouteOutcome {
        self.stats.on_frame_received();

        if let Some(claimed) = frame.camera_id.as_ref().filter(|id| *id != &origin.camera_id) {
            debug!(
                connection_id = %origin.connection_id,
                claimed = %claimed,
                camera_id = %origin.camera_id,
                kind = ?frame.kind,
                "Frame camera_id differs from registration, using registration"
            );
        }

        let targets = self.registry.viewer_targets(&origin.camera_id);
        if targets.is_empty() {
            return RouteOutcome::FrameRelayed(Delivery::default());
        }

        let encoded = match (OutboundMessage::Frame {
            camera_id: origin.camera_id.as_str(),
            timestamp: frame.timestamp.unwrap_or_else(now_millis),
            data: &frame.payload,
        })
        .encode()
        {
            Ok(encoded) => encoded,
            Err(e) => return self.malformed(origin, &e),
        };

        let delivery = self.fan_out(targets, &encoded);
        self.stats.on_frames_relayed(delivery.delivered as u64);
        self.stats
            .on_frames_dropped((delivery.dropped + delivery.failed) as u64);
        RouteOutcome::FrameRelayed(delivery)
    }

    /// Best-effort delivery to every target; one failing viewer never affects another
    fn fan_out(&self, targets: Vec<DeliveryTarget>, message: &Outbound) -> Delivery {
        let mut delivery = Delivery::default();
        for target in targets {
            match target.outbound.try_send(message.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    debug!(
                        connection_id = %target.connection_id,
                        "Viewer queue full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    delivery.failed += 1;
                    let error = RelayError::DeliveryFailure(target.connection_id.to_string());
                    warn!(error = %error, "Viewer channel closed, unregistering");
                    self.registry.unregister(&target.connection_id);
                }
            }
        }
        delivery
    }

    fn reply_pong(&self, origin: &Connection) {
        let Some(outbound) = self.registry.outbound(&origin.connection_id) else {
            return;
        };
        match (OutboundMessage::Pong {
            timestamp: now_millis(),
        })
        .encode()
        {
            Ok(pong) => {
                if outbound.try_send(pong).is_err() {
                    debug!(connection_id = %origin.connection_id, "Pong not queued");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode pong"),
        }
    }

    fn malformed(&self, origin: &Connection, error: &RelayError) -> RouteOutcome {
        debug!(
            connection_id = %origin.connection_id,
            error = %error,
            "Dropping malformed message"
        );
        RouteOutcome::Malformed
    }

    /// Broadcast a sensor reading from outside the relay to every viewer
    ///
    /// The reading is kept and replayed to viewers that connect later.
    pub fn publish_sensor(&self, data: &Value) -> Result<Delivery> {
        let encoded = OutboundMessage::Sensor {
            camera_id: None,
            data,
        }
        .encode()?;
        *self.latest_sensor.write() = Some(encoded.clone());
        Ok(self.fan_out(self.registry.all_viewer_targets(), &encoded))
    }

    /// Queue the latest sensor reading for a newly registered viewer
    pub fn greet_viewer(&self, viewer: &Connection) {
        let Some(latest) = self.latest_sensor.read().clone() else {
            return;
        };
        if let Some(outbound) = self.registry.outbound(&viewer.connection_id) {
            let _ = outbound.try_send(latest);
        }
    }

    #[must_use]
    pub fn has_latest_sensor(&self) -> bool {
        self.latest_sensor.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use sitewatch_core::models::{CameraId, Role, UserType};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const JPEG_B64: &str = "/9j/4AAQSkZJRgABAQ==";

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        stats: Arc<RelayStats>,
        router: FrameRouter,
    }

    fn fixture() -> Fixture {
        let stats = Arc::new(RelayStats::new());
        let registry = Arc::new(ConnectionRegistry::new(stats.clone(), Duration::from_secs(10)));
        let router = FrameRouter::new(registry.clone(), stats.clone());
        Fixture {
            registry,
            stats,
            router,
        }
    }

    fn join(
        registry: &ConnectionRegistry,
        user_type: UserType,
        camera: &str,
        capacity: usize,
    ) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let connection = Connection::new(Role::Supervisor, user_type, CameraId::from(camera));
        registry
            .register(
                connection.clone(),
                ConnectionHandle {
                    outbound: tx,
                    cancel: CancellationToken::new(),
                },
            )
            .unwrap();
        (connection, rx)
    }

    fn frame_json(index: u32) -> String {
        format!(r#"{{"type":"frame","camera_id":"cam","timestamp":{index},"data":"{JPEG_B64}"}}"#)
    }

    #[test]
    fn test_frames_reach_viewers_in_order() {
        let f = fixture();
        let (sender, _srx) = join(&f.registry, UserType::Sender, "cam", 4);
        let (_viewer, mut vrx) = join(&f.registry, UserType::Viewer, "cam", 8);

        for i in 1..=3 {
            let outcome = f.router.route_text(&sender, &frame_json(i));
            assert_eq!(
                outcome,
                RouteOutcome::FrameRelayed(Delivery {
                    delivered: 1,
                    ..Default::default()
                })
            );
        }

        for i in 1..=3 {
            let message: Value = serde_json::from_str(&vrx.try_recv().unwrap()).unwrap();
            assert_eq!(message["type"], "frame");
            assert_eq!(message["camera_id"], "cam");
            assert_eq!(message["timestamp"], f64::from(i));
            assert_eq!(message["data"], JPEG_B64);
        }
        assert!(vrx.try_recv().is_err());
        assert_eq!(f.stats.snapshot().frames_relayed, 3);
    }

    #[test]
    fn test_frames_do_not_cross_cameras() {
        let f = fixture();
        let (sender, _srx) = join(&f.registry, UserType::Sender, "cam-a", 4);
        let (_other, mut orx) = join(&f.registry, UserType::Viewer, "cam-b", 4);

        f.router.route_text(&sender, JPEG_B64);
        assert!(orx.try_recv().is_err());
        assert_eq!(f.stats.snapshot().frames_received, 1);
        assert_eq!(f.stats.snapshot().frames_relayed, 0);
    }

    #[test]
    fn test_registered_camera_overrides_message_camera() {
        let f = fixture();
        let (sender, _srx) = join(&f.registry, UserType::Sender, "cam", 4);
        let (_viewer, mut vrx) = join(&f.registry, UserType::Viewer, "cam", 4);

        let text = format!(r#"{{"type":"video","camera_id":"spoofed","frame":"{JPEG_B64}"}}"#);
        f.router.route_text(&sender, &text);

        let message: Value = serde_json::from_str(&vrx.try_recv().unwrap()).unwrap();
        assert_eq!(message["type"], "frame");
        assert_eq!(message["camera_id"], "cam");
        assert!(message["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_full_viewer_queue_drops_without_blocking_others() {
        let f = fixture();
        let (sender, _srx) = join(&f.registry, UserType::Sender, "cam", 4);
        let (_slow, _slow_rx) = join(&f.registry, UserType::Viewer, "cam", 1);
        let (_fast, mut fast_rx) = join(&f.registry, UserType::Viewer, "cam", 8);

        for i in 1..=3 {
            f.router.route_text(&sender, &frame_json(i));
        }

        for _ in 1..=3 {
            assert!(fast_rx.try_recv().is_ok());
        }
        let snapshot = f.stats.snapshot();
        assert_eq!(snapshot.frames_relayed, 4);
        assert_eq!(snapshot.frames_dropped, 2);
        assert_eq!(f.registry.len(), 3);
    }

    #[test]
    fn test_closed_viewer_is_unregistered() {
        let f = fixture();
        let (sender, _srx) = join(&f.registry, UserType::Sender, "cam", 4);
        let (dead, dead_rx) = join(&f.registry, UserType::Viewer, "cam", 4);
        let (_alive, mut alive_rx) = join(&f.registry, UserType::Viewer, "cam", 4);
        drop(dead_rx);

        let RouteOutcome::FrameRelayed(delivery) = f.router.route_text(&sender, JPEG_B64) else {
            panic!("expected relay");
        };
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.failed, 1);
        assert!(alive_rx.try_recv().is_ok());
        assert!(!f.registry.contains(&dead.connection_id));
        assert_eq!(f.stats.snapshot().viewer_count, 1);
    }

    #[test]
    fn test_viewer_frames_are_ignored() {
        let f = fixture();
        let (viewer, _vrx) = join(&f.registry, UserType::Viewer, "cam", 4);
        let (_other, mut orx) = join(&f.registry, UserType::Viewer, "cam", 4);

        assert!(matches!(
            f.router.route_text(&viewer, JPEG_B64),
            RouteOutcome::Ignored(_)
        ));
        assert!(orx.try_recv().is_err());
        assert_eq!(f.stats.snapshot().frames_received, 0);
    }

    #[test]
    fn test_control_messages() {
        let f = fixture();
        let (viewer, mut vrx) = join(&f.registry, UserType::Viewer, "cam", 4);

        assert_eq!(f.router.route_text(&viewer, "ping"), RouteOutcome::KeepAlive);
        assert!(vrx.try_recv().is_err());

        assert_eq!(
            f.router.route_text(&viewer, r#"{"type":"ping"}"#),
            RouteOutcome::Pong
        );
        let pong: Value = serde_json::from_str(&vrx.try_recv().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");

        assert_eq!(f.router.route_text(&viewer, "not a frame!"), RouteOutcome::Malformed);
    }

    #[test]
    fn test_sensor_relay_and_replay() {
        let f = fixture();
        let (sender, _srx) = join(&f.registry, UserType::Sender, "cam", 4);
        let (_viewer, mut vrx) = join(&f.registry, UserType::Viewer, "cam", 4);

        let outcome = f
            .router
            .route_text(&sender, r#"{"type":"sensor","data":{"heart_rate":88}}"#);
        assert!(matches!(outcome, RouteOutcome::SensorRelayed(d) if d.delivered == 1));
        let message: Value = serde_json::from_str(&vrx.try_recv().unwrap()).unwrap();
        assert_eq!(message["type"], "sensor");
        assert_eq!(message["camera_id"], "cam");
        assert_eq!(message["data"]["heart_rate"], 88);

        let delivery = f
            .router
            .publish_sensor(&serde_json::json!({"gas": 0.2}))
            .unwrap();
        assert_eq!(delivery.delivered, 1);
        assert!(f.router.has_latest_sensor());

        let (late, mut late_rx) = join(&f.registry, UserType::Viewer, "other", 4);
        f.router.greet_viewer(&late);
        let replay: Value = serde_json::from_str(&late_rx.try_recv().unwrap()).unwrap();
        assert_eq!(replay["data"]["gas"], 0.2);
    }
}
