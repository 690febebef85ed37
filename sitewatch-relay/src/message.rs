//! Relay wire codec
//!
//! Inbound traffic arrives in several shapes depending on which camera client
//! produced it:
//!
//! - structured JSON: `{"type":"frame"|"video"|"sensor"|"ping", ...}`
//! - legacy raw base64 JPEG text with no envelope
//! - raw JPEG bytes in a binary message
//! - the literal text `ping` (keep-alive)
//!
//! Viewers always receive the normalized `{"type":"frame",...}` shape.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use sitewatch_core::models::CameraId;

use crate::error::{RelayError, Result};

/// Text literal used by dashboards as a keep-alive
pub const KEEPALIVE_LITERAL: &str = "ping";

/// JPEG start-of-image marker
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Which producer generation emitted a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `{"type":"frame","data":...}`
    Frame,
    /// `{"type":"video","frame":...}`
    Video,
    /// Bare base64 text or raw JPEG bytes
    Legacy,
}

/// One video frame as received from a sender
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    pub kind: FrameKind,
    pub camera_id: Option<CameraId>,
    /// Producer capture time in milliseconds, when supplied
    pub timestamp: Option<f64>,
    /// Base64-encoded JPEG
    pub payload: String,
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Frame(FrameMessage),
    Sensor {
        camera_id: Option<CameraId>,
        data: Value,
    },
    /// Literal `ping` or a `pong`: resets liveness only
    KeepAlive,
    /// JSON `{"type":"ping"}`: resets liveness and expects a pong
    Ping,
    /// Well-formed envelope with a type this relay does not handle
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    camera_id: Option<String>,
    frame: Option<String>,
    data: Option<Value>,
    timestamp: Option<f64>,
}

impl InboundMessage {
    /// Decode a text message
    pub fn parse_text(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed == KEEPALIVE_LITERAL {
            return Ok(Self::KeepAlive);
        }
        if trimmed.starts_with('{') {
            let envelope: Envelope = serde_json::from_str(trimmed)
                .map_err(|e| RelayError::MalformedMessage(format!("invalid JSON envelope: {e}")))?;
            return Self::from_envelope(envelope);
        }
        if is_plausible_base64(trimmed) {
            return Ok(Self::Frame(FrameMessage {
                kind: FrameKind::Legacy,
                camera_id: None,
                timestamp: None,
                payload: trimmed.to_string(),
            }));
        }
        Err(RelayError::MalformedMessage(
            "neither a JSON envelope nor base64 frame data".to_string(),
        ))
    }

    /// Decode a binary message
    ///
    /// UTF-8 payloads are treated like text; raw JPEG bytes become a legacy frame.
    pub fn parse_binary(bytes: &[u8]) -> Result<Self> {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return Self::parse_text(text);
        }
        if bytes.starts_with(&JPEG_SOI) {
            return Ok(Self::Frame(FrameMessage {
                kind: FrameKind::Legacy,
                camera_id: None,
                timestamp: None,
                payload: STANDARD.encode(bytes),
            }));
        }
        Err(RelayError::MalformedMessage(
            "binary message is not a JPEG image".to_string(),
        ))
    }

    fn from_envelope(envelope: Envelope) -> Result<Self> {
        let camera_id = envelope
            .camera_id
            .filter(|id| !id.is_empty())
            .map(CameraId::from);

        match envelope.kind.as_deref() {
            Some(kind @ ("frame" | "video")) => {
                let payload = envelope
                    .frame
                    .or_else(|| match envelope.data {
                        Some(Value::String(data)) => Some(data),
                        _ => None,
                    })
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        RelayError::MalformedMessage(format!("{kind} message without image data"))
                    })?;
                Ok(Self::Frame(FrameMessage {
                    kind: if kind == "video" {
                        FrameKind::Video
                    } else {
                        FrameKind::Frame
                    },
                    camera_id,
                    timestamp: envelope.timestamp,
                    payload,
                }))
            }
            Some("sensor") => Ok(Self::Sensor {
                camera_id,
                data: envelope.data.unwrap_or(Value::Null),
            }),
            Some("ping") => Ok(Self::Ping),
            Some("pong") => Ok(Self::KeepAlive),
            Some(other) => Ok(Self::Unknown(other.to_string())),
            None => Ok(Self::Unknown(String::new())),
        }
    }
}

/// Cheap plausibility test for bare base64 frame data
fn is_plausible_base64(text: &str) -> bool {
    !text.is_empty() && text.len() % 4 == 0 && STANDARD.decode(text).is_ok()
}

/// Messages the relay writes to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage<'a> {
    Frame {
        camera_id: &'a str,
        timestamp: f64,
        data: &'a str,
    },
    Sensor {
        #[serde(skip_serializing_if = "Option::is_none")]
        camera_id: Option<&'a str>,
        data: &'a Value,
    },
    Pong {
        timestamp: f64,
    },
}

impl OutboundMessage<'_> {
    /// Serialize once; the result is shared by every recipient
    pub fn encode(&self) -> Result<Arc<str>> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| RelayError::MalformedMessage(format!("failed to encode message: {e}")))
    }
}

/// Wall-clock milliseconds, the unit producers use for `timestamp`
#[must_use]
pub fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}
