use sitewatch_core::models::CameraId;
use thiserror::Error;

/// WebSocket close code for policy violations (RFC 6455 §7.4.1)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for an endpoint going away
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Relay failure taxonomy
///
/// Only rejections (`AuthFailure`, `CameraAlreadyClaimed`) are surfaced to the
/// originating client; everything else is handled inside the relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("{0}")]
    AuthFailure(String),

    #[error("camera {0} already has an active sender")]
    CameraAlreadyClaimed(CameraId),

    #[error("connection {0} is already registered")]
    DuplicateIdentity(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Delivery to {0} failed")]
    DeliveryFailure(String),

    #[error("liveness timeout")]
    LivenessTimeout,
}

impl RelayError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthFailure(reason.into())
    }

    /// Close code sent to the peer when this error ends its session
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::AuthFailure(_) | Self::CameraAlreadyClaimed(_) | Self::DuplicateIdentity(_) => {
                CLOSE_POLICY_VIOLATION
            }
            Self::MalformedMessage(_) | Self::DeliveryFailure(_) | Self::LivenessTimeout => {
                CLOSE_GOING_AWAY
            }
        }
    }

    /// Whether the connection is refused before it is ever registered
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure(_) | Self::CameraAlreadyClaimed(_) | Self::DuplicateIdentity(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(RelayError::auth("Invalid token").close_code(), 1008);
        assert_eq!(
            RelayError::CameraAlreadyClaimed(CameraId::from("cam")).close_code(),
            1008
        );
        assert_eq!(RelayError::LivenessTimeout.close_code(), 1001);
    }

    #[test]
    fn test_messages_are_client_readable() {
        assert_eq!(RelayError::auth("Invalid role").to_string(), "Invalid role");
        assert_eq!(
            RelayError::CameraAlreadyClaimed(CameraId::from("camera-admin-1")).to_string(),
            "camera camera-admin-1 already has an active sender"
        );
        assert!(RelayError::auth("x").is_rejection());
        assert!(!RelayError::LivenessTimeout.is_rejection());
    }
}
