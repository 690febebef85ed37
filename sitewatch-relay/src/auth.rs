//! Handshake validation for relay connections
//!
//! Credential checking is delegated to a [`TokenValidator`]; the relay only
//! needs a yes/no answer for the presented token.

use serde::Deserialize;
use sitewatch_core::models::{CameraId, Role, UserType};
use subtle::ConstantTimeEq;

use crate::error::{RelayError, Result};

/// Decides whether a presented access token is acceptable
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Validator comparing against a single shared secret
pub struct SharedSecretValidator {
    secret: Vec<u8>,
}

impl SharedSecretValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into().into_bytes(),
        }
    }
}

impl TokenValidator for SharedSecretValidator {
    fn validate(&self, token: &str) -> bool {
        // ct_eq on slices of different length returns false without leaking content
        self.secret.as_slice().ct_eq(token.as_bytes()).into()
    }
}

/// Query parameters presented when a relay connection is opened
///
/// `ws://host:7777/?token=...&role=supervisor&user_type=sender&camera_id=camera-supervisor-1`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeParams {
    pub token: Option<String>,
    pub role: Option<String>,
    pub user_type: Option<String>,
    pub camera_id: Option<String>,
}

/// A handshake that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub role: Role,
    pub user_type: UserType,
    pub camera_id: CameraId,
}

impl HandshakeParams {
    /// Validate credentials and parameters
    ///
    /// `user_type` defaults to `viewer` when absent. Both senders and viewers
    /// must name a camera.
    pub fn authenticate(&self, validator: &dyn TokenValidator) -> Result<ConnectionRequest> {
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RelayError::auth("Missing token"))?;
        if !validator.validate(token) {
            return Err(RelayError::auth("Invalid token"));
        }

        let role = self
            .role
            .as_deref()
            .ok_or_else(|| RelayError::auth("Invalid role"))?
            .parse::<Role>()
            .map_err(|_| RelayError::auth("Invalid role"))?;

        let user_type = match self.user_type.as_deref() {
            None => UserType::Viewer,
            Some(raw) => raw.parse::<UserType>().map_err(RelayError::AuthFailure)?,
        };

        let camera_id = self
            .camera_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| match user_type {
                UserType::Sender => RelayError::auth("Camera ID required for senders"),
                UserType::Viewer => RelayError::auth("Camera ID required for viewers"),
            })?;

        Ok(ConnectionRequest {
            role,
            user_type,
            camera_id: CameraId::from(camera_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(token: &str, role: &str, user_type: Option<&str>, camera: Option<&str>) -> HandshakeParams {
        HandshakeParams {
            token: Some(token.to_string()),
            role: Some(role.to_string()),
            user_type: user_type.map(str::to_string),
            camera_id: camera.map(str::to_string),
        }
    }

    #[test]
    fn test_shared_secret_validator() {
        let validator = SharedSecretValidator::new("StrongPassword123");
        assert!(validator.validate("StrongPassword123"));
        assert!(!validator.validate("StrongPassword12"));
        assert!(!validator.validate(""));
    }

    #[test]
    fn test_valid_sender_handshake() {
        let validator = SharedSecretValidator::new("secret");
        let request = params("secret", "supervisor", Some("sender"), Some("camera-supervisor-1"))
            .authenticate(&validator)
            .unwrap();

        assert_eq!(request.role, Role::Supervisor);
        assert_eq!(request.user_type, UserType::Sender);
        assert_eq!(request.camera_id.as_str(), "camera-supervisor-1");
    }

    #[test]
    fn test_user_type_defaults_to_viewer() {
        let validator = SharedSecretValidator::new("secret");
        let request = params("secret", "admin", None, Some("camera-supervisor-1"))
            .authenticate(&validator)
            .unwrap();
        assert_eq!(request.user_type, UserType::Viewer);
    }

    #[test]
    fn test_rejections() {
        let validator = SharedSecretValidator::new("secret");

        let err = params("wrong", "admin", Some("viewer"), Some("cam"))
            .authenticate(&validator)
            .unwrap_err();
        assert_eq!(err, RelayError::auth("Invalid token"));

        let err = HandshakeParams::default().authenticate(&validator).unwrap_err();
        assert_eq!(err, RelayError::auth("Missing token"));

        let err = params("secret", "worker", Some("viewer"), Some("cam"))
            .authenticate(&validator)
            .unwrap_err();
        assert_eq!(err, RelayError::auth("Invalid role"));

        let err = params("secret", "admin", Some("sender"), None)
            .authenticate(&validator)
            .unwrap_err();
        assert_eq!(err, RelayError::auth("Camera ID required for senders"));

        let err = params("secret", "admin", Some("viewer"), Some("  "))
            .authenticate(&validator)
            .unwrap_err();
        assert_eq!(err, RelayError::auth("Camera ID required for viewers"));

        let err = params("secret", "admin", Some("broadcaster"), Some("cam"))
            .authenticate(&validator)
            .unwrap_err();
        assert!(matches!(err, RelayError::AuthFailure(_)));
    }
}
