use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Portal role of the connecting device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Supervisor,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervisor" => Ok(Self::Supervisor),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {s}")),
        }
    }
}

/// Whether a connection produces frames or consumes them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Sender,
    Viewer,
}

impl UserType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    pub const fn is_sender(&self) -> bool {
        matches!(self, Self::Sender)
    }
}

impl std::fmt::Display for UserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(Self::Sender),
            "viewer" => Ok(Self::Viewer),
            _ => Err(format!("Invalid user_type: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("supervisor".parse::<Role>().unwrap(), Role::Supervisor);
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("worker".parse::<Role>().is_err());
        assert!("Admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_user_type_parsing() {
        assert_eq!("sender".parse::<UserType>().unwrap(), UserType::Sender);
        assert_eq!("viewer".parse::<UserType>().unwrap(), UserType::Viewer);
        assert!("observer".parse::<UserType>().is_err());
        assert!(UserType::Sender.is_sender());
        assert!(!UserType::Viewer.is_sender());
    }
}
