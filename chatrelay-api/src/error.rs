//! Session-level failures reported to clients as `error` frames

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Wire code carried in the `error` frame
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::UnknownRecipient(_) => "UNKNOWN_RECIPIENT",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Persistence(_) => "PERSISTENCE_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Text shown to the client; internal details stay in the logs
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::AuthFailed(msg)
            | Self::InvalidInput(msg)
            | Self::UnknownRecipient(msg)
            | Self::PermissionDenied(msg) => msg.clone(),
            Self::Persistence(_) => "message could not be stored".to_string(),
            Self::Internal(_) => "internal error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(BridgeError::AuthFailed(String::new()).code(), "AUTH_FAILED");
        assert_eq!(BridgeError::Persistence(String::new()).code(), "PERSISTENCE_FAILED");
        assert_eq!(BridgeError::UnknownRecipient(String::new()).code(), "UNKNOWN_RECIPIENT");
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = BridgeError::Persistence("disk full on /var/lib".to_string());
        assert!(!err.client_message().contains("disk"));
        assert_eq!(
            BridgeError::InvalidInput("text must not be empty".to_string()).client_message(),
            "text must not be empty"
        );
    }
}
