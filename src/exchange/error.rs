//! Error taxonomy for the quote service connection.

use super::types::ServiceError;
use std::time::Duration;
use thiserror::Error;

/// Service error code for a subscription the server already holds.
pub const ALREADY_SUBSCRIBED: &str = "AlreadySubscribed";

/// Service error codes that invalidate the current session.
pub const SESSION_FATAL_CODES: [&str; 2] = ["InvalidToken", "AuthorizationRequired"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("not connected to the quote service")]
    NotConnected,

    #[error("request {req_id} timed out after {timeout:?}")]
    Timeout { req_id: u64, timeout: Duration },

    #[error("service error {code}: {message}")]
    Service { code: String, message: String },

    #[error("connection lost before a reply arrived")]
    ConnectionLost,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection manager shut down")]
    Shutdown,
}

impl ApiError {
    /// The benign "already subscribed" service condition.
    pub fn is_already_subscribed(&self) -> bool {
        matches!(self, ApiError::Service { code, .. } if code == ALREADY_SUBSCRIBED)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout { .. })
    }

    /// Whether this service error ends the session and forces a reopen.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ApiError::Service { code, .. } if SESSION_FATAL_CODES.contains(&code.as_str()))
    }
}

impl From<&ServiceError> for ApiError {
    fn from(error: &ServiceError) -> Self {
        ApiError::Service {
            code: error.code.clone(),
            message: error.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let already = ApiError::from(&ServiceError {
            code: ALREADY_SUBSCRIBED.to_string(),
            message: "You are already subscribed to R_100".to_string(),
        });
        assert!(already.is_already_subscribed());
        assert!(!already.is_session_fatal());

        let invalid = ApiError::Service {
            code: "InvalidToken".to_string(),
            message: "The token is invalid.".to_string(),
        };
        assert!(invalid.is_session_fatal());

        let timeout = ApiError::Timeout {
            req_id: 4,
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_already_subscribed());
        assert_eq!(timeout.to_string(), "request 4 timed out after 1s");
    }
}
