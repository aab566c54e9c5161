//! Error types for session registration.

use thiserror::Error;
use uuid::Uuid;

/// Reasons a session cannot be registered.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session token is not a UUID.
    #[error("invalid session token: {token:?}")]
    InvalidToken { token: String },

    /// Another session (possibly the same browser) is already active.
    #[error("a session is already active ({active})")]
    Occupied { active: Uuid },

    /// The hub has shut down.
    #[error("session hub is shut down")]
    HubClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::InvalidToken {
            token: "nope".to_string(),
        };
        assert!(err.to_string().contains("\"nope\""));

        let id = Uuid::nil();
        let err = SessionError::Occupied { active: id };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
