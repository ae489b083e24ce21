//! Error types for remote-signer pairing.

use thiserror::Error;

/// Errors that can occur while driving a pairing session.
///
/// Note that most handshake-level failures are *not* errors: malformed
/// or undecryptable replies are dropped, and timeouts resolve with an
/// empty result. Only misuse of the session API and total connectivity
/// loss surface here.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// `start` was called more than once. Sessions are single-use.
    #[error("Pairing session already started")]
    AlreadyStarted,

    /// An operation was called in a state that does not allow it.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// No valid relay address was supplied.
    #[error("No relay addresses configured for pairing")]
    NoRelaysConfigured,

    /// Every relay failed to connect during session setup.
    #[error("No relay reachable: {0}")]
    NoRelayReachable(String),

    /// The pairing URI could not be parsed.
    #[error("Invalid pairing URI: {0}")]
    InvalidUri(String),
}

/// Result type for pairing operations.
pub type ConnectResult<T> = Result<T, ConnectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_started_display() {
        assert_eq!(
            ConnectError::AlreadyStarted.to_string(),
            "Pairing session already started"
        );
    }

    #[test]
    fn invalid_state_display() {
        let error = ConnectError::InvalidState("expected listening".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid session state: expected listening"
        );
    }

    #[test]
    fn no_relay_reachable_display() {
        let error = ConnectError::NoRelayReachable("3 relays failed".to_string());
        assert_eq!(error.to_string(), "No relay reachable: 3 relays failed");
    }
}
