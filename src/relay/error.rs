//! Error types for relay operations.

use thiserror::Error;

/// Errors that can occur during relay management and socket I/O.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Connection to a relay failed.
    #[error("Failed to connect to relay {address}: {reason}")]
    Connection {
        /// The relay address that failed.
        address: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Invalid relay address.
    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),

    /// Subscription could not be installed.
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// Event publishing failed.
    #[error("Failed to publish event: {0}")]
    Publish(String),

    /// Every targeted relay failed.
    #[error("All relays failed to accept the event")]
    AllRelaysFailed,

    /// The manager has not been initialized.
    #[error("Relay manager not initialized")]
    NotInitialized,

    /// Persisted relay list could not be read or written.
    #[error("Relay list storage error: {0}")]
    Storage(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
