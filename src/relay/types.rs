//! Types for relay management.
//!
//! This module defines the per-relay connection lifecycle, the status
//! entries the manager maintains for every configured address, and the
//! snapshot map delivered to status listeners.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use nostr::EventId;

use super::address::RelayAddress;

/// Lifecycle state of a single relay connection.
///
/// `Authenticated` is a strictly stronger variant of `Connected`: the
/// relay has additionally validated an auth challenge. It is never
/// reached without passing through `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayConnectionState {
    /// Not connected to the relay.
    Disconnected,

    /// Connection attempt in progress.
    Connecting,

    /// Connected and ready.
    Connected,

    /// Connected, and the relay has validated an auth challenge.
    Authenticated,

    /// The last connection attempt failed. Retryable.
    Error,
}

impl RelayConnectionState {
    /// Returns true for `Connected` and `Authenticated`.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

/// Status of a single configured relay.
///
/// The manager keeps exactly one entry per configured address at all
/// times; removing an address removes its entry atomically.
#[derive(Debug, Clone)]
pub struct RelayConnectionStatus {
    /// The normalized relay address.
    pub address: RelayAddress,

    /// Current lifecycle state.
    pub state: RelayConnectionState,

    /// Consecutive error count. Reset to zero by any successful
    /// transition that is not itself an error.
    pub error_count: u32,

    /// Latest error message, if any.
    pub error_message: Option<String>,

    /// Last time a connection was established.
    pub last_connected_at: Option<DateTime<Utc>>,

    /// Last time an error was recorded.
    pub last_error_at: Option<DateTime<Utc>>,

    /// True for the one address that is re-inserted at initialization
    /// when missing from the persisted configuration.
    pub is_default: bool,
}

impl RelayConnectionStatus {
    /// Creates a fresh `Disconnected` entry for an address.
    #[must_use]
    pub const fn new(address: RelayAddress, is_default: bool) -> Self {
        Self {
            address,
            state: RelayConnectionState::Disconnected,
            error_count: 0,
            error_message: None,
            last_connected_at: None,
            last_error_at: None,
            is_default,
        }
    }

    /// Applies a state transition, maintaining the error counter and
    /// timestamp invariants.
    ///
    /// Entering `Error` grows the counter; entering a connected-like
    /// state resets it and stamps `last_connected_at`. Neutral
    /// transitions (`Connecting`, `Disconnected`) leave the counter
    /// alone so repeated failed retries stay visible.
    pub fn transition(&mut self, state: RelayConnectionState, error_message: Option<String>) {
        self.state = state;
        if state == RelayConnectionState::Error {
            self.error_count += 1;
            self.error_message = error_message;
            self.last_error_at = Some(Utc::now());
        } else if state.is_connected() {
            self.error_count = 0;
            self.error_message = None;
            self.last_connected_at = Some(Utc::now());
        }
    }
}

/// A full, consistent copy of all per-relay status entries, delivered as
/// a single update to listeners.
pub type RelayStatusSnapshot = BTreeMap<String, RelayConnectionStatus>;

/// Raw per-socket counters for diagnostics.
///
/// Pulled directly from live sockets, bypassing the debounced status
/// view; momentarily inconsistent with it by design.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketCounters {
    /// Events delivered by the relay.
    pub events_received: u64,

    /// Subscription and publish frames sent to the relay.
    pub queries_sent: u64,

    /// Socket-level errors observed.
    pub error_count: u64,
}

/// Result of fanning an event out to the connected relays.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// The event that was published.
    pub event_id: EventId,

    /// Relays that accepted the event.
    pub accepted_by: Vec<String>,

    /// Relays that failed, with reasons.
    pub failed: Vec<(String, String)>,
}

impl PublishOutcome {
    /// Returns true if at least one relay accepted the event.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !self.accepted_by.is_empty()
    }
}
