//! Relay connectivity for Lantern.
//!
//! This module maintains the distinction at the heart of the client's
//! networking layer: the persisted set of *configured* relay addresses
//! versus the live set of *connected* sockets. The
//! [`RelayConnectionManager`] reconciles the two continuously,
//! recovers silently-dead connections, and exposes a reactive status
//! view for callers to drive UI from.
//!
//! # Architecture
//!
//! ```text
//! Lantern App
//!     │
//!     ▼
//! RelayConnectionManager ──► RelayListStorage (persisted addresses)
//!     │
//!     ▼
//! RelaySocket (one per configured address, via RelaySocketFactory)
//!     │
//!     ▼
//! Nostr Relays
//! ```
//!
//! Transport details live behind the [`RelaySocket`] trait; the
//! production implementation wraps a single-relay `nostr_sdk::Client`
//! per address, and tests inject mocks through the factory seam.

mod address;
mod error;
mod manager;
mod socket;
mod storage;
mod types;

pub use address::RelayAddress;
pub use error::{RelayError, RelayResult};
pub use manager::{RelayConnectionManager, RelayManagerConfig, DEFAULT_RECONCILE_INTERVAL};
pub use socket::{
    HealthProbe, IncomingMessage, MessageHandler, RelaySocket, RelaySocketFactory, SdkRelaySocket,
    SdkSocketFactory, SocketPhase,
};
pub use storage::{RelayListStorage, SqliteRelayStorage};
pub use types::{
    PublishOutcome, RelayConnectionState, RelayConnectionStatus, RelayStatusSnapshot,
    SocketCounters,
};
