//! Remote-signer pairing over relays.
//!
//! Lantern never holds the user's long-term signing key: a separate
//! signer device (e.g. a mobile key vault) signs on the client's
//! behalf. This module implements the client side of the pairing
//! handshake that establishes that relationship.
//!
//! # Flow
//!
//! ```text
//! NostrConnectSession::start()
//!     │  generate ephemeral keys + shared secret
//!     │  build nostrconnect:// URI  ──► shown as QR code
//!     │  connect relays in parallel, subscribe for kind 24133
//!     ▼
//! Listening ── signer scans QR, publishes encrypted reply ──► Connected
//!     │                                                        │
//!     └── timeout / cancel / protocol error                    ▼
//!                                              NostrConnectResult
//!                                              (durable signer handle)
//! ```
//!
//! The session decrypts replies with its ephemeral secret key and
//! validates them against the shared secret embedded in the URI. The
//! ephemeral identity never signs application events and is discarded
//! at the session layer once the durable relationship exists.

mod error;
mod registry;
mod session;
mod types;
mod uri;

pub use error::{ConnectError, ConnectResult};
pub use registry::SessionRegistry;
pub use session::NostrConnectSession;
pub use types::{
    AppMetadata, NostrConnectResult, NostrRemoteSignerInfo, PairingSecret, PairingSessionState,
    SessionOptions,
};
pub use uri::{encode_pairing_uri, PairingUri, PAIRING_URI_SCHEME};
