//! Types for remote-signer pairing.

use std::sync::Arc;

use nostr::{Keys, PublicKey};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use super::registry::SessionRegistry;
use crate::relay::{RelayAddress, RelaySocketFactory};

/// Lifecycle of a pairing session, strictly ordered.
///
/// `Connected`, `Timeout`, `Cancelled`, and `Error` are terminal; no
/// transition leaves a terminal state except constructing a new
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingSessionState {
    /// Constructed, not yet started.
    Idle,

    /// Generating the ephemeral identity and pairing URI.
    Generating,

    /// Sockets connected, subscription active, waiting for the signer.
    Listening,

    /// A valid handshake reply was received.
    Connected,

    /// No valid reply arrived within the caller's deadline.
    Timeout,

    /// Explicitly cancelled.
    Cancelled,

    /// Setup or protocol failure.
    Error,
}

impl PairingSessionState {
    /// True for states no transition may leave.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Timeout | Self::Cancelled | Self::Error
        )
    }
}

/// Optional human-readable application metadata shown on the signer
/// device during pairing.
#[derive(Debug, Clone, Default)]
pub struct AppMetadata {
    /// Application name.
    pub name: Option<String>,

    /// Application URL.
    pub url: Option<String>,

    /// Application icon URL.
    pub icon: Option<String>,

    /// Requested permissions, in the pairing protocol's encoding.
    pub permissions: Option<String>,

    /// Callback URL invoked by the signer after approval.
    pub callback_url: Option<String>,
}

/// The random shared secret embedded in the pairing URI and echoed
/// back by the signer.
///
/// Zeroized on drop. Comparison against a candidate value is
/// constant-time.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PairingSecret(String);

impl PairingSecret {
    /// Generates a fresh random secret.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// The secret's wire form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a candidate value.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        use subtle::ConstantTimeEq;
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.write_str("PairingSecret(..)")
    }
}

/// Descriptor of a pairing: the ephemeral client identity, the relays
/// it listens on, and (once resolved) the remote signer's public key.
#[derive(Debug, Clone)]
pub struct NostrRemoteSignerInfo {
    client_keys: Keys,
    secret: PairingSecret,

    /// Relay addresses used for the handshake and for subsequent
    /// signer communication.
    pub relays: Vec<RelayAddress>,

    /// Application metadata shown to the signer device.
    pub metadata: AppMetadata,

    /// The remote signer's public key. Absent before resolution; set
    /// exactly once by a successful handshake.
    pub remote_signer_pubkey: Option<PublicKey>,
}

impl NostrRemoteSignerInfo {
    /// Creates a descriptor with a fresh ephemeral key pair and secret.
    #[must_use]
    pub fn generate(relays: Vec<RelayAddress>, metadata: AppMetadata) -> Self {
        Self {
            client_keys: Keys::generate(),
            secret: PairingSecret::generate(),
            relays,
            metadata,
            remote_signer_pubkey: None,
        }
    }

    /// The ephemeral client key pair.
    #[must_use]
    pub const fn client_keys(&self) -> &Keys {
        &self.client_keys
    }

    /// The ephemeral client public key.
    #[must_use]
    pub fn client_pubkey(&self) -> PublicKey {
        self.client_keys.public_key()
    }

    /// The shared pairing secret.
    #[must_use]
    pub const fn secret(&self) -> &PairingSecret {
        &self.secret
    }

    /// Rebuilds the descriptor with the remote signer's key populated.
    #[must_use]
    pub fn with_remote_signer(mut self, pubkey: PublicKey) -> Self {
        self.remote_signer_pubkey = Some(pubkey);
        self
    }
}

/// Terminal success value of a pairing session.
#[derive(Debug, Clone)]
pub struct NostrConnectResult {
    /// The remote signer's public key.
    pub remote_signer_pubkey: PublicKey,

    /// The user's public key, when the signer volunteered it. Usually
    /// absent; obtain it with a follow-up `get_public_key` request over
    /// the established signer channel.
    pub user_pubkey: Option<PublicKey>,

    /// The full descriptor needed to construct a persistent signer
    /// handle.
    pub info: NostrRemoteSignerInfo,
}

/// Tunables for a pairing session.
#[derive(Default)]
pub struct SessionOptions {
    /// Require the reply's result to match the shared secret (or the
    /// `ack` literal) exactly. Off by default: signer implementations
    /// respond inconsistently, and any decryptable non-error response
    /// is accepted with a logged warning on inexact matches.
    pub strict_secret: bool,

    /// Registry suppressing completions for pairings that already
    /// finished, e.g. a zombie session resolved after a restart.
    pub registry: Option<Arc<SessionRegistry>>,

    /// Socket factory override, injected for testing.
    pub socket_factory: Option<Arc<dyn RelaySocketFactory>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(PairingSessionState::Connected.is_terminal());
        assert!(PairingSessionState::Timeout.is_terminal());
        assert!(PairingSessionState::Cancelled.is_terminal());
        assert!(PairingSessionState::Error.is_terminal());
        assert!(!PairingSessionState::Idle.is_terminal());
        assert!(!PairingSessionState::Generating.is_terminal());
        assert!(!PairingSessionState::Listening.is_terminal());
    }

    #[test]
    fn secret_is_32_hex_chars() {
        let secret = PairingSecret::generate();
        assert_eq!(secret.as_str().len(), 32);
        assert!(hex::decode(secret.as_str()).is_ok());
    }

    #[test]
    fn secrets_are_unique() {
        assert_ne!(
            PairingSecret::generate().as_str(),
            PairingSecret::generate().as_str()
        );
    }

    #[test]
    fn secret_matches_itself_only() {
        let secret = PairingSecret::generate();
        assert!(secret.matches(secret.as_str()));
        assert!(!secret.matches("ack"));
        assert!(!secret.matches(""));
    }

    #[test]
    fn secret_debug_does_not_leak() {
        let secret = PairingSecret::generate();
        let debug = format!("{secret:?}");
        assert!(!debug.contains(secret.as_str()));
    }

    #[test]
    fn generated_info_has_no_remote_signer() {
        let info = NostrRemoteSignerInfo::generate(Vec::new(), AppMetadata::default());
        assert!(info.remote_signer_pubkey.is_none());
    }

    #[test]
    fn with_remote_signer_populates_pubkey() {
        let info = NostrRemoteSignerInfo::generate(Vec::new(), AppMetadata::default());
        let signer = Keys::generate().public_key();

        let resolved = info.with_remote_signer(signer);
        assert_eq!(resolved.remote_signer_pubkey, Some(signer));
    }

    #[test]
    fn fresh_sessions_get_distinct_identities() {
        let a = NostrRemoteSignerInfo::generate(Vec::new(), AppMetadata::default());
        let b = NostrRemoteSignerInfo::generate(Vec::new(), AppMetadata::default());
        assert_ne!(a.client_pubkey(), b.client_pubkey());
    }
}
