//! Reusable test helpers for pairing and relay manager integration
//! tests.
//!
//! These helpers play the signer device's side of the handshake with
//! real NIP-44 encryption, so the session under test exercises its
//! actual decrypt/validate path. Relay transport is mocked through the
//! socket factory seam.

use std::sync::Arc;

use nostr::nips::nip44;
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Tag};

use lantern_core::connect::{
    AppMetadata, NostrConnectSession, SessionOptions, SessionRegistry,
};
use lantern_core::testing::MockSocketFactory;

/// Default relay address used across tests.
pub const RELAY_ONE: &str = "wss://relay.one.example";

/// Second relay address for fan-out scenarios.
pub const RELAY_TWO: &str = "wss://relay.two.example";

/// A started pairing session together with its mocked transport.
pub struct PairingFixture {
    pub session: NostrConnectSession,
    pub factory: Arc<MockSocketFactory>,
    pub signer_keys: Keys,
}

impl PairingFixture {
    /// Starts a session over the given relays with default (lenient)
    /// options.
    pub async fn start(relays: &[&str]) -> Self {
        Self::start_with(relays, false, None).await
    }

    /// Starts a session with explicit strictness and registry.
    pub async fn start_with(
        relays: &[&str],
        strict_secret: bool,
        registry: Option<Arc<SessionRegistry>>,
    ) -> Self {
        let factory = Arc::new(MockSocketFactory::new());
        let options = SessionOptions {
            strict_secret,
            registry,
            socket_factory: Some(factory.clone()),
        };
        let relays: Vec<String> = relays.iter().map(ToString::to_string).collect();
        let session = NostrConnectSession::new(
            &relays,
            AppMetadata {
                name: Some("Lantern".to_string()),
                ..AppMetadata::default()
            },
            options,
        )
        .expect("session should construct");
        session.start().await.expect("session should start");

        Self {
            session,
            factory,
            signer_keys: Keys::generate(),
        }
    }

    /// The session's ephemeral client public key.
    pub fn client_pubkey(&self) -> PublicKey {
        self.session
            .info()
            .expect("started session has a descriptor")
            .client_pubkey()
    }

    /// The shared secret embedded in the pairing URI.
    pub fn secret(&self) -> String {
        self.session
            .info()
            .expect("started session has a descriptor")
            .secret()
            .as_str()
            .to_string()
    }

    /// Delivers a signer reply with the given `result` value on the
    /// named relay.
    pub fn deliver_result(&self, relay: &str, result: &str) {
        let event = pairing_reply(&self.signer_keys, &self.client_pubkey(), result, None);
        self.deliver(relay, event);
    }

    /// Delivers a signer reply carrying a protocol error.
    pub fn deliver_error(&self, relay: &str, error: &str) {
        let event = pairing_reply(&self.signer_keys, &self.client_pubkey(), "", Some(error));
        self.deliver(relay, event);
    }

    /// Delivers an arbitrary event on the named relay's pairing
    /// subscription.
    pub fn deliver(&self, relay: &str, event: Event) {
        self.factory
            .socket_for(relay)
            .expect("socket should exist for relay")
            .deliver_event("pairing", event);
    }
}

/// Builds a signed, NIP-44 encrypted handshake reply from the signer
/// to the session's ephemeral key, exactly as a signer device would
/// publish it.
pub fn pairing_reply(
    signer_keys: &Keys,
    client_pubkey: &PublicKey,
    result: &str,
    error: Option<&str>,
) -> Event {
    let payload = match error {
        Some(error) => serde_json::json!({ "id": "1", "error": error }),
        None => serde_json::json!({ "id": "1", "result": result }),
    };
    let encrypted = nip44::encrypt(
        signer_keys.secret_key(),
        client_pubkey,
        payload.to_string(),
        nip44::Version::V2,
    )
    .expect("should encrypt reply");

    EventBuilder::new(Kind::NostrConnect, encrypted)
        .tag(Tag::public_key(*client_pubkey))
        .sign_with_keys(signer_keys)
        .expect("should sign reply event")
}
