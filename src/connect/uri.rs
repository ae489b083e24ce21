//! `nostrconnect://` pairing URI encoding.
//!
//! The URI is the out-of-band handoff to the signer device (typically
//! rendered as a QR code): scheme + ephemeral client public key, with
//! the relay list, the shared secret, and optional app metadata in the
//! query string. Third-party signer apps parse this exact shape, so
//! the encoding must stay stable.

use nostr::PublicKey;

use super::error::{ConnectError, ConnectResult};
use super::types::{AppMetadata, NostrRemoteSignerInfo};
use crate::relay::RelayAddress;

/// URI scheme of the pairing protocol.
pub const PAIRING_URI_SCHEME: &str = "nostrconnect";

/// Builds the pairing URI for a session descriptor.
///
/// Every query value is percent-encoded. Relay parameters repeat, one
/// per address, in descriptor order.
#[must_use]
pub fn encode_pairing_uri(info: &NostrRemoteSignerInfo) -> String {
    let mut uri = format!("{PAIRING_URI_SCHEME}://{}", info.client_pubkey().to_hex());

    let mut push = {
        let mut first = true;
        move |uri: &mut String, key: &str, value: &str| {
            let sep = if first { '?' } else { '&' };
            first = false;
            uri.push(sep);
            uri.push_str(key);
            uri.push('=');
            uri.push_str(&urlencoding::encode(value));
        }
    };

    for relay in &info.relays {
        push(&mut uri, "relay", relay.as_str());
    }
    push(&mut uri, "secret", info.secret().as_str());

    let metadata = &info.metadata;
    if let Some(name) = &metadata.name {
        push(&mut uri, "name", name);
    }
    if let Some(url) = &metadata.url {
        push(&mut uri, "url", url);
    }
    if let Some(icon) = &metadata.icon {
        push(&mut uri, "image", icon);
    }
    if let Some(permissions) = &metadata.permissions {
        push(&mut uri, "perms", permissions);
    }
    if let Some(callback) = &metadata.callback_url {
        push(&mut uri, "callback", callback);
    }

    uri
}

/// A parsed pairing URI.
///
/// Used by tests and signer-side tooling; the client only encodes.
#[derive(Debug, Clone)]
pub struct PairingUri {
    /// The ephemeral client public key from the authority component.
    pub client_pubkey: PublicKey,

    /// Relay addresses, in URI order.
    pub relays: Vec<RelayAddress>,

    /// The shared secret.
    pub secret: String,

    /// Optional app metadata carried in the query string.
    pub metadata: AppMetadata,
}

impl PairingUri {
    /// Parses a `nostrconnect://` URI.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::InvalidUri`] for a wrong scheme, a
    /// malformed public key, a missing secret, or an empty relay list.
    pub fn parse(uri: &str) -> ConnectResult<Self> {
        let rest = uri
            .strip_prefix(PAIRING_URI_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| {
                ConnectError::InvalidUri(format!("must start with {PAIRING_URI_SCHEME}://"))
            })?;

        let (pubkey_part, query) = rest
            .split_once('?')
            .ok_or_else(|| ConnectError::InvalidUri("missing query parameters".to_string()))?;

        if pubkey_part.len() != 64 || !pubkey_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConnectError::InvalidUri(
                "client public key must be 64 hex characters".to_string(),
            ));
        }
        let client_pubkey = PublicKey::from_hex(pubkey_part)
            .map_err(|e| ConnectError::InvalidUri(format!("invalid client public key: {e}")))?;

        let mut relays = Vec::new();
        let mut secret = None;
        let mut metadata = AppMetadata::default();

        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = urlencoding::decode(value)
                .map_err(|e| ConnectError::InvalidUri(format!("bad percent-encoding: {e}")))?
                .into_owned();
            match key {
                "relay" => {
                    if let Some(address) = RelayAddress::normalize(&value) {
                        relays.push(address);
                    }
                }
                "secret" => secret = Some(value),
                "name" => metadata.name = Some(value),
                "url" => metadata.url = Some(value),
                "image" => metadata.icon = Some(value),
                "perms" => metadata.permissions = Some(value),
                "callback" => metadata.callback_url = Some(value),
                _ => {}
            }
        }

        if relays.is_empty() {
            return Err(ConnectError::InvalidUri(
                "no relay specified".to_string(),
            ));
        }
        let secret =
            secret.ok_or_else(|| ConnectError::InvalidUri("secret is required".to_string()))?;

        Ok(Self {
            client_pubkey,
            relays,
            secret,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(metadata: AppMetadata) -> NostrRemoteSignerInfo {
        let relays = vec![
            RelayAddress::normalize("wss://relay.example.com").unwrap(),
            RelayAddress::normalize("wss://relay.other.com").unwrap(),
        ];
        NostrRemoteSignerInfo::generate(relays, metadata)
    }

    #[test]
    fn encodes_scheme_and_pubkey() {
        let info = info_with(AppMetadata::default());
        let uri = encode_pairing_uri(&info);

        assert!(uri.starts_with("nostrconnect://"));
        assert!(uri.contains(&info.client_pubkey().to_hex()));
    }

    #[test]
    fn encodes_one_relay_param_per_address() {
        let info = info_with(AppMetadata::default());
        let uri = encode_pairing_uri(&info);

        assert_eq!(uri.matches("relay=").count(), 2);
        assert!(uri.contains("relay=wss%3A%2F%2Frelay.example.com"));
    }

    #[test]
    fn encodes_secret() {
        let info = info_with(AppMetadata::default());
        let uri = encode_pairing_uri(&info);
        assert!(uri.contains(&format!("secret={}", info.secret().as_str())));
    }

    #[test]
    fn omits_absent_metadata() {
        let info = info_with(AppMetadata::default());
        let uri = encode_pairing_uri(&info);

        assert!(!uri.contains("name="));
        assert!(!uri.contains("image="));
        assert!(!uri.contains("perms="));
        assert!(!uri.contains("callback="));
    }

    #[test]
    fn percent_encodes_metadata_values() {
        let metadata = AppMetadata {
            name: Some("Lantern Desktop & Mobile".to_string()),
            url: Some("https://lantern.example".to_string()),
            ..AppMetadata::default()
        };
        let uri = encode_pairing_uri(&info_with(metadata));

        assert!(uri.contains("name=Lantern%20Desktop%20%26%20Mobile"));
        assert!(!uri.contains("Desktop & Mobile"));
    }

    #[test]
    fn roundtrip_through_parser() {
        let metadata = AppMetadata {
            name: Some("Lantern".to_string()),
            url: Some("https://lantern.example".to_string()),
            icon: Some("https://lantern.example/icon.png".to_string()),
            permissions: Some("sign_event:1".to_string()),
            callback_url: Some("lantern://paired".to_string()),
        };
        let info = info_with(metadata);
        let uri = encode_pairing_uri(&info);

        let parsed = PairingUri::parse(&uri).unwrap();
        assert_eq!(parsed.client_pubkey, info.client_pubkey());
        assert_eq!(parsed.relays, info.relays);
        assert_eq!(parsed.secret, info.secret().as_str());
        assert_eq!(parsed.metadata.name.as_deref(), Some("Lantern"));
        assert_eq!(parsed.metadata.permissions.as_deref(), Some("sign_event:1"));
        assert_eq!(parsed.metadata.callback_url.as_deref(), Some("lantern://paired"));
    }

    #[test]
    fn parse_rejects_wrong_scheme() {
        let result = PairingUri::parse("bunker://abcd?relay=wss%3A%2F%2Fr.example&secret=s");
        assert!(matches!(result, Err(ConnectError::InvalidUri(_))));
    }

    #[test]
    fn parse_rejects_short_pubkey() {
        let result = PairingUri::parse("nostrconnect://abcd?relay=wss%3A%2F%2Fr.example&secret=s");
        assert!(matches!(result, Err(ConnectError::InvalidUri(_))));
    }

    #[test]
    fn parse_rejects_missing_secret() {
        let info = info_with(AppMetadata::default());
        let uri = format!(
            "nostrconnect://{}?relay=wss%3A%2F%2Fr.example",
            info.client_pubkey().to_hex()
        );
        assert!(matches!(
            PairingUri::parse(&uri),
            Err(ConnectError::InvalidUri(_))
        ));
    }

    #[test]
    fn parse_rejects_empty_relay_list() {
        let info = info_with(AppMetadata::default());
        let uri = format!(
            "nostrconnect://{}?secret=abc",
            info.client_pubkey().to_hex()
        );
        assert!(matches!(
            PairingUri::parse(&uri),
            Err(ConnectError::InvalidUri(_))
        ));
    }
}
