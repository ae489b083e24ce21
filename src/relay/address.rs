//! Relay address normalization and validation.
//!
//! All relay endpoints flowing through the crate are normalized to a
//! canonical form before comparison, persistence, or connection: a
//! scheme-qualified host with no trailing slash. Addresses that cannot
//! be normalized are rejected at the boundary, never stored.

use nostr::RelayUrl;

/// A normalized relay endpoint identifier.
///
/// Guarantees upheld by construction:
///
/// - Starts with `ws://` or `wss://` (`wss://` is assumed when the input
///   carries no scheme)
/// - Never ends with `/`
/// - The host component is non-empty and parses as a relay URL
///
/// Normalization is idempotent: normalizing an already-normalized
/// address yields the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayAddress(String);

impl RelayAddress {
    /// Normalizes a raw address string into a canonical [`RelayAddress`].
    ///
    /// Returns `None` if the host component is empty or the result does
    /// not parse as a relay URL.
    ///
    /// # Example
    ///
    /// ```
    /// use lantern_core::relay::RelayAddress;
    ///
    /// let addr = RelayAddress::normalize(" relay.example.com/ ").unwrap();
    /// assert_eq!(addr.as_str(), "wss://relay.example.com");
    /// ```
    #[must_use]
    pub fn normalize(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }

        let with_scheme = if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
            trimmed.to_string()
        } else {
            format!("wss://{trimmed}")
        };

        let candidate = with_scheme
            .strip_suffix('/')
            .unwrap_or(&with_scheme)
            .to_string();

        // Reject anything whose authority is empty or unparsable.
        let host = host_component(&candidate)?;
        if host.is_empty() {
            return None;
        }
        RelayUrl::parse(&candidate).ok()?;

        Some(Self(candidate))
    }

    /// Returns the canonical address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the lowercased host component, without port or path.
    ///
    /// Used for blocklist matching, which operates on hostnames rather
    /// than full endpoints.
    #[must_use]
    pub fn host(&self) -> String {
        host_component(&self.0).unwrap_or_default().to_lowercase()
    }
}

impl std::fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RelayAddress> for String {
    fn from(addr: RelayAddress) -> Self {
        addr.0
    }
}

/// Extracts the host component from a scheme-qualified address.
///
/// Returns `None` if the string carries no recognized scheme.
fn host_component(address: &str) -> Option<&str> {
    let rest = address
        .strip_prefix("wss://")
        .or_else(|| address.strip_prefix("ws://"))?;
    let end = rest
        .find(|c| c == '/' || c == ':' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}
