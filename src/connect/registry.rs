//! Completed-pairing registry.
//!
//! A signer reply can arrive for a pairing that already finished: a
//! duplicate delivery from a second relay, or a zombie session left
//! over from before a process restart. The registry records completed
//! pairing identifiers so such replies are ignored instead of resolving
//! a stale session.
//!
//! The registry is injected through
//! [`SessionOptions`](super::SessionOptions) and its lifecycle belongs
//! to whoever constructs sessions; nothing here is process-global.

use std::collections::HashSet;
use std::sync::Mutex;

/// Records pairing identifiers (ephemeral client public keys) whose
/// handshake already completed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    completed: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a pairing as completed.
    pub fn mark_completed(&self, pairing_id: &str) {
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pairing_id.to_string());
    }

    /// True if the pairing already completed.
    #[must_use]
    pub fn is_completed(&self, pairing_id: &str) -> bool {
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(pairing_id)
    }
}
