//! Remote-signer pairing session.
//!
//! A short-lived state machine driving the `nostrconnect` handshake:
//! generate an ephemeral identity, publish a pairing URI out-of-band
//! (typically a QR code), listen in parallel across the configured
//! relays for an encrypted reply from the signer device, validate it
//! against the shared secret, and resolve to a durable signer
//! descriptor.
//!
//! Sessions are single-use: every terminal state
//! ([`PairingSessionState::is_terminal`]) is final, and a new pairing
//! means a new session object. The session owns its own small socket
//! set; on handshake completion the sockets are torn down and ongoing
//! signer communication belongs to whatever the caller constructs from
//! the resulting descriptor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::nips::nip44;
use nostr::{Filter, Kind, PublicKey, Timestamp};
use serde::Deserialize;
use tokio::sync::{oneshot, watch};

use super::error::{ConnectError, ConnectResult};
use super::registry::SessionRegistry;
use super::types::{
    AppMetadata, NostrConnectResult, NostrRemoteSignerInfo, PairingSessionState, SessionOptions,
};
use super::uri::encode_pairing_uri;
use crate::relay::{
    IncomingMessage, MessageHandler, RelayAddress, RelaySocket, RelaySocketFactory,
    SdkSocketFactory, SocketPhase,
};

/// Subscription identifier installed on every session socket.
const SUBSCRIPTION_ID: &str = "pairing";

/// Backward-looking window applied to the subscription's `since`
/// timestamp, so a reply published moments before the subscription is
/// installed is still delivered.
const SINCE_LOOKBACK: Duration = Duration::from_secs(30);

/// Result literals accepted as handshake acknowledgement besides the
/// shared secret itself.
const ACK_LITERALS: &[&str] = &["ack"];

/// Decrypted handshake reply payload.
#[derive(Debug, Deserialize)]
struct SignerResponse {
    #[serde(default)]
    id: String,
    result: Option<String>,
    error: Option<String>,
}

/// A single pairing attempt against a remote signer.
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
/// use lantern_core::connect::{AppMetadata, NostrConnectSession, SessionOptions};
///
/// let session = NostrConnectSession::new(
///     &["wss://relay.example.com".to_string()],
///     AppMetadata { name: Some("Lantern".into()), ..AppMetadata::default() },
///     SessionOptions::default(),
/// )?;
/// session.start().await?;
///
/// // Render session.pairing_uri() as a QR code for the signer.
/// match session.wait_for_connection(Duration::from_secs(120)).await? {
///     Some(result) => println!("paired with {}", result.remote_signer_pubkey),
///     None => println!("pairing timed out"),
/// }
/// ```
pub struct NostrConnectSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    relays: Vec<RelayAddress>,
    metadata: AppMetadata,
    strict_secret: bool,
    registry: Option<Arc<SessionRegistry>>,
    factory: Arc<dyn RelaySocketFactory>,
    started: AtomicBool,
    disposed: AtomicBool,
    info: Mutex<Option<NostrRemoteSignerInfo>>,
    pairing_uri: Mutex<Option<String>>,
    // Pinned at the first subscription install and reused verbatim for
    // every relay and resubscription, so a reconnect cannot narrow the
    // window and miss a reply published while a socket was down.
    since: Mutex<Option<Timestamp>>,
    sockets: Mutex<HashMap<String, Arc<dyn RelaySocket>>>,
    completion_tx: Mutex<Option<oneshot::Sender<Option<NostrConnectResult>>>>,
    completion_rx: Mutex<Option<oneshot::Receiver<Option<NostrConnectResult>>>>,
    state_tx: Mutex<Option<watch::Sender<PairingSessionState>>>,
    state_rx: watch::Receiver<PairingSessionState>,
    ensure_lock: tokio::sync::Mutex<()>,
    // Set once right after construction; holds a Weak back-reference
    // so sockets never keep the session alive.
    handler: Mutex<Option<MessageHandler>>,
}

impl NostrConnectSession {
    /// Creates an idle session over the given relay addresses.
    ///
    /// Invalid addresses are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::NoRelaysConfigured`] when no address
    /// survives normalization.
    pub fn new(
        relays: &[String],
        metadata: AppMetadata,
        options: SessionOptions,
    ) -> ConnectResult<Self> {
        let mut normalized: Vec<RelayAddress> = Vec::new();
        for raw in relays {
            match RelayAddress::normalize(raw) {
                Some(address) => {
                    if !normalized.contains(&address) {
                        normalized.push(address);
                    }
                }
                None => tracing::warn!(relay = %raw, "skipping invalid pairing relay"),
            }
        }
        if normalized.is_empty() {
            return Err(ConnectError::NoRelaysConfigured);
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(PairingSessionState::Idle);

        let inner = Arc::new(SessionInner {
            relays: normalized,
            metadata,
            strict_secret: options.strict_secret,
            registry: options.registry,
            factory: options
                .socket_factory
                .unwrap_or_else(|| Arc::new(SdkSocketFactory)),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            info: Mutex::new(None),
            pairing_uri: Mutex::new(None),
            since: Mutex::new(None),
            sockets: Mutex::new(HashMap::new()),
            completion_tx: Mutex::new(Some(completion_tx)),
            completion_rx: Mutex::new(Some(completion_rx)),
            state_tx: Mutex::new(Some(state_tx)),
            state_rx,
            ensure_lock: tokio::sync::Mutex::new(()),
            handler: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handler: MessageHandler = Arc::new(move |relay, message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(relay, message);
            }
        });
        *inner.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);

        Ok(Self { inner })
    }

    /// Generates the ephemeral identity and pairing URI, then connects
    /// to every relay in parallel.
    ///
    /// The session moves to `Listening` once at least one relay is
    /// connected with the subscription installed. A failure on a
    /// single relay is logged and excluded.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::AlreadyStarted`] on a second call
    /// (sessions are single-use) and [`ConnectError::NoRelayReachable`]
    /// when every relay fails, which also moves the session to `Error`.
    pub async fn start(&self) -> ConnectResult<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::AlreadyStarted);
        }
        inner.set_state(PairingSessionState::Generating);

        let info = NostrRemoteSignerInfo::generate(inner.relays.clone(), inner.metadata.clone());
        let uri = encode_pairing_uri(&info);
        *inner.pairing_uri.lock().unwrap_or_else(|e| e.into_inner()) = Some(uri);
        *inner.info.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());

        let since = Timestamp::now() - SINCE_LOOKBACK;
        *inner.since.lock().unwrap_or_else(|e| e.into_inner()) = Some(since);

        let connected = inner.connect_all(since, info.client_pubkey()).await;
        if connected == 0 {
            inner.set_state(PairingSessionState::Error);
            return Err(ConnectError::NoRelayReachable(format!(
                "all {} pairing relays failed to connect",
                inner.relays.len()
            )));
        }

        inner.set_state(PairingSessionState::Listening);
        Ok(())
    }

    /// Waits for the handshake to resolve, up to `timeout`.
    ///
    /// Resolves with `None` on timeout (the session moves to
    /// `Timeout`), cancellation, or a protocol error; never with an
    /// error of its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::InvalidState`] when the session is not
    /// `Listening` or a wait is already outstanding.
    pub async fn wait_for_connection(
        &self,
        timeout: Duration,
    ) -> ConnectResult<Option<NostrConnectResult>> {
        let inner = &self.inner;
        if inner.state() != PairingSessionState::Listening {
            return Err(ConnectError::InvalidState(
                "wait_for_connection requires a listening session".to_string(),
            ));
        }
        let mut rx = inner
            .completion_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                ConnectError::InvalidState("a wait is already outstanding".to_string())
            })?;

        tokio::select! {
            received = &mut rx => Ok(received.unwrap_or(None)),
            () = tokio::time::sleep(timeout) => {
                if let Some(tx) = inner.take_completion() {
                    drop(tx);
                    inner.set_state(PairingSessionState::Timeout);
                    inner.teardown_sockets();
                    Ok(None)
                } else {
                    // A resolution raced the timer; collect it.
                    Ok(rx.await.unwrap_or(None))
                }
            }
        }
    }

    /// Reconnects anything that silently dropped while the app was
    /// backgrounded.
    ///
    /// For each relay not fully connected, the subscription filter is
    /// re-registered (never assumed to have survived the transport)
    /// and reconnection attempted; a socket set that was lost entirely
    /// is rebuilt from the original address list. Safe to call
    /// repeatedly and concurrently with itself.
    pub async fn ensure_connected(&self) {
        let inner = &self.inner;
        if inner.state() != PairingSessionState::Listening {
            return;
        }
        let _guard = inner.ensure_lock.lock().await;
        if inner.state() != PairingSessionState::Listening {
            return;
        }

        let Some((client_pubkey, since)) = inner.subscription_params() else {
            return;
        };
        let filter = pairing_filter(client_pubkey, since);

        let sockets: Vec<Arc<dyn RelaySocket>> = inner
            .relays
            .iter()
            .map(|address| inner.socket_for(address))
            .collect();

        futures::future::join_all(sockets.iter().map(|socket| {
            let filter = filter.clone();
            async move {
                if socket.phase().await == SocketPhase::Connected {
                    return;
                }
                if let Err(e) = socket.subscribe(SUBSCRIPTION_ID, filter).await {
                    tracing::debug!(relay = %socket.address(), "pairing resubscribe failed: {e}");
                }
                if let Err(e) = socket.connect().await {
                    tracing::warn!(relay = %socket.address(), "pairing reconnect failed: {e}");
                }
            }
        }))
        .await;
    }

    /// Cancels the session. Idempotent: repeated calls after the first
    /// are no-ops.
    ///
    /// Transitions to `Cancelled` synchronously and resolves any
    /// outstanding wait with `None`; socket teardown is fire-and-forget.
    pub fn cancel(&self) {
        let inner = &self.inner;
        if inner.state().is_terminal() {
            return;
        }
        if let Some(tx) = inner.take_completion() {
            let _ = tx.send(None);
        }
        inner.set_state(PairingSessionState::Cancelled);
        inner.teardown_sockets();
    }

    /// Tears the session down and closes its state stream.
    ///
    /// Safe to call even if the session was never started.
    pub fn dispose(&self) {
        let inner = &self.inner;
        inner.disposed.store(true, Ordering::SeqCst);
        inner.take_completion();
        inner.teardown_sockets();
        inner
            .state_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> PairingSessionState {
        self.inner.state()
    }

    /// Stream of state changes. The stream closes on
    /// [`dispose`](Self::dispose).
    #[must_use]
    pub fn state_stream(&self) -> watch::Receiver<PairingSessionState> {
        self.inner.state_rx.clone()
    }

    /// The pairing URI to hand to the signer device. Available once
    /// the session has started.
    #[must_use]
    pub fn pairing_uri(&self) -> Option<String> {
        self.inner
            .pairing_uri
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The session descriptor. Available once the session has started;
    /// carries the remote signer's key after a successful handshake.
    #[must_use]
    pub fn info(&self) -> Option<NostrRemoteSignerInfo> {
        self.inner
            .info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SessionInner {
    fn state(&self) -> PairingSessionState {
        *self.state_rx.borrow()
    }

    /// Applies a state transition unless the session is already in a
    /// terminal state or the stream was closed by disposal.
    fn set_state(&self, next: PairingSessionState) {
        let guard = self.state_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.borrow().is_terminal() {
                return;
            }
            tx.send_replace(next);
        }
    }

    fn take_completion(&self) -> Option<oneshot::Sender<Option<NostrConnectResult>>> {
        self.completion_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn subscription_params(&self) -> Option<(PublicKey, Timestamp)> {
        let info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        let since = self.since.lock().unwrap_or_else(|e| e.into_inner());
        Some((info.as_ref()?.client_pubkey(), (*since)?))
    }

    /// Returns the registered socket for the address, creating and
    /// wiring one when absent.
    fn socket_for(&self, address: &RelayAddress) -> Arc<dyn RelaySocket> {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(socket) = sockets.get(address.as_str()) {
            return Arc::clone(socket);
        }
        let socket = self.factory.create(address);
        if let Some(handler) = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            socket.set_message_handler(handler);
        }
        sockets.insert(address.as_str().to_string(), Arc::clone(&socket));
        socket
    }

    /// Connects every relay concurrently, installing the subscription
    /// as part of each socket's connect sequence so the filter is
    /// always present before traffic is expected. Returns the number
    /// of sockets that came up.
    async fn connect_all(&self, since: Timestamp, client_pubkey: PublicKey) -> usize {
        let filter = pairing_filter(client_pubkey, since);

        let sockets: Vec<Arc<dyn RelaySocket>> = self
            .relays
            .iter()
            .map(|address| self.socket_for(address))
            .collect();

        let outcomes = futures::future::join_all(sockets.iter().map(|socket| {
            let filter = filter.clone();
            async move {
                if let Err(e) = socket.connect().await {
                    tracing::warn!(relay = %socket.address(), "pairing relay failed to connect: {e}");
                    return false;
                }
                if let Err(e) = socket.subscribe(SUBSCRIPTION_ID, filter).await {
                    tracing::warn!(relay = %socket.address(), "pairing subscription failed: {e}");
                    return false;
                }
                true
            }
        }))
        .await;

        outcomes.into_iter().filter(|ok| *ok).count()
    }

    /// Inbound frame handler. Contains every decode and validation
    /// failure; the only externally observable outcomes are the
    /// session's terminal states.
    fn handle_message(&self, relay: &RelayAddress, message: IncomingMessage) {
        if self.disposed.load(Ordering::SeqCst) || self.state().is_terminal() {
            return;
        }

        let event = match message {
            IncomingMessage::Event { event, .. } => event,
            IncomingMessage::EndOfStoredEvents { .. } => return,
            IncomingMessage::Notice { message } => {
                tracing::debug!(relay = %relay, "relay notice: {message}");
                return;
            }
        };
        if event.kind != Kind::NostrConnect {
            return;
        }

        let Some(info) = self
            .info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            return;
        };

        // An unrelated or malformed event can legitimately arrive on
        // the same filter; drop it and keep listening.
        let plaintext = match nip44::decrypt(
            info.client_keys().secret_key(),
            &event.pubkey,
            &event.content,
        ) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::debug!(relay = %relay, "dropping undecryptable pairing reply: {e}");
                return;
            }
        };
        let response: SignerResponse = match serde_json::from_str(&plaintext) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(relay = %relay, "dropping malformed pairing reply: {e}");
                return;
            }
        };

        // A client-initiated pairing should not normally see an
        // auth_url challenge; keep waiting rather than failing.
        if response.result.as_deref() == Some("auth_url") {
            tracing::warn!(relay = %relay, "signer requested out-of-band approval, still waiting");
            return;
        }

        if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            tracing::warn!(relay = %relay, "signer rejected pairing: {error}");
            if let Some(tx) = self.take_completion() {
                let _ = tx.send(None);
            }
            self.set_state(PairingSessionState::Error);
            self.teardown_sockets();
            return;
        }

        let result_value = response.result.unwrap_or_default();
        let exact_match =
            info.secret().matches(&result_value) || ACK_LITERALS.contains(&result_value.as_str());
        if !exact_match {
            if self.strict_secret {
                tracing::warn!(
                    relay = %relay,
                    request_id = %response.id,
                    "rejecting handshake reply with unexpected result"
                );
                return;
            }
            // Signer implementations respond inconsistently; accept any
            // decryptable non-error reply, but leave a trace.
            tracing::warn!(
                relay = %relay,
                request_id = %response.id,
                "accepting handshake reply with inexact acknowledgement"
            );
        }

        let pairing_id = info.client_pubkey().to_hex();
        if let Some(registry) = &self.registry {
            if registry.is_completed(&pairing_id) {
                tracing::warn!(relay = %relay, "ignoring reply for already-completed pairing");
                return;
            }
        }

        // Exactly-once resolution: whoever takes the sender wins; a
        // duplicate copy of the reply from a second relay is a no-op.
        let Some(tx) = self.take_completion() else {
            return;
        };

        let resolved = {
            let mut guard = self.info.lock().unwrap_or_else(|e| e.into_inner());
            let updated = guard
                .take()
                .unwrap_or(info)
                .with_remote_signer(event.pubkey);
            *guard = Some(updated.clone());
            updated
        };
        if let Some(registry) = &self.registry {
            registry.mark_completed(&pairing_id);
        }

        self.set_state(PairingSessionState::Connected);
        let _ = tx.send(Some(NostrConnectResult {
            remote_signer_pubkey: event.pubkey,
            user_pubkey: None,
            info: resolved,
        }));
        self.teardown_sockets();
    }

    /// Fire-and-forget socket teardown; disconnect errors are
    /// swallowed.
    fn teardown_sockets(&self) {
        let sockets: Vec<Arc<dyn RelaySocket>> = {
            let mut guard = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain().map(|(_, socket)| socket).collect()
        };
        if sockets.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for socket in sockets {
                socket.disconnect().await;
            }
        });
    }
}

fn pairing_filter(client_pubkey: PublicKey, since: Timestamp) -> Filter {
    Filter::new()
        .kind(Kind::NostrConnect)
        .pubkey(client_pubkey)
        .since(since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSocketFactory;

    fn options_with(factory: Arc<MockSocketFactory>) -> SessionOptions {
        SessionOptions {
            socket_factory: Some(factory),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn new_rejects_empty_relay_list() {
        let result =
            NostrConnectSession::new(&[], AppMetadata::default(), SessionOptions::default());
        assert!(matches!(result, Err(ConnectError::NoRelaysConfigured)));
    }

    #[test]
    fn new_rejects_all_invalid_relays() {
        let relays = vec!["wss://".to_string(), "   ".to_string()];
        let result =
            NostrConnectSession::new(&relays, AppMetadata::default(), SessionOptions::default());
        assert!(matches!(result, Err(ConnectError::NoRelaysConfigured)));
    }

    #[test]
    fn session_starts_idle_without_uri() {
        let relays = vec!["wss://relay.example.com".to_string()];
        let session =
            NostrConnectSession::new(&relays, AppMetadata::default(), SessionOptions::default())
                .unwrap();

        assert_eq!(session.state(), PairingSessionState::Idle);
        assert!(session.pairing_uri().is_none());
        assert!(session.info().is_none());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let factory = Arc::new(MockSocketFactory::new());
        let relays = vec!["wss://relay.example.com".to_string()];
        let session =
            NostrConnectSession::new(&relays, AppMetadata::default(), options_with(factory))
                .unwrap();

        session.start().await.unwrap();
        assert!(matches!(
            session.start().await,
            Err(ConnectError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn start_generates_uri_and_listens() {
        let factory = Arc::new(MockSocketFactory::new());
        let relays = vec!["wss://relay.example.com".to_string()];
        let session =
            NostrConnectSession::new(&relays, AppMetadata::default(), options_with(factory))
                .unwrap();

        session.start().await.unwrap();

        assert_eq!(session.state(), PairingSessionState::Listening);
        let uri = session.pairing_uri().unwrap();
        assert!(uri.starts_with("nostrconnect://"));
        assert!(uri.contains("secret="));
    }

    #[tokio::test]
    async fn start_fails_into_error_when_all_relays_fail() {
        let factory = Arc::new(MockSocketFactory::new());
        factory.fail_address("wss://relay.example.com");
        let relays = vec!["wss://relay.example.com".to_string()];
        let session = NostrConnectSession::new(
            &relays,
            AppMetadata::default(),
            options_with(Arc::clone(&factory)),
        )
        .unwrap();

        assert!(matches!(
            session.start().await,
            Err(ConnectError::NoRelayReachable(_))
        ));
        assert_eq!(session.state(), PairingSessionState::Error);
    }

    #[tokio::test]
    async fn wait_requires_listening_state() {
        let relays = vec!["wss://relay.example.com".to_string()];
        let session =
            NostrConnectSession::new(&relays, AppMetadata::default(), SessionOptions::default())
                .unwrap();

        assert!(matches!(
            session.wait_for_connection(Duration::ZERO).await,
            Err(ConnectError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let factory = Arc::new(MockSocketFactory::new());
        let relays = vec!["wss://relay.example.com".to_string()];
        let session =
            NostrConnectSession::new(&relays, AppMetadata::default(), options_with(factory))
                .unwrap();
        session.start().await.unwrap();

        session.cancel();
        session.cancel();
        assert_eq!(session.state(), PairingSessionState::Cancelled);
    }

    #[tokio::test]
    async fn dispose_before_start_is_safe() {
        let relays = vec!["wss://relay.example.com".to_string()];
        let session =
            NostrConnectSession::new(&relays, AppMetadata::default(), SessionOptions::default())
                .unwrap();
        session.dispose();
        assert_eq!(session.state(), PairingSessionState::Idle);
    }

    #[tokio::test]
    async fn dispose_closes_state_stream() {
        let factory = Arc::new(MockSocketFactory::new());
        let relays = vec!["wss://relay.example.com".to_string()];
        let session =
            NostrConnectSession::new(&relays, AppMetadata::default(), options_with(factory))
                .unwrap();
        session.start().await.unwrap();

        let mut stream = session.state_stream();
        session.dispose();
        assert!(stream.changed().await.is_err());
    }
}
