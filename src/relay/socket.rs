//! Socket abstraction over a single relay connection.
//!
//! The manager and the pairing session never talk to a transport
//! directly; they drive [`RelaySocket`] trait objects produced by a
//! [`RelaySocketFactory`]. The production implementation,
//! [`SdkRelaySocket`], wraps one single-relay `nostr_sdk::Client` per
//! address. Tests inject mock sockets through the factory seam.
//!
//! # Health checking
//!
//! A socket may additionally implement [`HealthProbe`] to support
//! active zombie detection (a socket that reports connected but has
//! stopped delivering frames). The capability is surfaced through
//! [`RelaySocket::health_probe`]; sockets without it are treated as
//! always-healthy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_sdk::{Client, RelayPoolNotification, SubscriptionId};

use super::address::RelayAddress;
use super::error::{RelayError, RelayResult};
use super::types::SocketCounters;

/// How long a single connection attempt may take before it is treated
/// as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection phase reported by a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPhase {
    /// No connection.
    Disconnected,

    /// Connection attempt in progress.
    Connecting,

    /// Connection established.
    Connected,
}

/// An inbound protocol frame delivered by a relay.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// `["EVENT", <subscriptionId>, <event>]`
    Event {
        /// The subscription the event matched.
        subscription_id: String,
        /// The event itself.
        event: Box<Event>,
    },

    /// `["EOSE", <subscriptionId>]`
    EndOfStoredEvents {
        /// The subscription that finished its stored backlog.
        subscription_id: String,
    },

    /// `["NOTICE", <message>]`
    Notice {
        /// Human-readable relay message.
        message: String,
    },
}

/// Callback invoked for every inbound frame.
pub type MessageHandler = Arc<dyn Fn(&RelayAddress, IncomingMessage) + Send + Sync>;

/// Optional capability for active connection health checks.
///
/// Implementations return `false` when the connection should be treated
/// as dead even though it may still report itself connected.
pub trait HealthProbe: Send + Sync {
    /// Returns true if the connection is believed healthy.
    fn check_health(&self) -> bool;
}

/// A single duplex connection to one relay address.
///
/// # Subscription replay
///
/// `subscribe` registers the filter with the socket. Implementations
/// must replay every registered subscription after a (re)connect, so
/// that in-flight queries are not silently lost when the underlying
/// transport drops.
#[async_trait]
pub trait RelaySocket: Send + Sync {
    /// The address this socket is bound to.
    fn address(&self) -> &RelayAddress;

    /// Establishes the connection, replaying registered subscriptions
    /// once up.
    async fn connect(&self) -> RelayResult<()>;

    /// Tears the connection down. Never fails; transport errors during
    /// teardown are swallowed.
    async fn disconnect(&self);

    /// Live connection phase.
    async fn phase(&self) -> SocketPhase;

    /// True when the relay has validated an auth challenge on this
    /// connection.
    fn is_authenticated(&self) -> bool {
        false
    }

    /// Raw frame counters for diagnostics.
    fn counters(&self) -> SocketCounters;

    /// Installs the inbound frame handler, replacing any previous one.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Registers a subscription under `id` and sends it if connected.
    async fn subscribe(&self, id: &str, filter: Filter) -> RelayResult<()>;

    /// Removes a registered subscription and closes it if connected.
    async fn unsubscribe(&self, id: &str);

    /// Publishes a signed event.
    async fn publish(&self, event: Event) -> RelayResult<()>;

    /// Narrows to the active health-check capability, when supported.
    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        None
    }
}

/// Produces sockets for the manager and the pairing session.
///
/// Injected for testing; the default factory creates
/// [`SdkRelaySocket`]s.
pub trait RelaySocketFactory: Send + Sync {
    /// Creates an unconnected socket for the address.
    fn create(&self, address: &RelayAddress) -> Arc<dyn RelaySocket>;
}

/// Default factory producing [`SdkRelaySocket`]s.
#[derive(Debug, Default)]
pub struct SdkSocketFactory;

impl RelaySocketFactory for SdkSocketFactory {
    fn create(&self, address: &RelayAddress) -> Arc<dyn RelaySocket> {
        Arc::new(SdkRelaySocket::new(address.clone()))
    }
}

/// Production socket backed by a single-relay `nostr_sdk::Client`.
///
/// The client carries no signer; this crate only subscribes, receives,
/// and publishes externally signed events.
pub struct SdkRelaySocket {
    address: RelayAddress,
    client: Client,
    connecting: AtomicBool,
    subscriptions: Mutex<HashMap<String, Filter>>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    notifications_running: AtomicBool,
    closed: Arc<AtomicBool>,
    events_received: Arc<AtomicU64>,
    queries_sent: AtomicU64,
    errors: AtomicU64,
}

impl SdkRelaySocket {
    /// Creates an unconnected socket for the address.
    #[must_use]
    pub fn new(address: RelayAddress) -> Self {
        let client = Client::builder().build();
        Self {
            address,
            client,
            connecting: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            handler: Arc::new(Mutex::new(None)),
            notifications_running: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            events_received: Arc::new(AtomicU64::new(0)),
            queries_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    async fn is_transport_connected(&self) -> bool {
        let relays = self.client.relays().await;
        relays.values().any(nostr_sdk::Relay::is_connected)
    }

    /// Starts the notification forwarding task. Idempotent.
    fn spawn_notification_loop(&self) {
        if self.notifications_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = self.client.clone();
        let handler_slot = Arc::clone(&self.handler);
        let events_received = Arc::clone(&self.events_received);
        let closed = Arc::clone(&self.closed);
        let address = self.address.clone();

        tokio::spawn(async move {
            let _ = client
                .handle_notifications(|notification| async {
                    if closed.load(Ordering::SeqCst) {
                        return Ok(true);
                    }
                    if let RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    } = notification
                    {
                        events_received.fetch_add(1, Ordering::Relaxed);
                        let handler = handler_slot
                            .lock()
                            .map(|guard| guard.clone())
                            .unwrap_or_default();
                        if let Some(handler) = handler {
                            handler(
                                &address,
                                IncomingMessage::Event {
                                    subscription_id: subscription_id.to_string(),
                                    event,
                                },
                            );
                        }
                    }
                    Ok(false)
                })
                .await;
        });
    }

    /// Re-sends every registered subscription on the live connection.
    async fn replay_subscriptions(&self) {
        let pending: Vec<(String, Filter)> = {
            let guard = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .map(|(id, filter)| (id.clone(), filter.clone()))
                .collect()
        };
        for (id, filter) in pending {
            self.queries_sent.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self
                .client
                .subscribe_with_id(SubscriptionId::new(id.as_str()), filter, None)
                .await
            {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(relay = %self.address, subscription = %id, "resubscribe failed: {e}");
            }
        }
    }
}

#[async_trait]
impl RelaySocket for SdkRelaySocket {
    fn address(&self) -> &RelayAddress {
        &self.address
    }

    async fn connect(&self) -> RelayResult<()> {
        self.connecting.store(true, Ordering::SeqCst);

        let result = async {
            let _: Result<bool, _> = self.client.add_relay(self.address.as_str()).await;

            // connect() resolves without reporting per-relay outcomes;
            // verify connectivity explicitly afterwards.
            let _ = tokio::time::timeout(CONNECT_TIMEOUT, self.client.connect()).await;

            if self.is_transport_connected().await {
                Ok(())
            } else {
                Err(RelayError::Connection {
                    address: self.address.to_string(),
                    reason: "connection attempt timed out".to_string(),
                })
            }
        }
        .await;

        self.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.spawn_notification_loop();
                self.replay_subscriptions().await;
                Ok(())
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    async fn phase(&self) -> SocketPhase {
        if self.connecting.load(Ordering::SeqCst) {
            return SocketPhase::Connecting;
        }
        if self.is_transport_connected().await {
            SocketPhase::Connected
        } else {
            SocketPhase::Disconnected
        }
    }

    fn counters(&self) -> SocketCounters {
        SocketCounters {
            events_received: self.events_received.load(Ordering::Relaxed),
            queries_sent: self.queries_sent.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        let mut guard = self.handler.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(handler);
    }

    async fn subscribe(&self, id: &str, filter: Filter) -> RelayResult<()> {
        {
            let mut guard = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            guard.insert(id.to_string(), filter.clone());
        }

        if self.is_transport_connected().await {
            self.queries_sent.fetch_add(1, Ordering::Relaxed);
            self.client
                .subscribe_with_id(SubscriptionId::new(id), filter, None)
                .await
                .map_err(|e| {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    RelayError::Subscription(e.to_string())
                })?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, id: &str) {
        {
            let mut guard = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(id);
        }
        self.client.unsubscribe(&SubscriptionId::new(id)).await;
    }

    async fn publish(&self, event: Event) -> RelayResult<()> {
        self.queries_sent.fetch_add(1, Ordering::Relaxed);
        let output = self.client.send_event(&event).await.map_err(|e| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            RelayError::Publish(e.to_string())
        })?;

        if output.success.is_empty() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            let reason = output
                .failed
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| "relay did not accept the event".to_string());
            return Err(RelayError::Publish(reason));
        }
        Ok(())
    }
}

impl Drop for SdkRelaySocket {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
