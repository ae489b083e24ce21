//! Test utilities: mock sockets, a scriptable socket factory, and
//! in-memory relay list storage.
//!
//! Everything in this module is for tests only. It is compiled into
//! unit tests and, via the `test-utils` feature, into integration
//! tests. DO NOT use in production.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nostr::{Event, Filter};

use crate::relay::{
    HealthProbe, IncomingMessage, MessageHandler, RelayAddress, RelayError, RelayListStorage,
    RelayResult, RelaySocket, RelaySocketFactory, SocketCounters, SocketPhase,
};

/// Scriptable in-memory socket.
///
/// Connect outcomes, health, authentication, and inbound frames are all
/// controlled by the test.
pub struct MockRelaySocket {
    address: RelayAddress,
    phase: Mutex<SocketPhase>,
    fail_connect: AtomicBool,
    authenticated: AtomicBool,
    healthy: AtomicBool,
    supports_health_probe: bool,
    subscriptions: Mutex<HashMap<String, Filter>>,
    handler: Mutex<Option<MessageHandler>>,
    connect_calls: AtomicU64,
    subscribe_calls: AtomicU64,
    events_received: AtomicU64,
    queries_sent: AtomicU64,
    errors: AtomicU64,
}

impl MockRelaySocket {
    /// Creates a healthy socket whose connect attempts succeed.
    #[must_use]
    pub fn new(address: RelayAddress) -> Self {
        Self {
            address,
            phase: Mutex::new(SocketPhase::Disconnected),
            fail_connect: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            supports_health_probe: true,
            subscriptions: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            connect_calls: AtomicU64::new(0),
            subscribe_calls: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            queries_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Creates a socket without the [`HealthProbe`] capability.
    #[must_use]
    pub fn without_health_probe(address: RelayAddress) -> Self {
        Self {
            supports_health_probe: false,
            ..Self::new(address)
        }
    }

    /// Makes subsequent connect attempts fail (or succeed again).
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Scripts the health probe result.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Scripts the authenticated flag.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Overrides the reported phase without going through connect.
    pub fn force_phase(&self, phase: SocketPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Delivers an inbound frame to the registered handler, as the
    /// transport would.
    pub fn deliver(&self, message: IncomingMessage) {
        if matches!(message, IncomingMessage::Event { .. }) {
            self.events_received.fetch_add(1, Ordering::Relaxed);
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(&self.address, message);
        }
    }

    /// Delivers an event frame on the given subscription.
    pub fn deliver_event(&self, subscription_id: &str, event: Event) {
        self.deliver(IncomingMessage::Event {
            subscription_id: subscription_id.to_string(),
            event: Box::new(event),
        });
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// The filter registered under `id`, if any.
    #[must_use]
    pub fn subscription(&self, id: &str) -> Option<Filter> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// How many times connect was attempted on this socket.
    #[must_use]
    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// How many times subscribe was called on this socket.
    #[must_use]
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

impl HealthProbe for MockRelaySocket {
    fn check_health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelaySocket for MockRelaySocket {
    fn address(&self) -> &RelayAddress {
        &self.address
    }

    async fn connect(&self) -> RelayResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::Connection {
                address: self.address.to_string(),
                reason: "mock connect failure".to_string(),
            });
        }
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = SocketPhase::Connected;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = SocketPhase::Disconnected;
    }

    async fn phase(&self) -> SocketPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn counters(&self) -> SocketCounters {
        SocketCounters {
            events_received: self.events_received.load(Ordering::Relaxed),
            queries_sent: self.queries_sent.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    async fn subscribe(&self, id: &str, filter: Filter) -> RelayResult<()> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.queries_sent.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), filter);
        Ok(())
    }

    async fn unsubscribe(&self, id: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    async fn publish(&self, _event: Event) -> RelayResult<()> {
        self.queries_sent.fetch_add(1, Ordering::Relaxed);
        if self.fail_connect.load(Ordering::SeqCst) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::Publish("mock publish failure".to_string()));
        }
        Ok(())
    }

    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        self.supports_health_probe.then_some(self as &dyn HealthProbe)
    }
}

/// Factory handing out [`MockRelaySocket`]s and remembering every
/// socket it created.
#[derive(Default)]
pub struct MockSocketFactory {
    sockets: Mutex<HashMap<String, Arc<MockRelaySocket>>>,
    created: Mutex<HashMap<String, u64>>,
    failing_addresses: Mutex<HashSet<String>>,
    create_without_probe: AtomicBool,
}

impl MockSocketFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory whose sockets lack the [`HealthProbe`]
    /// capability.
    #[must_use]
    pub fn without_health_probes() -> Self {
        let factory = Self::default();
        factory.create_without_probe.store(true, Ordering::SeqCst);
        factory
    }

    /// Sockets created for `address` will fail their connect attempts.
    pub fn fail_address(&self, address: &str) {
        self.failing_addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string());
    }

    /// Sockets created for `address` will connect again.
    pub fn clear_fail_address(&self, address: &str) {
        self.failing_addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    /// The most recently created socket for `address`.
    #[must_use]
    pub fn socket_for(&self, address: &str) -> Option<Arc<MockRelaySocket>> {
        self.sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    /// How many sockets have been created for `address`.
    #[must_use]
    pub fn created_for(&self, address: &str) -> u64 {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

impl RelaySocketFactory for MockSocketFactory {
    fn create(&self, address: &RelayAddress) -> Arc<dyn RelaySocket> {
        let socket = if self.create_without_probe.load(Ordering::SeqCst) {
            Arc::new(MockRelaySocket::without_health_probe(address.clone()))
        } else {
            Arc::new(MockRelaySocket::new(address.clone()))
        };
        let failing = self
            .failing_addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address.as_str());
        socket.set_fail_connect(failing);

        self.sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.as_str().to_string(), Arc::clone(&socket));
        *self
            .created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.as_str().to_string())
            .or_insert(0) += 1;

        socket
    }
}

/// In-memory relay list storage.
#[derive(Default)]
pub struct MemoryRelayStorage {
    relays: Mutex<Vec<String>>,
    save_count: AtomicU64,
    fail: AtomicBool,
}

impl MemoryRelayStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage pre-seeded with a relay list.
    #[must_use]
    pub fn with_relays(relays: Vec<String>) -> Self {
        Self {
            relays: Mutex::new(relays),
            ..Self::default()
        }
    }

    /// Makes subsequent load/save operations fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The currently persisted list.
    #[must_use]
    pub fn saved(&self) -> Vec<String> {
        self.relays.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times the list was saved.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }
}

impl RelayListStorage for MemoryRelayStorage {
    fn load_relays(&self) -> RelayResult<Vec<String>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Storage("mock load failure".to_string()));
        }
        Ok(self.saved())
    }

    fn save_relays(&self, relays: &[String]) -> RelayResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Storage("mock save failure".to_string()));
        }
        *self.relays.lock().unwrap_or_else(|e| e.into_inner()) = relays.to_vec();
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
