//! Relay connection manager.
//!
//! The manager owns the persisted set of *configured* relay addresses
//! and reconciles it continuously against the live set of *connected*
//! sockets: it loads and filters the persisted list, connects to every
//! configured address in parallel, health-checks connections on a
//! periodic timer, recovers silently-dead sockets, and publishes a
//! consistent status snapshot stream for callers to drive UI from.
//!
//! # Ownership
//!
//! The configured list, the status map, and the socket registry are
//! owned exclusively by the manager and mutated only through its
//! methods; public getters return copies. Sockets themselves are
//! produced by the injected [`RelaySocketFactory`] and their lifetime
//! belongs to that factory/pool; see [`RelayConnectionManager::dispose`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::Event;
use tokio::sync::{broadcast, RwLock};

use super::address::RelayAddress;
use super::error::{RelayError, RelayResult};
use super::socket::{HealthProbe, RelaySocket, RelaySocketFactory, SdkSocketFactory, SocketPhase};
use super::storage::RelayListStorage;
use super::types::{
    PublishOutcome, RelayConnectionState, RelayConnectionStatus, RelayStatusSnapshot,
    SocketCounters,
};

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the status snapshot broadcast channel.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 32;

/// Immutable configuration for a [`RelayConnectionManager`].
pub struct RelayManagerConfig {
    /// The one address that is re-inserted at initialization when
    /// missing from the persisted configuration.
    pub default_relay: String,

    /// Persistence adapter for the configured list. Without one, the
    /// configuration lives only in memory.
    pub storage: Option<Arc<dyn RelayListStorage>>,

    /// Socket factory override, injected for testing.
    pub socket_factory: Option<Arc<dyn RelaySocketFactory>>,

    /// Hostnames that must never be added or retained. Matching
    /// entries are silently filtered on load and on add.
    pub blocked_hosts: Vec<String>,

    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
}

impl RelayManagerConfig {
    /// Creates a configuration with the given default relay and no
    /// storage, factory override, or blocklist.
    #[must_use]
    pub fn new(default_relay: impl Into<String>) -> Self {
        Self {
            default_relay: default_relay.into(),
            storage: None,
            socket_factory: None,
            blocked_hosts: Vec::new(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    /// Sets the persistence adapter.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn RelayListStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the socket factory override.
    #[must_use]
    pub fn with_socket_factory(mut self, factory: Arc<dyn RelaySocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    /// Sets the hostname blocklist.
    #[must_use]
    pub fn with_blocked_hosts(mut self, hosts: Vec<String>) -> Self {
        self.blocked_hosts = hosts;
        self
    }

    /// Sets the reconciliation interval.
    #[must_use]
    pub const fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

/// Mutable manager state, guarded as one unit so every snapshot is
/// internally consistent.
struct ManagerState {
    configured: Vec<RelayAddress>,
    statuses: RelayStatusSnapshot,
    sockets: HashMap<String, Arc<dyn RelaySocket>>,
}

struct ManagerInner {
    default_address: RelayAddress,
    blocked_hosts: Vec<String>,
    storage: Option<Arc<dyn RelayListStorage>>,
    factory: Arc<dyn RelaySocketFactory>,
    reconcile_interval: Duration,
    initialized: AtomicBool,
    disposed: AtomicBool,
    state: RwLock<ManagerState>,
    snapshot_tx: Mutex<Option<broadcast::Sender<RelayStatusSnapshot>>>,
    reconcile_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Manager for the client's steady-state relay connection pool.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use lantern_core::relay::{RelayConnectionManager, RelayManagerConfig};
///
/// let config = RelayManagerConfig::new("wss://relay.example.com")
///     .with_storage(storage);
/// let manager = RelayConnectionManager::new(config)?;
/// manager.initialize().await;
///
/// let mut statuses = manager.subscribe_status();
/// while let Ok(snapshot) = statuses.recv().await {
///     println!("{} relays connected", manager.connected_relay_count().await);
/// }
/// ```
pub struct RelayConnectionManager {
    inner: Arc<ManagerInner>,
}

impl RelayConnectionManager {
    /// Creates a manager from the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidAddress`] if the default relay
    /// address does not normalize.
    pub fn new(config: RelayManagerConfig) -> RelayResult<Self> {
        let default_address = RelayAddress::normalize(&config.default_relay)
            .ok_or_else(|| RelayError::InvalidAddress(config.default_relay.clone()))?;

        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                default_address,
                blocked_hosts: config
                    .blocked_hosts
                    .iter()
                    .map(|h| h.trim().to_lowercase())
                    .collect(),
                storage: config.storage,
                factory: config
                    .socket_factory
                    .unwrap_or_else(|| Arc::new(SdkSocketFactory)),
                reconcile_interval: config.reconcile_interval,
                initialized: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                state: RwLock::new(ManagerState {
                    configured: Vec::new(),
                    statuses: RelayStatusSnapshot::new(),
                    sockets: HashMap::new(),
                }),
                snapshot_tx: Mutex::new(Some(snapshot_tx)),
                reconcile_task: Mutex::new(None),
            }),
        })
    }

    /// Loads the persisted configuration, connects to every configured
    /// relay in parallel, and starts the reconciliation timer.
    ///
    /// Idempotent: a second call is a no-op. Storage failures are
    /// logged and tolerated; the manager stays usable with whatever
    /// configuration it could assemble.
    pub async fn initialize(&self) {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }

        let to_connect = {
            let mut state = inner.state.write().await;
            if inner.initialized.swap(true, Ordering::SeqCst) {
                return;
            }

            let (mut configured, dropped_blocked) = inner.load_configured();

            // The default address can never be absent from a fresh
            // configuration; insert it at the front when missing.
            if !configured.contains(&inner.default_address) {
                configured.insert(0, inner.default_address.clone());
            }

            if dropped_blocked {
                inner.persist(&configured);
            }

            for address in &configured {
                let is_default = *address == inner.default_address;
                state.statuses.insert(
                    address.as_str().to_string(),
                    RelayConnectionStatus::new(address.clone(), is_default),
                );
            }
            state.configured = configured.clone();
            configured
        };

        self.connect_addresses(&to_connect).await;
        inner.start_reconcile_task(Arc::downgrade(&self.inner));
        inner.emit_snapshot(&*inner.state.read().await);
    }

    /// Adds a relay to the configured set and attempts to connect.
    ///
    /// Returns `false` without mutating anything when the address does
    /// not normalize, matches the blocklist, or is already configured.
    /// Otherwise the relay is appended and persisted regardless of the
    /// connection outcome, and the connection outcome is returned.
    pub async fn add_relay(&self, address: &str) -> bool {
        let inner = &self.inner;
        let Some(address) = RelayAddress::normalize(address) else {
            tracing::debug!(input = address, "rejecting unparsable relay address");
            return false;
        };
        if inner.is_blocked(&address) {
            tracing::warn!(relay = %address, "rejecting blocklisted relay");
            return false;
        }

        {
            let mut state = inner.state.write().await;
            if state.configured.contains(&address) {
                return false;
            }
            state.configured.push(address.clone());
            let mut status = RelayConnectionStatus::new(address.clone(), false);
            status.transition(RelayConnectionState::Connecting, None);
            state.statuses.insert(address.as_str().to_string(), status);
        }

        let connected = self.connect_addresses(std::slice::from_ref(&address)).await == 1;

        let state = inner.state.read().await;
        inner.persist(&state.configured);
        inner.emit_snapshot(&state);
        connected
    }

    /// Removes a relay from the configured set.
    ///
    /// Returns `false` when the address does not normalize or is not
    /// configured. The default relay is *not* protected here: removing
    /// it succeeds, and it reappears only on the next full
    /// [`initialize`](Self::initialize) cycle.
    pub async fn remove_relay(&self, address: &str) -> bool {
        let inner = &self.inner;
        let Some(address) = RelayAddress::normalize(address) else {
            return false;
        };

        let socket = {
            let mut state = inner.state.write().await;
            let Some(position) = state.configured.iter().position(|a| *a == address) else {
                return false;
            };
            state.configured.remove(position);
            state.statuses.remove(address.as_str());
            let socket = state.sockets.remove(address.as_str());

            inner.persist(&state.configured);
            inner.emit_snapshot(&state);
            socket
        };

        if let Some(socket) = socket {
            socket.disconnect().await;
        }
        true
    }

    /// Re-establishes every connection that is not currently healthy.
    ///
    /// First actively probes every socket whose status reports it
    /// connected; a probe failure demotes the entry to disconnected.
    /// This catches zombie sockets that still report connected but have
    /// stopped delivering frames, which is common after a period of
    /// idleness. Every address not connected afterwards is then
    /// reconnected in parallel.
    pub async fn retry_disconnected_relays(&self) {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }

        let to_reconnect = {
            let mut state = inner.state.write().await;
            let mut demoted = Vec::new();
            for (key, status) in &state.statuses {
                if !status.state.is_connected() {
                    continue;
                }
                let healthy = state
                    .sockets
                    .get(key)
                    .and_then(|socket| socket.health_probe().map(HealthProbe::check_health))
                    .unwrap_or(true);
                if !healthy {
                    tracing::warn!(relay = %key, "health probe failed, demoting connection");
                    demoted.push(key.clone());
                }
            }
            for key in demoted {
                if let Some(status) = state.statuses.get_mut(&key) {
                    status.transition(RelayConnectionState::Disconnected, None);
                }
            }

            let targets: Vec<RelayAddress> = state
                .configured
                .iter()
                .filter(|address| {
                    state
                        .statuses
                        .get(address.as_str())
                        .is_none_or(|s| !s.state.is_connected())
                })
                .cloned()
                .collect();
            for address in &targets {
                if let Some(status) = state.statuses.get_mut(address.as_str()) {
                    status.transition(RelayConnectionState::Connecting, None);
                }
            }
            targets
        };

        if to_reconnect.is_empty() {
            return;
        }
        self.connect_addresses(&to_reconnect).await;
        inner.emit_snapshot(&*inner.state.read().await);
    }

    /// Disconnects every configured socket and reconnects all of them
    /// in parallel.
    ///
    /// Unlike [`retry_disconnected_relays`](Self::retry_disconnected_relays)
    /// this does not preserve already-healthy connections; use it after
    /// a suspected bulk transport loss, e.g. when the whole process was
    /// suspended.
    pub async fn force_reconnect_all(&self) {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }

        let (sockets, targets) = {
            let mut state = inner.state.write().await;
            let sockets: Vec<Arc<dyn RelaySocket>> = state.sockets.values().cloned().collect();
            let targets = state.configured.clone();
            for address in &targets {
                if let Some(status) = state.statuses.get_mut(address.as_str()) {
                    status.transition(RelayConnectionState::Connecting, None);
                }
            }
            (sockets, targets)
        };

        futures::future::join_all(sockets.iter().map(|socket| socket.disconnect())).await;

        self.connect_addresses(&targets).await;
        inner.emit_snapshot(&*inner.state.read().await);
    }

    /// Publishes a signed event to every currently connected relay.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotInitialized`] before initialization and
    /// [`RelayError::AllRelaysFailed`] when no relay accepts the event.
    pub async fn publish_event(&self, event: &Event) -> RelayResult<PublishOutcome> {
        let inner = &self.inner;
        if !inner.initialized.load(Ordering::SeqCst) {
            return Err(RelayError::NotInitialized);
        }

        let targets: Vec<Arc<dyn RelaySocket>> = {
            let state = inner.state.read().await;
            state
                .statuses
                .values()
                .filter(|status| status.state.is_connected())
                .filter_map(|status| state.sockets.get(status.address.as_str()).cloned())
                .collect()
        };

        let results = futures::future::join_all(targets.iter().map(|socket| {
            let event = event.clone();
            async move { (socket.address().to_string(), socket.publish(event).await) }
        }))
        .await;

        let mut outcome = PublishOutcome {
            event_id: event.id,
            accepted_by: Vec::new(),
            failed: Vec::new(),
        };
        for (address, result) in results {
            match result {
                Ok(()) => outcome.accepted_by.push(address),
                Err(e) => outcome.failed.push((address, e.to_string())),
            }
        }

        if outcome.is_success() {
            Ok(outcome)
        } else {
            Err(RelayError::AllRelaysFailed)
        }
    }

    /// The configured relay addresses, in configuration order.
    pub async fn configured_relays(&self) -> Vec<String> {
        self.inner
            .state
            .read()
            .await
            .configured
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// The subset of configured relays whose debounced status reports
    /// them connected.
    pub async fn connected_relays(&self) -> Vec<String> {
        self.inner
            .state
            .read()
            .await
            .statuses
            .values()
            .filter(|status| status.state.is_connected())
            .map(|status| status.address.to_string())
            .collect()
    }

    /// Number of configured relays.
    pub async fn configured_relay_count(&self) -> usize {
        self.inner.state.read().await.configured.len()
    }

    /// Number of connected relays.
    pub async fn connected_relay_count(&self) -> usize {
        self.connected_relays().await.len()
    }

    /// True when at least one relay is connected.
    pub async fn has_connected_relay(&self) -> bool {
        self.connected_relay_count().await > 0
    }

    /// The current status snapshot.
    pub async fn status_snapshot(&self) -> RelayStatusSnapshot {
        self.inner.state.read().await.statuses.clone()
    }

    /// Subscribes to status snapshot notifications.
    ///
    /// Snapshots are delivered in the order state changes are applied.
    /// After [`dispose`](Self::dispose) the returned receiver reports
    /// the channel closed.
    pub fn subscribe_status(&self) -> broadcast::Receiver<RelayStatusSnapshot> {
        let guard = self
            .inner
            .snapshot_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map_or_else(
            || broadcast::channel(1).1,
            broadcast::Sender::subscribe,
        )
    }

    /// Raw per-relay counters pulled directly from each live socket.
    ///
    /// Bypasses the debounced status view and may be momentarily
    /// inconsistent with it.
    pub async fn socket_counters(&self) -> HashMap<String, SocketCounters> {
        self.inner
            .state
            .read()
            .await
            .sockets
            .iter()
            .map(|(address, socket)| (address.clone(), socket.counters()))
            .collect()
    }

    /// Stops the reconciliation timer and closes the snapshot stream.
    ///
    /// Individual sockets are deliberately *not* closed here: their
    /// lifetime is owned by the socket factory/pool, not by the
    /// manager's disposal path.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);

        if let Some(task) = self
            .inner
            .reconcile_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        self.inner
            .snapshot_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Connects the given addresses in parallel and applies per-address
    /// outcomes to the status map. Returns the number of successes.
    async fn connect_addresses(&self, addresses: &[RelayAddress]) -> usize {
        let inner = &self.inner;

        let attempts: Vec<(RelayAddress, Arc<dyn RelaySocket>)> = {
            let mut state = inner.state.write().await;
            addresses
                .iter()
                .map(|address| {
                    let socket = inner.factory.create(address);
                    // A stale registration must not block re-registration.
                    state.sockets.remove(address.as_str());
                    state
                        .sockets
                        .insert(address.as_str().to_string(), Arc::clone(&socket));
                    (address.clone(), socket)
                })
                .collect()
        };

        let outcomes = futures::future::join_all(attempts.iter().map(|(address, socket)| {
            let address = address.clone();
            async move {
                match socket.connect().await {
                    Ok(()) => (address, Ok(())),
                    Err(e) => (address, Err(e.to_string())),
                }
            }
        }))
        .await;

        let mut successes = 0;
        {
            let mut state = inner.state.write().await;
            for (address, outcome) in outcomes {
                let Some(status) = state.statuses.get_mut(address.as_str()) else {
                    // Removed while the attempt was in flight.
                    continue;
                };
                match outcome {
                    Ok(()) => {
                        successes += 1;
                        status.transition(RelayConnectionState::Connected, None);
                    }
                    Err(reason) => {
                        tracing::debug!(relay = %address, "connect attempt failed: {reason}");
                        status.transition(RelayConnectionState::Error, Some(reason));
                    }
                }
            }
        }
        successes
    }
}

impl ManagerInner {
    /// Loads and sanitizes the persisted configuration. Returns the
    /// surviving addresses and whether any blocklisted entry was
    /// dropped.
    fn load_configured(&self) -> (Vec<RelayAddress>, bool) {
        let raw = match self.storage.as_ref().map(|s| s.load_relays()) {
            Some(Ok(list)) => list,
            Some(Err(e)) => {
                tracing::warn!("failed to load persisted relay list: {e}");
                Vec::new()
            }
            None => Vec::new(),
        };

        let mut configured = Vec::new();
        let mut dropped_blocked = false;
        for entry in raw {
            let Some(address) = RelayAddress::normalize(&entry) else {
                tracing::warn!(%entry, "dropping unparsable persisted relay");
                continue;
            };
            if self.is_blocked(&address) {
                tracing::warn!(relay = %address, "dropping blocklisted persisted relay");
                dropped_blocked = true;
                continue;
            }
            if !configured.contains(&address) {
                configured.push(address);
            }
        }
        (configured, dropped_blocked)
    }

    fn is_blocked(&self, address: &RelayAddress) -> bool {
        let host = address.host();
        self.blocked_hosts.iter().any(|blocked| *blocked == host)
    }

    /// Persists the configured list, tolerating storage failures.
    fn persist(&self, configured: &[RelayAddress]) {
        if let Some(storage) = &self.storage {
            let list: Vec<String> = configured.iter().map(ToString::to_string).collect();
            if let Err(e) = storage.save_relays(&list) {
                tracing::warn!("failed to persist relay list: {e}");
            }
        }
    }

    /// Broadcasts the current snapshot while the caller still holds the
    /// state lock, preserving notification order.
    fn emit_snapshot(&self, state: &ManagerState) {
        let guard = self.snapshot_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            // No receivers is not an error.
            let _ = tx.send(state.statuses.clone());
        }
    }

    fn start_reconcile_task(&self, weak: std::sync::Weak<Self>) {
        let interval = self.reconcile_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.disposed.load(Ordering::SeqCst) {
                    break;
                }
                inner.reconcile_once().await;
            }
        });

        let mut guard = self
            .reconcile_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(task);
    }

    /// One reconciliation pass: align cached statuses with live socket
    /// phases, emitting a snapshot only when something changed.
    async fn reconcile_once(&self) {
        let observations: Vec<(String, RelayConnectionState)> = {
            let state = self.state.read().await;
            let mut observations = Vec::with_capacity(state.sockets.len());
            for (key, socket) in &state.sockets {
                let live = match socket.phase().await {
                    SocketPhase::Connecting => RelayConnectionState::Connecting,
                    SocketPhase::Connected => {
                        if socket.is_authenticated() {
                            RelayConnectionState::Authenticated
                        } else {
                            RelayConnectionState::Connected
                        }
                    }
                    SocketPhase::Disconnected => RelayConnectionState::Disconnected,
                };
                observations.push((key.clone(), live));
            }
            observations
        };

        let mut state = self.state.write().await;
        let mut changed = false;
        for (key, live) in observations {
            let Some(status) = state.statuses.get_mut(&key) else {
                continue;
            };
            if status.state == live {
                continue;
            }
            // A cached error is a richer description of a dead socket
            // than the phase field; keep it until a retry pass runs.
            if status.state == RelayConnectionState::Error
                && live == RelayConnectionState::Disconnected
            {
                continue;
            }
            status.transition(live, None);
            changed = true;
        }

        if changed {
            self.emit_snapshot(&state);
        }
    }
}
