//! Application-facing link manager
//!
//! [`LinkManager`] wires the pieces together: the discovery transport feeds
//! the dispatcher, established connections land in the registry and get a
//! read loop each, the health monitor sweeps the registry, and everything
//! the application needs to see comes out of two callbacks.
//!
//! ```text
//!                ┌────────────────────┐
//!  discovery ───►│ dispatcher thread  │── workers (accept / connect)
//!                └─────────┬──────────┘
//!                          │ Established
//!                          ▼
//!                ┌────────────────────┐     ┌──────────────────┐
//!  send_* ──────►│ ConnectionRegistry │◄────│ health monitor   │
//!                └─────────┬──────────┘     └──────────────────┘
//!                          │ one read loop per connection
//!                          ▼
//!                  on_message / on_status
//! ```
//!
//! Every path that ends a connection (read error, write error, eviction,
//! stale replacement) goes through [`Shared::teardown`].

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crate::config::LinkConfig;
use crate::connection::{ConnectionState, PeerConnection};
use crate::crypto::CryptoProvider;
use crate::envelope::{Content, InboundMessage, MessageSecurity, PayloadMetadata};
use crate::error::LinkError;
use crate::health::HealthMonitor;
use crate::identity::{is_valid_device_id, short_id};
use crate::metrics::Metrics;
use crate::orchestrator::{LinkEvent, Orchestrator};
use crate::pipeline::{Inbound, MessagePipeline};
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::transport::{encode_service_info, DiscoverySink, DiscoveryTransport};
use crate::trust::TrustStore;

/// Receives application messages and local notices, with the ID of the
/// connection they arrived on (`None` for notices not tied to one)
pub type MessageCallback = Arc<dyn Fn(InboundMessage, Option<String>) + Send + Sync>;

/// Receives per-peer state changes
pub type StatusCallback = Arc<dyn Fn(&str, ConnectionState) + Send + Sync>;

// ============================================================================
// Notifier
// ============================================================================

/// Callback fan-out plus the last state reported per peer
///
/// Callbacks are cloned out of their lock before being invoked, so a callback
/// may call back into the manager.
#[derive(Default)]
pub(crate) struct Notifier {
    on_message: RwLock<Option<MessageCallback>>,
    on_status: RwLock<Option<StatusCallback>>,
    states: Mutex<HashMap<String, ConnectionState>>,
}

impl Notifier {
    fn install(&self, on_message: MessageCallback, on_status: StatusCallback) {
        *self.on_message.write().unwrap_or_else(PoisonError::into_inner) = Some(on_message);
        *self.on_status.write().unwrap_or_else(PoisonError::into_inner) = Some(on_status);
    }

    /// Record and report `state`; repeats of the current state are swallowed
    pub(crate) fn status(&self, peer_id: &str, state: ConnectionState) {
        let previous = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.to_string(), state);

        match previous {
            Some(prev) if prev == state => return,
            Some(prev) if !prev.can_transition_to(state) => {
                log::debug!("{}: unusual transition {} -> {}", short_id(peer_id), prev, state);
            }
            _ => {}
        }
        log::debug!("{}: {}", short_id(peer_id), state);

        let callback = self
            .on_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(peer_id, state);
        }
    }

    /// Move to `to` only if the peer is still in `from`
    pub(crate) fn transition(&self, peer_id: &str, from: ConnectionState, to: ConnectionState) -> bool {
        if self.state(peer_id) != Some(from) {
            return false;
        }
        self.status(peer_id, to);
        true
    }

    /// Drop every recorded state (after stop nothing is tracked)
    fn forget_all(&self) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .copied()
    }

    pub(crate) fn message(&self, message: InboundMessage, peer_id: Option<String>) {
        let callback = self
            .on_message
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(message, peer_id);
        }
    }

    /// Replace the message callback with one that records into the returned vec
    #[cfg(test)]
    pub(crate) fn record_messages(&self) -> Arc<Mutex<Vec<InboundMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        *self.on_message.write().unwrap() = Some(Arc::new(
            move |m: InboundMessage, _: Option<String>| sink.lock().unwrap().push(m),
        ));
        seen
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared by the dispatcher, read loops, senders and the monitor
pub(crate) struct Shared {
    pub(crate) config: LinkConfig,
    pub(crate) local_id: String,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) pipeline: MessagePipeline,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) notifier: Notifier,
    running: AtomicBool,
}

impl Shared {
    fn new(
        config: LinkConfig,
        local_id: String,
        crypto: Arc<dyn CryptoProvider>,
        trust: Arc<dyn TrustStore>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.max_connections, config.idle_threshold()),
            pipeline: MessagePipeline::new(local_id.clone(), crypto, trust),
            metrics: Arc::new(Metrics::new()),
            notifier: Notifier::default(),
            running: AtomicBool::new(false),
            config,
            local_id,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// A freshly registered connection: start reading, tell the application
    pub(crate) fn activate(self: &Arc<Self>, conn: Arc<PeerConnection>) {
        let peer_id = conn.peer_id().to_string();
        self.notifier.status(&peer_id, ConnectionState::Connected);
        self.notifier.message(
            InboundMessage::system(format!("[System] Connected to {}", short_id(&peer_id))),
            Some(peer_id.clone()),
        );

        let shared = Arc::clone(self);
        let reader_conn = conn.clone();
        let spawned = thread::Builder::new()
            .name(format!("peerlink-read-{}", short_id(&peer_id)))
            .spawn(move || shared.read_loop(reader_conn));
        if let Err(e) = spawned {
            log::error!("Failed to start read loop for {}: {}", short_id(&peer_id), e);
            self.teardown(&conn, "read loop unavailable");
        }
    }

    fn read_loop(self: Arc<Self>, conn: Arc<PeerConnection>) {
        let reader = match conn.reader() {
            Ok(reader) => reader,
            Err(e) => {
                self.teardown(&conn, &format!("read handle unavailable: {}", e));
                return;
            }
        };
        let mut reader = BufReader::new(reader);

        let reason = loop {
            let envelope = match self.pipeline.receive(&mut reader) {
                Ok(envelope) => envelope,
                Err(e) if !e.is_stream_fatal() => {
                    log::warn!("Dropping undecodable frame from {}: {}", short_id(conn.peer_id()), e);
                    conn.touch();
                    continue;
                }
                Err(e) => break e.to_string(),
            };
            conn.touch();

            match self.pipeline.open(envelope) {
                Inbound::Heartbeat => {
                    log::trace!("Heartbeat from {}", short_id(conn.peer_id()));
                }
                Inbound::Message(message) => {
                    if message.security == MessageSecurity::DecryptionFailed {
                        Metrics::incr(&self.metrics.decrypt_failures_total);
                    }
                    if message.sender_id != conn.peer_id() {
                        log::debug!(
                            "Envelope sender {} differs from connection {}",
                            short_id(&message.sender_id),
                            short_id(conn.peer_id())
                        );
                    }
                    Metrics::incr(&self.metrics.messages_received_total);
                    self.notifier
                        .message(message, Some(conn.peer_id().to_string()));
                }
            }
        };

        self.teardown(&conn, &reason);
    }

    /// The single funnel for ending an established connection
    ///
    /// Only the call that removes `conn` from the registry reports it; any
    /// later call for the same connection just makes sure it is closed.
    pub(crate) fn teardown(self: &Arc<Self>, conn: &Arc<PeerConnection>, reason: &str) {
        let was_registered = self.registry.remove_if_current(conn);
        conn.close();
        if !was_registered {
            return;
        }

        let peer_id = conn.peer_id().to_string();
        Metrics::incr(&self.metrics.evictions_total);
        log::info!("Connection to {} lost: {}", short_id(&peer_id), reason);

        self.notifier.status(&peer_id, ConnectionState::Disconnected);
        self.notifier.message(
            InboundMessage::system(format!("[System] Connection lost to {}", short_id(&peer_id))),
            Some(peer_id.clone()),
        );
        self.schedule_reconnect(peer_id);
    }

    /// After the reconnect delay, mark the peer eligible for re-discovery
    fn schedule_reconnect(self: &Arc<Self>, peer_id: String) {
        if !self.is_running() {
            return;
        }
        let shared = Arc::clone(self);
        let delay = self.config.reconnect_delay();
        let spawned = thread::Builder::new()
            .name(format!("peerlink-reconnect-{}", short_id(&peer_id)))
            .spawn(move || {
                thread::sleep(delay);
                if shared.is_running() {
                    shared.notifier.transition(
                        &peer_id,
                        ConnectionState::Disconnected,
                        ConnectionState::Reconnecting,
                    );
                }
            });
        if let Err(e) = spawned {
            log::warn!("Could not schedule reconnect signal: {}", e);
        }
    }

    /// Seal and write one message; stream-fatal failures tear the connection down
    pub(crate) fn send(self: &Arc<Self>, conn: &Arc<PeerConnection>, content: &Content) -> Result<(), LinkError> {
        match self.pipeline.send(conn, content) {
            Ok(()) => {
                Metrics::incr(&self.metrics.messages_sent_total);
                Ok(())
            }
            Err(e) => {
                if e.is_stream_fatal() {
                    self.teardown(conn, &format!("write failed: {}", e));
                }
                Err(e)
            }
        }
    }

    /// Close every connection without reconnect signalling
    fn close_all(&self) {
        for conn in self.registry.clear() {
            conn.close();
            self.notifier
                .status(conn.peer_id(), ConnectionState::Disconnected);
        }
    }

    #[cfg(test)]
    pub(crate) fn stop_for_test(&self) {
        self.running.store(false, Ordering::Release);
        self.close_all();
    }
}

// ============================================================================
// Link Manager
// ============================================================================

struct Runtime {
    events: Sender<LinkEvent>,
    dispatcher: JoinHandle<()>,
    monitor: HealthMonitor,
}

/// Entry point for applications
pub struct LinkManager {
    shared: Arc<Shared>,
    transport: Arc<dyn DiscoveryTransport>,
    runtime: Mutex<Option<Runtime>>,
}

impl LinkManager {
    pub fn new(
        config: LinkConfig,
        device_id: impl Into<String>,
        transport: Arc<dyn DiscoveryTransport>,
        crypto: Arc<dyn CryptoProvider>,
        trust: Arc<dyn TrustStore>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let device_id = device_id.into();
        if !is_valid_device_id(&device_id) {
            return Err(LinkError::Config(format!("invalid device ID {:?}", device_id)));
        }

        Ok(Self {
            shared: Arc::new(Shared::new(config, device_id, crypto, trust)),
            transport,
            runtime: Mutex::new(None),
        })
    }

    /// Attach to discovery and start establishing connections
    pub fn start_discovery<M, S>(&self, on_message: M, on_status: S) -> Result<(), LinkError>
    where
        M: Fn(InboundMessage, Option<String>) + Send + Sync + 'static,
        S: Fn(&str, ConnectionState) + Send + Sync + 'static,
    {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if runtime.is_some() {
            return Err(LinkError::AlreadyRunning);
        }

        self.shared
            .notifier
            .install(Arc::new(on_message), Arc::new(on_status));
        self.shared.running.store(true, Ordering::Release);

        let (events, receiver) = mpsc::channel();
        let orchestrator = Orchestrator::new(self.shared.clone(), self.transport.clone(), events.clone());
        let dispatcher = match thread::Builder::new()
            .name("peerlink-dispatch".into())
            .spawn(move || orchestrator.run(receiver))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let service_info = encode_service_info(&self.shared.local_id);
        let attached = self.transport.attach(
            &self.shared.config.service_name,
            &service_info,
            DiscoverySink::new(events.clone()),
        );
        let monitor = attached.and_then(|()| Ok(HealthMonitor::start(self.shared.clone())?));

        let monitor = match monitor {
            Ok(monitor) => monitor,
            Err(e) => {
                log::error!("Failed to start discovery: {}", e);
                self.shared.running.store(false, Ordering::Release);
                self.transport.detach();
                let _ = events.send(LinkEvent::Shutdown);
                let _ = dispatcher.join();
                self.shared.notifier.status(&self.shared.local_id, ConnectionState::Disconnected);
                self.shared.notifier.message(
                    InboundMessage::system(format!("[Error] Failed to start discovery: {}", e)),
                    None,
                );
                return Err(e);
            }
        };

        log::info!(
            "Discovery started for {} on service {:?}",
            short_id(&self.shared.local_id),
            self.shared.config.service_name
        );
        *runtime = Some(Runtime {
            events,
            dispatcher,
            monitor,
        });
        Ok(())
    }

    /// Detach from discovery and close every connection
    ///
    /// Idempotent; a no-op when discovery is not running.
    pub fn stop_discovery(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runtime) = runtime else {
            return;
        };

        self.shared.running.store(false, Ordering::Release);
        self.transport.detach();

        let _ = runtime.events.send(LinkEvent::Shutdown);
        if runtime.dispatcher.join().is_err() {
            log::error!("Dispatcher thread panicked");
        }
        runtime.monitor.stop();

        self.shared.close_all();
        self.shared.notifier.forget_all();
        log::info!("Discovery stopped for {}", short_id(&self.shared.local_id));
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send text to one peer, or to every connected peer when `target` is
    /// `None`; returns how many peers it was written to
    pub fn send_message(&self, text: &str, target: Option<&str>) -> Result<usize, LinkError> {
        self.send_content(Content::text(text), target)
    }

    pub fn send_binary_payload(
        &self,
        data: Vec<u8>,
        metadata: PayloadMetadata,
        target: Option<&str>,
    ) -> Result<usize, LinkError> {
        self.send_content(Content::binary(data, metadata), target)
    }

    fn send_content(&self, content: Content, target: Option<&str>) -> Result<usize, LinkError> {
        if !self.shared.is_running() {
            return Err(LinkError::NotRunning);
        }

        if let Some(peer_id) = target {
            if peer_id == self.shared.local_id {
                return Err(LinkError::SelfConnection);
            }
            let conn = self
                .shared
                .registry
                .get(peer_id)
                .ok_or_else(|| LinkError::NotConnected(peer_id.to_string()))?;
            self.shared.send(&conn, &content)?;
            return Ok(1);
        }

        let mut delivered = 0;
        let mut last_error = None;
        for conn in self.shared.registry.all() {
            match self.shared.send(&conn, &content) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Broadcast to {} failed: {}", short_id(conn.peer_id()), e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(delivered),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn device_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Identities of connected peers, sorted
    pub fn connected_peers(&self) -> Vec<String> {
        self.shared.registry.peer_ids()
    }

    pub fn is_peer_connected(&self, peer_id: &str) -> bool {
        self.shared.registry.contains(peer_id)
    }

    /// One-line summary, e.g. `Connections: 2 (1 responder, 1 initiator)`
    pub fn connection_status(&self) -> String {
        let stats = self.shared.registry.statistics();
        format!(
            "Connections: {} ({} responder, {} initiator)",
            stats.total, stats.responders, stats.initiators
        )
    }

    pub fn statistics(&self) -> RegistryStats {
        self.shared.registry.statistics()
    }

    /// Last state reported for `peer_id`
    pub fn connection_state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.shared.notifier.state(peer_id)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// Metrics in Prometheus text format
    pub fn render_metrics(&self) -> String {
        self.shared.metrics.render(self.shared.registry.len())
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::SealedBoxCrypto;
    use crate::trust::MemoryTrustStore;

    /// Running shared state with no callbacks and no threads
    pub fn shared_with_events(local_id: &str, config: LinkConfig) -> Arc<Shared> {
        let shared = Shared::new(
            config,
            local_id.to_string(),
            Arc::new(SealedBoxCrypto::generate().unwrap()),
            Arc::new(MemoryTrustStore::new()),
        );
        shared.running.store(true, Ordering::Release);
        Arc::new(shared)
    }
}
