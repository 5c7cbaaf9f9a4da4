//! Connection establishment orchestrator
//!
//! Every discovery event, control message and establishment result is a
//! [`LinkEvent`] on one channel, consumed by one dispatcher thread. The
//! dispatcher exclusively owns the bookkeeping that decides whether to act
//! (pending handshakes, peer reference → identity map, identities being
//! established), so the duplicate-discovery checks need no locking of their
//! own. Blocking I/O (accept, resolve, connect) runs on short-lived worker
//! threads that report back as events.
//!
//! # Establishment
//!
//! ```text
//!  Initiator (lower hash)                    Responder (higher hash)
//!  ──────────────────────                    ───────────────────────
//!  PeerDiscovered                            PeerDiscovered
//!    pending? registered? ─► skip              (passive)
//!    send HANDSHAKE:<id> ───────────────────►  ControlReceived(HANDSHAKE)
//!    pending += peer                             recompute role == Responder
//!                                                worker: open_listener
//!  ControlReceived(PORT:n) ◄───────────────────── send PORT:n
//!    pending -= peer                             accept_once(timeout)
//!    worker: resolve_endpoint, connect ═══════►
//!  Established ──► registry.add              Established ──► registry.add
//! ```

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::connection::{ConnectionState, PeerConnection, PeerRef};
use crate::control::{is_system_message, ControlMessage};
use crate::envelope::InboundMessage;
use crate::error::LinkError;
use crate::identity::{is_valid_device_id, negotiate_role, short_id, Role};
use crate::manager::Shared;
use crate::metrics::Metrics;
use crate::transport::{accept_once, connect, decode_service_info, DiscoveryTransport};

/// Upper bound on the pending-handshake expiry check interval
const MAX_TICK_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Events
// ============================================================================

/// Everything the dispatcher reacts to
#[derive(Debug)]
pub enum LinkEvent {
    /// Discovery layer found a peer; `service_info` carries its device ID
    PeerDiscovered {
        peer: PeerRef,
        service_info: Vec<u8>,
    },
    /// Raw payload arrived on the discovery side-channel
    ControlReceived { peer: PeerRef, payload: Vec<u8> },
    /// A worker produced a live stream
    Established {
        peer: PeerRef,
        peer_id: String,
        role: Role,
        stream: TcpStream,
        listener: Option<TcpListener>,
    },
    /// A worker gave up
    EstablishFailed {
        peer: PeerRef,
        peer_id: String,
        reason: String,
    },
    /// Discovery cannot run (permissions, radio unavailable, ...)
    DiscoveryUnavailable { reason: String },
    /// Housekeeping: expire stale handshakes
    Tick,
    Shutdown,
}

// ============================================================================
// Pending Handshakes
// ============================================================================

#[derive(Debug)]
struct PendingEntry {
    peer_id: String,
    sent_at: Instant,
}

/// Handshakes sent and still awaiting a `PORT` reply
#[derive(Debug, Default)]
pub struct PendingHandshakes {
    entries: HashMap<PeerRef, PendingEntry>,
}

impl PendingHandshakes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent handshake; `false` if one is already pending for this
    /// reference or identity
    pub fn insert(&mut self, peer: PeerRef, peer_id: impl Into<String>) -> bool {
        let peer_id = peer_id.into();
        if self.entries.contains_key(&peer) || self.contains_peer_id(&peer_id) {
            return false;
        }
        self.entries.insert(
            peer,
            PendingEntry {
                peer_id,
                sent_at: Instant::now(),
            },
        );
        true
    }

    pub fn contains(&self, peer: &PeerRef) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn contains_peer_id(&self, peer_id: &str) -> bool {
        self.entries.values().any(|e| e.peer_id == peer_id)
    }

    /// Remove and return the identity the handshake was sent to
    pub fn remove(&mut self, peer: &PeerRef) -> Option<String> {
        self.entries.remove(peer).map(|e| e.peer_id)
    }

    /// Drop entries older than `timeout`, returning them
    pub fn expire(&mut self, timeout: Duration) -> Vec<(PeerRef, String)> {
        let expired: Vec<PeerRef> = self
            .entries
            .iter()
            .filter(|(_, e)| e.sent_at.elapsed() >= timeout)
            .map(|(peer, _)| peer.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|peer| self.remove(&peer).map(|id| (peer, id)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub(crate) struct Orchestrator {
    shared: Arc<Shared>,
    transport: Arc<dyn DiscoveryTransport>,
    /// Handed to workers so they can report back
    events: Sender<LinkEvent>,
    pending: PendingHandshakes,
    /// Latest discovery reference per identity
    peer_ids: HashMap<PeerRef, String>,
    /// Identities with a worker in flight, and when we stop waiting for it
    establishing: HashMap<String, Instant>,
    unavailable_reported: bool,
    tick_interval: Duration,
    last_tick: Instant,
}

impl Orchestrator {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: Arc<dyn DiscoveryTransport>,
        events: Sender<LinkEvent>,
    ) -> Self {
        let config = &shared.config;
        let tick_interval = (config.handshake_timeout().min(config.resolve_timeout()) / 4)
            .clamp(Duration::from_millis(10), MAX_TICK_INTERVAL);
        Self {
            shared,
            transport,
            events,
            pending: PendingHandshakes::new(),
            peer_ids: HashMap::new(),
            establishing: HashMap::new(),
            unavailable_reported: false,
            tick_interval,
            last_tick: Instant::now(),
        }
    }

    /// Dispatch events until `Shutdown` or every sender is gone
    pub(crate) fn run(mut self, events: Receiver<LinkEvent>) {
        log::debug!("Dispatcher started for {}", short_id(&self.shared.local_id));
        loop {
            let keep_going = match events.recv_timeout(self.tick_interval) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => self.handle(LinkEvent::Tick),
                Err(RecvTimeoutError::Disconnected) => false,
            };
            if !keep_going {
                break;
            }
            if self.last_tick.elapsed() >= self.tick_interval {
                self.expire_stale();
            }
        }
        self.pending.clear();
        self.establishing.clear();
        self.peer_ids.clear();
        log::debug!("Dispatcher stopped for {}", short_id(&self.shared.local_id));
    }

    /// Handle one event; `false` means stop
    pub(crate) fn handle(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::PeerDiscovered { peer, service_info } => {
                self.on_peer_discovered(peer, &service_info)
            }
            LinkEvent::ControlReceived { peer, payload } => self.on_control(peer, &payload),
            LinkEvent::Established {
                peer,
                peer_id,
                role,
                stream,
                listener,
            } => self.on_established(peer, peer_id, role, stream, listener),
            LinkEvent::EstablishFailed {
                peer,
                peer_id,
                reason,
            } => self.on_establish_failed(&peer, &peer_id, &reason),
            LinkEvent::DiscoveryUnavailable { reason } => self.on_unavailable(&reason),
            LinkEvent::Tick => self.expire_stale(),
            LinkEvent::Shutdown => return false,
        }
        true
    }

    pub(crate) fn pending(&self) -> &PendingHandshakes {
        &self.pending
    }

    fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    /// Map `peer` to `remote_id`, forgetting older references to the same identity
    fn remember(&mut self, peer: &PeerRef, remote_id: &str) {
        self.peer_ids
            .retain(|known, id| known == peer || id.as_str() != remote_id);
        self.peer_ids.insert(peer.clone(), remote_id.to_string());
    }

    /// Track a worker for `peer_id` that must report within `budget`
    fn begin_establishing(&mut self, peer_id: &str, budget: Duration) {
        self.establishing
            .insert(peer_id.to_string(), Instant::now() + budget);
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    fn on_peer_discovered(&mut self, peer: PeerRef, service_info: &[u8]) {
        let remote_id = match decode_service_info(service_info) {
            Some(id) => id,
            None => {
                log::warn!("Ignoring {}: service info carries no device ID", peer);
                return;
            }
        };

        let role = negotiate_role(self.local_id(), &remote_id);
        if role == Role::Undecided {
            log::debug!("Ignoring discovery of our own service via {}", peer);
            return;
        }

        self.remember(&peer, &remote_id);

        if self.shared.registry.contains(&remote_id) {
            log::trace!("Already connected to {}", short_id(&remote_id));
            return;
        }
        if self.establishing.contains_key(&remote_id) {
            log::debug!("Connection to {} already in progress", short_id(&remote_id));
            return;
        }

        self.mark_discovering(&remote_id);

        match role {
            Role::Responder => {
                log::debug!(
                    "Discovered {} via {}, waiting for its handshake (we are {})",
                    short_id(&remote_id),
                    peer,
                    role
                );
            }
            Role::Initiator => self.send_handshake(peer, remote_id),
            Role::Undecided => {}
        }
    }

    fn mark_discovering(&self, peer_id: &str) {
        let notifier = &self.shared.notifier;
        if matches!(
            notifier.state(peer_id),
            None | Some(ConnectionState::Disconnected) | Some(ConnectionState::Reconnecting)
        ) {
            notifier.status(peer_id, ConnectionState::Discovering);
        }
    }

    fn send_handshake(&mut self, peer: PeerRef, remote_id: String) {
        if self.pending.contains(&peer) || self.pending.contains_peer_id(&remote_id) {
            log::debug!("Handshake to {} already pending", short_id(&remote_id));
            return;
        }
        if self.at_capacity() {
            log::warn!(
                "Not connecting to {}: maximum connections reached ({})",
                short_id(&remote_id),
                self.shared.registry.capacity()
            );
            return;
        }

        let handshake = ControlMessage::Handshake(self.local_id().to_string()).encode();
        match self.transport.send_control(&peer, &handshake) {
            Ok(()) => {
                log::info!("Sent handshake to {} via {}", short_id(&remote_id), peer);
                self.pending.insert(peer, remote_id.clone());
                self.shared
                    .notifier
                    .status(&remote_id, ConnectionState::Negotiating);
            }
            Err(e) => self.fail(&remote_id, &format!("handshake send failed: {}", e)),
        }
    }

    fn at_capacity(&self) -> bool {
        self.shared.registry.len() + self.establishing.len() >= self.shared.registry.capacity()
    }

    // ========================================================================
    // Control Messages
    // ========================================================================

    fn on_control(&mut self, peer: PeerRef, payload: &[u8]) {
        match ControlMessage::decode(payload) {
            Some(ControlMessage::Handshake(remote_id)) => self.on_handshake(peer, remote_id),
            Some(ControlMessage::Port(port)) => self.on_port(peer, port),
            Some(ControlMessage::Heartbeat) => {
                let conn = match self.peer_ids.get(&peer) {
                    Some(id) => self.shared.registry.get(id),
                    None => self.shared.registry.find_by_peer_ref(&peer),
                };
                if let Some(conn) = conn {
                    conn.touch();
                }
            }
            None if is_system_message(payload) => {
                log::debug!("Unusable control message from {}", self.describe(&peer));
            }
            None => {
                log::warn!(
                    "Unexpected {}-byte side-channel payload from {}",
                    payload.len(),
                    self.describe(&peer)
                );
            }
        }
    }

    /// Short identity for a reference when we know it, the reference otherwise
    fn describe(&self, peer: &PeerRef) -> String {
        match self.peer_ids.get(peer) {
            Some(id) => short_id(id).to_string(),
            None => peer.to_string(),
        }
    }

    fn on_handshake(&mut self, peer: PeerRef, remote_id: String) {
        if !is_valid_device_id(&remote_id) {
            log::warn!("Handshake from {} carries an invalid device ID", peer);
            return;
        }

        // Recompute rather than trust the initiator's claim
        let role = negotiate_role(self.local_id(), &remote_id);
        if role != Role::Responder {
            log::warn!(
                "Ignoring handshake from {}: negotiated role is {}",
                short_id(&remote_id),
                role
            );
            return;
        }

        self.remember(&peer, &remote_id);

        if self.establishing.contains_key(&remote_id) {
            log::debug!("Duplicate handshake from {}", short_id(&remote_id));
            return;
        }

        // The initiator only handshakes when it has no connection, so ours is stale
        if let Some(stale) = self.shared.registry.get(&remote_id) {
            log::info!(
                "{} re-handshook, replacing existing connection",
                short_id(&remote_id)
            );
            self.shared.teardown(&stale, "peer re-established");
        }

        if self.at_capacity() {
            log::warn!(
                "Declining handshake from {}: maximum connections reached ({})",
                short_id(&remote_id),
                self.shared.registry.capacity()
            );
            return;
        }

        // open_listener and the PORT send share the resolve budget
        let config = &self.shared.config;
        let budget = config.resolve_timeout() + config.accept_timeout();
        self.begin_establishing(&remote_id, budget);
        self.shared
            .notifier
            .status(&remote_id, ConnectionState::Connecting);

        let transport = self.transport.clone();
        let events = self.events.clone();
        let accept_timeout = self.shared.config.accept_timeout();
        let worker_peer = peer.clone();
        let worker_id = remote_id.clone();
        self.spawn_worker(&peer, &remote_id, "accept", move || {
            let result = respond(transport.as_ref(), &worker_peer, accept_timeout);
            report(&events, worker_peer, worker_id, Role::Responder, result);
        });
    }

    fn on_port(&mut self, peer: PeerRef, port: u16) {
        let remote_id = match self.pending.remove(&peer) {
            Some(id) => id,
            None => {
                log::warn!(
                    "Ignoring unsolicited PORT:{} from {}",
                    port,
                    self.describe(&peer)
                );
                return;
            }
        };

        if self.shared.registry.contains(&remote_id) || self.establishing.contains_key(&remote_id) {
            log::debug!("Ignoring PORT from {}: already connected", short_id(&remote_id));
            return;
        }

        log::info!("{} is listening on port {}", short_id(&remote_id), port);
        let config = &self.shared.config;
        let budget = config.resolve_timeout() + config.connect_timeout();
        self.begin_establishing(&remote_id, budget);
        self.shared
            .notifier
            .status(&remote_id, ConnectionState::Connecting);

        let transport = self.transport.clone();
        let events = self.events.clone();
        let resolve_timeout = self.shared.config.resolve_timeout();
        let connect_timeout = self.shared.config.connect_timeout();
        let worker_peer = peer.clone();
        let worker_id = remote_id.clone();
        self.spawn_worker(&peer, &remote_id, "connect", move || {
            let result = initiate(
                transport.as_ref(),
                &worker_peer,
                port,
                resolve_timeout,
                connect_timeout,
            )
            .map(|stream| (stream, None));
            report(&events, worker_peer, worker_id, Role::Initiator, result);
        });
    }

    fn spawn_worker<F>(&mut self, peer: &PeerRef, peer_id: &str, kind: &str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("peerlink-{}-{}", kind, short_id(peer_id));
        if let Err(e) = thread::Builder::new().name(name).spawn(work) {
            self.on_establish_failed(peer, peer_id, &format!("worker spawn failed: {}", e));
        }
    }

    // ========================================================================
    // Establishment Results
    // ========================================================================

    fn on_established(
        &mut self,
        peer: PeerRef,
        peer_id: String,
        role: Role,
        stream: TcpStream,
        listener: Option<TcpListener>,
    ) {
        self.establishing.remove(&peer_id);

        if !self.shared.is_running() {
            log::debug!("Discarding stream to {}: stopped", short_id(&peer_id));
            return;
        }

        // One heartbeat interval, never past the idle threshold
        let config = &self.shared.config;
        let write_timeout = config.heartbeat_interval().min(config.idle_threshold());
        if let Err(e) = stream.set_write_timeout(Some(write_timeout)) {
            self.fail(&peer_id, &format!("stream setup failed: {}", e));
            return;
        }
        let conn = match PeerConnection::new(peer_id.clone(), peer, role, stream, listener) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                self.fail(&peer_id, &format!("stream setup failed: {}", e));
                return;
            }
        };

        if self.shared.registry.contains(&peer_id) {
            log::debug!("Discarding duplicate stream to {}", short_id(&peer_id));
            conn.close();
            return;
        }

        if !self.shared.registry.add(&peer_id, conn.clone()) {
            conn.close();
            self.fail(
                &peer_id,
                &LinkError::CapacityReached(self.shared.registry.capacity()).to_string(),
            );
            return;
        }

        Metrics::incr(&self.shared.metrics.connections_established_total);
        log::info!(
            "Connected to {} as {} ({} total)",
            short_id(&peer_id),
            role,
            self.shared.registry.len()
        );
        self.shared.activate(conn);
    }

    fn on_establish_failed(&mut self, peer: &PeerRef, peer_id: &str, reason: &str) {
        self.pending.remove(peer);
        if self.establishing.remove(peer_id).is_none() {
            log::debug!(
                "Late failure for {} ignored, already given up: {}",
                short_id(peer_id),
                reason
            );
            return;
        }

        if self.shared.registry.contains(peer_id) {
            log::debug!(
                "Late failure for {} ignored, already connected: {}",
                short_id(peer_id),
                reason
            );
            return;
        }
        self.fail(peer_id, reason);
    }

    /// Terminal establishment failure: count, log, report DISCONNECTED
    fn fail(&mut self, peer_id: &str, reason: &str) {
        Metrics::incr(&self.shared.metrics.establishment_failures_total);
        log::warn!("Connection to {} failed: {}", short_id(peer_id), reason);
        self.shared
            .notifier
            .status(peer_id, ConnectionState::Disconnected);
    }

    fn on_unavailable(&mut self, reason: &str) {
        if self.unavailable_reported {
            log::debug!("Discovery still unavailable: {}", reason);
            return;
        }
        self.unavailable_reported = true;
        log::error!("Discovery unavailable: {}", reason);

        let local_id = self.local_id().to_string();
        self.shared
            .notifier
            .status(&local_id, ConnectionState::Disconnected);
        self.shared.notifier.message(
            InboundMessage::system(format!("[Error] Discovery unavailable: {}", reason)),
            None,
        );
    }

    /// Give up on lost PORT replies and on workers stuck past their budget
    fn expire_stale(&mut self) {
        let now = Instant::now();
        self.last_tick = now;
        for (peer, peer_id) in self.pending.expire(self.shared.config.handshake_timeout()) {
            self.peer_ids.retain(|_, id| *id != peer_id);
            self.fail(&peer_id, &format!("no PORT reply from {}", peer));
        }

        let overdue: Vec<String> = self
            .establishing
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in overdue {
            self.establishing.remove(&peer_id);
            self.fail(&peer_id, "establishment did not finish in time");
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Responder side: listen, announce the port, accept one stream
fn respond(
    transport: &dyn DiscoveryTransport,
    peer: &PeerRef,
    accept_timeout: Duration,
) -> Result<(TcpStream, Option<TcpListener>), LinkError> {
    let listener = transport.open_listener(peer)?;
    let port = listener.local_addr()?.port();

    transport.send_control(peer, &ControlMessage::Port(port).encode())?;
    log::debug!("Listening on port {} for {}", port, peer);

    let stream = accept_once(&listener, accept_timeout)?;
    Ok((stream, Some(listener)))
}

/// Initiator side: resolve the responder's endpoint and connect
fn initiate(
    transport: &dyn DiscoveryTransport,
    peer: &PeerRef,
    port: u16,
    resolve_timeout: Duration,
    connect_timeout: Duration,
) -> Result<TcpStream, LinkError> {
    let addr = transport.resolve_endpoint(peer, port, resolve_timeout)?;
    log::debug!("Connecting to {} at {}", peer, addr);
    connect(addr, connect_timeout)
}

fn report(
    events: &Sender<LinkEvent>,
    peer: PeerRef,
    peer_id: String,
    role: Role,
    result: Result<(TcpStream, Option<TcpListener>), LinkError>,
) {
    let event = match result {
        Ok((stream, listener)) => LinkEvent::Established {
            peer,
            peer_id,
            role,
            stream,
            listener,
        },
        Err(e) => LinkEvent::EstablishFailed {
            peer,
            peer_id,
            reason: e.to_string(),
        },
    };
    // Dispatcher gone means we are shutting down; the stream just drops
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::connection::test_support::socket_pair;
    use crate::manager::test_support::shared_with_events;
    use crate::transport::{encode_service_info, DiscoverySink};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::mpsc;
    use std::sync::Mutex;

    /// Transport that records control sends and never delivers them
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(PeerRef, Vec<u8>)>>,
        /// Resolution blocks this long, whatever timeout it is given
        resolve_stall: Option<Duration>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(PeerRef, String)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(p, b)| (p.clone(), String::from_utf8_lossy(b).into_owned()))
                .collect()
        }
    }

    impl DiscoveryTransport for RecordingTransport {
        fn attach(&self, _: &str, _: &[u8], _: DiscoverySink) -> Result<(), LinkError> {
            Ok(())
        }

        fn detach(&self) {}

        fn send_control(&self, peer: &PeerRef, payload: &[u8]) -> Result<(), LinkError> {
            self.sent
                .lock()
                .unwrap()
                .push((peer.clone(), payload.to_vec()));
            Ok(())
        }

        fn open_listener(&self, _: &PeerRef) -> Result<TcpListener, LinkError> {
            Ok(TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?)
        }

        fn resolve_endpoint(
            &self,
            _: &PeerRef,
            port: u16,
            _: Duration,
        ) -> Result<SocketAddr, LinkError> {
            if let Some(stall) = self.resolve_stall {
                std::thread::sleep(stall);
            }
            Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        }
    }

    /// Local ID plus one remote ID that makes us the initiator and one that
    /// makes us the responder
    fn ids() -> (String, String, String) {
        let local = "local-device".to_string();
        let mut initiator_target = None;
        let mut responder_target = None;
        for i in 0.. {
            let candidate = format!("remote-{}", i);
            match negotiate_role(&local, &candidate) {
                Role::Initiator if initiator_target.is_none() => initiator_target = Some(candidate),
                Role::Responder if responder_target.is_none() => responder_target = Some(candidate),
                _ => {}
            }
            if let (Some(a), Some(b)) = (&initiator_target, &responder_target) {
                return (local, a.clone(), b.clone());
            }
        }
        unreachable!()
    }

    fn orchestrator(
        local: &str,
        config: LinkConfig,
    ) -> (Orchestrator, Arc<RecordingTransport>, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel();
        let shared = shared_with_events(local, config);
        let transport = Arc::new(RecordingTransport::default());
        let orch = Orchestrator::new(shared, transport.clone(), tx);
        (orch, transport, rx)
    }

    fn discovered(peer: &str, id: &str) -> LinkEvent {
        LinkEvent::PeerDiscovered {
            peer: PeerRef::new(peer),
            service_info: encode_service_info(id),
        }
    }

    #[test]
    fn test_pending_handshakes_dedup_and_expiry() {
        let mut pending = PendingHandshakes::new();
        assert!(pending.insert(PeerRef::new("r1"), "peer-a"));
        assert!(!pending.insert(PeerRef::new("r1"), "peer-b"));
        assert!(!pending.insert(PeerRef::new("r2"), "peer-a"));
        assert!(pending.contains_peer_id("peer-a"));

        assert!(pending.expire(Duration::from_secs(60)).is_empty());
        let expired = pending.expire(Duration::ZERO);
        assert_eq!(expired, vec![(PeerRef::new("r1"), "peer-a".to_string())]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_initiator_sends_one_handshake_for_racing_discoveries() {
        let (local, remote, _) = ids();
        let (mut orch, transport, _rx) = orchestrator(&local, LinkConfig::default());

        // Same identity seen through two discovery sub-channels
        orch.handle(discovered("sub-a", &remote));
        orch.handle(discovered("sub-b", &remote));
        orch.handle(discovered("sub-a", &remote));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PeerRef::new("sub-a"));
        assert_eq!(sent[0].1, format!("HANDSHAKE:{}", local));
        assert_eq!(orch.pending().len(), 1);
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Negotiating)
        );
    }

    #[test]
    fn test_responder_stays_passive_on_discovery() {
        let (local, _, remote) = ids();
        let (mut orch, transport, _rx) = orchestrator(&local, LinkConfig::default());

        orch.handle(discovered("r", &remote));
        assert!(transport.sent().is_empty());
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Discovering)
        );
    }

    #[test]
    fn test_self_discovery_and_bad_service_info_ignored() {
        let (local, _, _) = ids();
        let (mut orch, transport, _rx) = orchestrator(&local, LinkConfig::default());

        orch.handle(discovered("me", &local));
        orch.handle(LinkEvent::PeerDiscovered {
            peer: PeerRef::new("junk"),
            service_info: vec![],
        });
        assert!(transport.sent().is_empty());
        assert!(orch.shared.notifier.state(&local).is_none());
    }

    #[test]
    fn test_handshake_with_wrong_role_is_ignored() {
        let (local, we_initiate_to, _) = ids();
        let (mut orch, transport, rx) = orchestrator(&local, LinkConfig::default());

        orch.handle(LinkEvent::ControlReceived {
            peer: PeerRef::new("r"),
            payload: format!("HANDSHAKE:{}", we_initiate_to).into_bytes(),
        });
        assert!(transport.sent().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsolicited_port_is_ignored() {
        let (local, _, _) = ids();
        let (mut orch, _transport, rx) = orchestrator(&local, LinkConfig::default());

        orch.handle(LinkEvent::ControlReceived {
            peer: PeerRef::new("stranger"),
            payload: b"PORT:4242".to_vec(),
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_responder_announces_port_and_accepts() {
        let (local, _, remote) = ids();
        let (mut orch, transport, rx) = orchestrator(&local, LinkConfig::default());

        orch.handle(LinkEvent::ControlReceived {
            peer: PeerRef::new("r"),
            payload: format!("HANDSHAKE:{}", remote).into_bytes(),
        });

        // Wait for the worker's PORT announcement, then connect to it
        let port = loop {
            if let Some((_, msg)) = transport.sent().into_iter().next() {
                break crate::control::parse_port(&msg).unwrap();
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            LinkEvent::Established {
                peer_id,
                role,
                listener,
                ..
            } => {
                assert_eq!(peer_id, remote);
                assert_eq!(role, Role::Responder);
                assert!(listener.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_expired_handshake_reports_disconnected() {
        let (local, remote, _) = ids();
        let config = LinkConfig {
            handshake_timeout_ms: 1,
            ..LinkConfig::default()
        };
        let (mut orch, _transport, _rx) = orchestrator(&local, config);

        orch.handle(discovered("r", &remote));
        assert_eq!(orch.pending().len(), 1);

        std::thread::sleep(Duration::from_millis(5));
        orch.handle(LinkEvent::Tick);
        assert!(orch.pending().is_empty());
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(
            orch.shared
                .metrics
                .establishment_failures_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_stuck_resolution_is_abandoned() {
        let (local, remote, _) = ids();
        let config = LinkConfig {
            resolve_timeout_ms: 100,
            connect_timeout_ms: 100,
            ..LinkConfig::default()
        };
        let (tx, _rx) = mpsc::channel();
        let transport = Arc::new(RecordingTransport {
            resolve_stall: Some(Duration::from_secs(3600)),
            ..RecordingTransport::default()
        });
        let mut orch = Orchestrator::new(shared_with_events(&local, config), transport, tx);

        orch.handle(discovered("r", &remote));
        orch.handle(LinkEvent::ControlReceived {
            peer: PeerRef::new("r"),
            payload: b"PORT:4000".to_vec(),
        });
        orch.handle(LinkEvent::Tick);
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Connecting)
        );

        std::thread::sleep(Duration::from_millis(250));
        orch.handle(LinkEvent::Tick);
        assert!(orch.establishing.is_empty());
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Disconnected)
        );

        // The identity is free again: the next discovery restarts the handshake
        orch.handle(discovered("r", &remote));
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Negotiating)
        );

        // A failure reported after we gave up is not counted twice
        orch.handle(LinkEvent::EstablishFailed {
            peer: PeerRef::new("elsewhere"),
            peer_id: remote.clone(),
            reason: "resolution gave up".into(),
        });
        assert_eq!(
            orch.shared
                .metrics
                .establishment_failures_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_peer_references_are_pruned() {
        let (local, remote, _) = ids();
        let config = LinkConfig {
            handshake_timeout_ms: 1,
            ..LinkConfig::default()
        };
        let (mut orch, _transport, _rx) = orchestrator(&local, config);

        orch.handle(discovered("old-handle", &remote));
        orch.handle(discovered("new-handle", &remote));
        assert_eq!(orch.peer_ids.len(), 1);
        assert!(orch.peer_ids.contains_key(&PeerRef::new("new-handle")));

        std::thread::sleep(Duration::from_millis(5));
        orch.handle(LinkEvent::Tick);
        assert!(orch.pending().is_empty());
        assert!(orch.peer_ids.is_empty());
    }

    #[test]
    fn test_established_stream_write_timeout_follows_heartbeat() {
        let (local, remote, _) = ids();
        let config = LinkConfig {
            heartbeat_interval_ms: 500,
            ..LinkConfig::default()
        };
        let (mut orch, _transport, _rx) = orchestrator(&local, config);

        let (stream, _far) = socket_pair();
        orch.handle(LinkEvent::Established {
            peer: PeerRef::new("r"),
            peer_id: remote.clone(),
            role: Role::Initiator,
            stream,
            listener: None,
        });

        let conn = orch.shared.registry.get(&remote).unwrap();
        assert_eq!(
            conn.reader().unwrap().write_timeout().unwrap(),
            Some(Duration::from_millis(500))
        );
        orch.shared.stop_for_test();
    }

    #[test]
    fn test_duplicate_established_stream_is_discarded() {
        let (local, remote, _) = ids();
        let (mut orch, _transport, _rx) = orchestrator(&local, LinkConfig::default());

        let (first, _far1) = socket_pair();
        let (second, _far2) = socket_pair();
        for stream in [first, second] {
            orch.handle(LinkEvent::Established {
                peer: PeerRef::new("r"),
                peer_id: remote.clone(),
                role: Role::Initiator,
                stream,
                listener: None,
            });
        }

        assert_eq!(orch.shared.registry.len(), 1);
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Connected)
        );
        orch.shared.stop_for_test();
    }

    #[test]
    fn test_established_beyond_capacity_is_declined() {
        let (local, remote, _) = ids();
        let config = LinkConfig {
            max_connections: 1,
            ..LinkConfig::default()
        };
        let (mut orch, _transport, _rx) = orchestrator(&local, config);

        let (first, _far1) = socket_pair();
        orch.handle(LinkEvent::Established {
            peer: PeerRef::new("r1"),
            peer_id: "someone-else".to_string(),
            role: Role::Initiator,
            stream: first,
            listener: None,
        });
        let (second, _far2) = socket_pair();
        orch.handle(LinkEvent::Established {
            peer: PeerRef::new("r2"),
            peer_id: remote.clone(),
            role: Role::Initiator,
            stream: second,
            listener: None,
        });

        assert_eq!(orch.shared.registry.peer_ids(), vec!["someone-else".to_string()]);
        assert_eq!(
            orch.shared.notifier.state(&remote),
            Some(ConnectionState::Disconnected)
        );
        orch.shared.stop_for_test();
    }

    #[test]
    fn test_unavailable_reported_once() {
        let (local, _, _) = ids();
        let (mut orch, _transport, _rx) = orchestrator(&local, LinkConfig::default());
        let seen = orch.shared.notifier.record_messages();

        orch.handle(LinkEvent::DiscoveryUnavailable {
            reason: "radio off".into(),
        });
        orch.handle(LinkEvent::DiscoveryUnavailable {
            reason: "radio off".into(),
        });

        let messages = seen.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].content.as_text(),
            Some("[Error] Discovery unavailable: radio off")
        );
    }

    #[test]
    fn test_shutdown_stops_handling() {
        let (local, _, _) = ids();
        let (mut orch, _transport, _rx) = orchestrator(&local, LinkConfig::default());
        assert!(orch.handle(LinkEvent::Tick));
        assert!(!orch.handle(LinkEvent::Shutdown));
    }
}
