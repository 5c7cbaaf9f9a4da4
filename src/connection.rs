//! Established peer connections and their lifecycle states

use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::LinkError;
use crate::identity::{short_id, Role};

// ============================================================================
// Peer Reference
// ============================================================================

/// Opaque handle for a discovered endpoint, owned by the discovery layer
///
/// The orchestrator only ever uses it as a lookup key and hands it back to
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerRef(String);

impl PeerRef {
    pub fn new(handle: impl Into<String>) -> Self {
        PeerRef(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Per-peer link state reported through the status callback
///
/// ```text
/// Discovering → Negotiating → Connecting → Connected
///       ▲                                     │
///       │                                     ▼
///  Reconnecting ◄──────────────────────  Disconnected
/// ```
///
/// Any state may drop straight to `Disconnected` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Discovering,
    Negotiating,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Discovering, Negotiating) | (Discovering, Connecting) => true,
            (Negotiating, Connecting) => true,
            (Connecting, Connected) => true,
            (Disconnected, Reconnecting) => true,
            // A fresh discovery may restart the cycle at any point short of Connected
            (Reconnecting, Discovering)
            | (Reconnecting, Negotiating)
            | (Reconnecting, Connecting)
            | (Disconnected, Discovering)
            | (Disconnected, Negotiating)
            | (Disconnected, Connecting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Discovering => "DISCOVERING",
            ConnectionState::Negotiating => "NEGOTIATING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Peer Connection
// ============================================================================

/// One established stream to one peer
///
/// The write half sits behind a mutex so frames from concurrent senders
/// never interleave. The read half is handed to a dedicated read loop via
/// [`PeerConnection::reader`]; [`PeerConnection::close`] shuts the socket
/// down in both directions, which is what unblocks that loop.
#[derive(Debug)]
pub struct PeerConnection {
    peer_id: String,
    peer_ref: PeerRef,
    role: Role,
    /// Serialized write half
    writer: Mutex<TcpStream>,
    /// Handle used for shutdown and liveness queries
    socket: TcpStream,
    /// Responder's listening socket, released on close
    listener: Mutex<Option<TcpListener>>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    alive: AtomicBool,
}

impl PeerConnection {
    /// Wrap an established stream
    pub fn new(
        peer_id: impl Into<String>,
        peer_ref: PeerRef,
        role: Role,
        stream: TcpStream,
        listener: Option<TcpListener>,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let now = Instant::now();

        Ok(Self {
            peer_id: peer_id.into(),
            peer_ref,
            role,
            writer: Mutex::new(writer),
            socket: stream,
            listener: Mutex::new(listener),
            created_at: now,
            last_activity: Mutex::new(now),
            alive: AtomicBool::new(true),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_ref(&self) -> &PeerRef {
        &self.peer_ref
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Independent read handle for the read loop
    pub fn reader(&self) -> io::Result<TcpStream> {
        self.socket.try_clone()
    }

    /// Run `f` with exclusive access to the write half
    pub fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut TcpStream) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        if !self.is_alive() {
            return Err(LinkError::NotConnected(self.peer_id.clone()));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut writer)
    }

    /// Record traffic in either direction
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the last observed traffic
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: Instant) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the underlying transport still looks connected
    pub fn is_transport_connected(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.socket.take_error() {
            Ok(None) => self.socket.peer_addr().is_ok(),
            _ => false,
        }
    }

    /// Release the stream and listener
    ///
    /// Idempotent. Returns `true` on the call that actually closed it.
    pub fn close(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        // Shut down even if a read loop already marked us dead: the socket
        // itself is still open until this point.
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("Shutdown for {} failed: {}", short_id(&self.peer_id), e);
            }
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(listener);
        was_alive
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::net::TcpListener;

    /// A connected loopback socket pair: (ours, theirs)
    pub fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// A connection to a throwaway peer; the far end is returned so the
    /// caller controls its lifetime.
    pub fn connection(peer_id: &str, role: Role) -> (PeerConnection, TcpStream) {
        let (ours, theirs) = socket_pair();
        let conn = PeerConnection::new(peer_id, PeerRef::new(peer_id), role, ours, None).unwrap();
        (conn, theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::io::Read;

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Discovering.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Discovering));

        assert!(!Discovering.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Reconnecting.can_transition_to(Connected));
    }

    #[test]
    fn test_new_connection_is_alive_and_fresh() {
        let (conn, _far) = connection("peer-a", Role::Initiator);
        assert!(conn.is_alive());
        assert!(conn.is_transport_connected());
        assert!(conn.idle_for() < Duration::from_secs(1));
        assert_eq!(conn.role(), Role::Initiator);
    }

    #[test]
    fn test_touch_updates_activity() {
        let (conn, _far) = connection("peer-a", Role::Initiator);
        conn.set_last_activity(Instant::now() - Duration::from_secs(90));
        assert!(conn.idle_for() >= Duration::from_secs(90));
        conn.touch();
        assert!(conn.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn test_close_unblocks_reader_and_is_idempotent() {
        let (conn, _far) = connection("peer-a", Role::Responder);
        let mut reader = conn.reader().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(conn.close());
        assert!(!conn.close());

        // Read returns (EOF or error) instead of blocking forever
        let result = handle.join().unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));
        assert!(!conn.is_transport_connected());
    }

    #[test]
    fn test_writer_refuses_after_close() {
        let (conn, _far) = connection("peer-a", Role::Initiator);
        conn.close();
        let result = conn.with_writer(|_| Ok(()));
        assert!(matches!(result, Err(LinkError::NotConnected(_))));
    }
}
