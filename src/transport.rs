//! Discovery/transport collaborator boundary
//!
//! The radio discovery service is external. It reports discovered peers and
//! raw side-channel payloads through a [`DiscoverySink`], carries outgoing
//! control messages, and opens the actual byte streams. Stream setup is
//! split into the half the collaborator owns (opening a listener scoped to a
//! peer, resolving a peer's endpoint) and the half done here with plain
//! sockets and bounded waits ([`accept_once`], [`connect`]).

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};

use crate::connection::PeerRef;
use crate::error::LinkError;
use crate::identity::is_valid_device_id;
use crate::orchestrator::LinkEvent;

const LISTENER_TOKEN: Token = Token(0);

// ============================================================================
// Collaborator Trait
// ============================================================================

/// What the orchestrator needs from the discovery layer
pub trait DiscoveryTransport: Send + Sync + 'static {
    /// Start publishing/subscribing; events flow into `sink` until `detach`
    fn attach(
        &self,
        service_name: &str,
        service_info: &[u8],
        sink: DiscoverySink,
    ) -> Result<(), LinkError>;

    fn detach(&self);

    /// Send a control payload over the discovery side-channel
    fn send_control(&self, peer: &PeerRef, payload: &[u8]) -> Result<(), LinkError>;

    /// Open a listening endpoint on an ephemeral port reachable by `peer`
    fn open_listener(&self, peer: &PeerRef) -> Result<TcpListener, LinkError>;

    /// Negotiate the data path to `peer` and return the address to connect to
    fn resolve_endpoint(
        &self,
        peer: &PeerRef,
        port: u16,
        timeout: Duration,
    ) -> Result<SocketAddr, LinkError>;
}

// ============================================================================
// Event Sink
// ============================================================================

/// Handle the discovery layer uses to report into the orchestrator
///
/// Every method returns `false` once the orchestrator has shut down.
#[derive(Debug, Clone)]
pub struct DiscoverySink {
    events: Sender<LinkEvent>,
}

impl DiscoverySink {
    pub fn new(events: Sender<LinkEvent>) -> Self {
        Self { events }
    }

    pub fn peer_discovered(&self, peer: PeerRef, service_info: Vec<u8>) -> bool {
        self.events
            .send(LinkEvent::PeerDiscovered { peer, service_info })
            .is_ok()
    }

    pub fn control_received(&self, peer: PeerRef, payload: Vec<u8>) -> bool {
        self.events
            .send(LinkEvent::ControlReceived { peer, payload })
            .is_ok()
    }

    /// Discovery is unavailable (permission, radio off, ...)
    pub fn unavailable(&self, reason: impl Into<String>) -> bool {
        self.events
            .send(LinkEvent::DiscoveryUnavailable {
                reason: reason.into(),
            })
            .is_ok()
    }
}

// ============================================================================
// Service Info
// ============================================================================

/// Service info published alongside the service: the device ID
pub fn encode_service_info(device_id: &str) -> Vec<u8> {
    device_id.as_bytes().to_vec()
}

/// Remote device ID from published service info
pub fn decode_service_info(service_info: &[u8]) -> Option<String> {
    let id = std::str::from_utf8(service_info).ok()?;
    if !is_valid_device_id(id) {
        return None;
    }
    Some(id.to_string())
}

// ============================================================================
// Bounded Socket Helpers
// ============================================================================

/// Accept exactly one inbound stream, giving up after `timeout`
///
/// The listener is switched to non-blocking mode. The returned stream is
/// blocking.
pub fn accept_once(listener: &TcpListener, timeout: Duration) -> Result<TcpStream, LinkError> {
    listener.set_nonblocking(true)?;
    let mut watched = mio::net::TcpListener::from_std(listener.try_clone()?);

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut watched, LISTENER_TOKEN, Interest::READABLE)?;
    let mut events = Events::with_capacity(8);
    let deadline = Instant::now() + timeout;

    loop {
        // Drain first: a connection may already be queued before we poll
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                log::debug!("Accepted inbound stream from {}", addr);
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LinkError::Timeout("inbound connection"));
        }

        match poll.poll(&mut events, Some(remaining)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Open an outbound stream, giving up after `timeout`
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, LinkError> {
    TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LinkError::Timeout("connect"),
        _ => LinkError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::mpsc;

    #[test]
    fn test_accept_once_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let started = Instant::now();
        let result = accept_once(&listener, Duration::from_millis(100));

        assert!(matches!(result, Err(LinkError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_accept_once_returns_blocking_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut stream = connect(addr, Duration::from_secs(2)).unwrap();
            stream.write_all(b"ping").unwrap();
            stream
        });

        let mut accepted = accept_once(&listener, Duration::from_secs(5)).unwrap();
        let mut buf = [0u8; 4];
        // Would fail with WouldBlock if the stream were still non-blocking
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        drop(client.join().unwrap());
    }

    #[test]
    fn test_accept_once_picks_up_queued_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();

        assert!(accept_once(&listener, Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_connect_refused_is_io_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let result = connect(addr, Duration::from_secs(2));
        assert!(matches!(result, Err(LinkError::Io(_))));
    }

    #[test]
    fn test_service_info() {
        assert_eq!(
            decode_service_info(&encode_service_info("abc123")),
            Some("abc123".to_string())
        );
        assert_eq!(decode_service_info(b""), None);
        assert_eq!(decode_service_info(b"has space"), None);
        assert_eq!(decode_service_info(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_sink_reports_closed_orchestrator() {
        let (tx, rx) = mpsc::channel();
        let sink = DiscoverySink::new(tx);

        assert!(sink.peer_discovered(PeerRef::new("a"), b"id-a".to_vec()));
        assert!(matches!(
            rx.recv().unwrap(),
            LinkEvent::PeerDiscovered { .. }
        ));

        drop(rx);
        assert!(!sink.control_received(PeerRef::new("a"), b"PORT:1".to_vec()));
    }
}
