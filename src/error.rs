//! Error types for the peer link subsystem
//!
//! Every failure path in the crate funnels into [`LinkError`]. Callers of the
//! public API see these as plain `Result`s; nothing in here is allowed to
//! take the process down.

use std::io;

use crate::crypto::CryptoError;
use crate::framing::MAX_FRAME_LEN;

/// Errors surfaced by the link layer
#[derive(Debug)]
pub enum LinkError {
    /// Underlying socket or file I/O failed
    Io(io::Error),
    /// A bounded wait expired (resolve, connect, accept)
    Timeout(&'static str),
    /// The discovery/transport collaborator reported a failure
    Transport(String),
    /// Frame header carried a length outside `1..=MAX_FRAME_LEN`
    InvalidFrameLength(i64),
    /// Outgoing payload exceeds `MAX_FRAME_LEN`
    FrameTooLarge(usize),
    /// Envelope or content could not be (de)serialized
    Serialization(String),
    /// Registry is at capacity
    CapacityReached(usize),
    /// Encryption, decryption or signing failed
    Crypto(CryptoError),
    /// No live connection to the given peer
    NotConnected(String),
    /// The target identity is our own
    SelfConnection,
    /// Discovery has not been started (or was stopped)
    NotRunning,
    /// Discovery is already running
    AlreadyRunning,
    /// Invalid configuration
    Config(String),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Io(e) => write!(f, "i/o error: {}", e),
            LinkError::Timeout(what) => write!(f, "timed out waiting for {}", what),
            LinkError::Transport(msg) => write!(f, "transport error: {}", msg),
            LinkError::InvalidFrameLength(len) => write!(
                f,
                "invalid frame length: {} (must be 1..={})",
                len, MAX_FRAME_LEN
            ),
            LinkError::FrameTooLarge(size) => write!(
                f,
                "frame too large: {} bytes (max {})",
                size, MAX_FRAME_LEN
            ),
            LinkError::Serialization(e) => write!(f, "serialization error: {}", e),
            LinkError::CapacityReached(max) => {
                write!(f, "maximum connections reached ({})", max)
            }
            LinkError::Crypto(e) => write!(f, "crypto error: {}", e),
            LinkError::NotConnected(peer) => write!(f, "not connected to {}", peer),
            LinkError::SelfConnection => write!(f, "target is this device"),
            LinkError::NotRunning => write!(f, "discovery is not running"),
            LinkError::AlreadyRunning => write!(f, "discovery already running"),
            LinkError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Io(e) => Some(e),
            LinkError::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            return LinkError::Timeout("socket");
        }
        LinkError::Io(e)
    }
}

impl From<CryptoError> for LinkError {
    fn from(e: CryptoError) -> Self {
        LinkError::Crypto(e)
    }
}

impl From<bincode::Error> for LinkError {
    fn from(e: bincode::Error) -> Self {
        LinkError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::Serialization(e.to_string())
    }
}

impl LinkError {
    /// Whether the underlying stream can no longer be trusted to be in sync
    ///
    /// Stream-fatal errors tear the connection down; anything else only
    /// affects the single message being processed.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_) | LinkError::Timeout(_) | LinkError::InvalidFrameLength(_)
        )
    }
}
