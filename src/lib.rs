//! Peerlink: discovery-driven peer connection orchestrator
//!
//! Turns ad-hoc, unreliable "peer appeared" events from a local discovery
//! layer into a set of live, deduplicated, health-monitored byte streams,
//! one per peer, each with an agreed initiator/responder role, carrying
//! length-prefixed (optionally encrypted) message envelopes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Crate Structure                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  identity.rs     - Device IDs and role negotiation            │
//! │  control.rs      - HANDSHAKE / PORT / HEARTBEAT side-channel  │
//! │  transport.rs    - Discovery collaborator trait, bounded I/O  │
//! │  orchestrator.rs - Event dispatcher, pending handshakes       │
//! │  connection.rs   - PeerConnection and ConnectionState         │
//! │  registry.rs     - Capacity-bounded connection map            │
//! │  envelope.rs     - ChatEnvelope and delivery types            │
//! │  framing.rs      - 4-byte length-prefixed frames              │
//! │  crypto.rs       - Sealed boxes and signatures                │
//! │  trust.rs        - Trusted peer public keys                   │
//! │  pipeline.rs     - Seal/open + frame I/O                      │
//! │  health.rs       - Heartbeats and eviction                    │
//! │  manager.rs      - Application-facing LinkManager             │
//! │  loopback.rs     - In-process discovery medium                │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Data Flow
//!
//! discovery events → orchestrator → registry (on success) → pipeline
//! (ongoing traffic) → health monitor (periodic sweep) → eviction, then
//! continuous discovery re-acquires the peer.

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod connection;
pub mod control;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod health;
pub mod identity;
pub mod loopback;
pub mod manager;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod transport;
pub mod trust;

// Re-export commonly used types
pub use config::LinkConfig;
pub use connection::{ConnectionState, PeerConnection, PeerRef};
pub use control::ControlMessage;
pub use crypto::{CryptoError, CryptoProvider, IdentityKeyPair, PublicKey, SealedBoxCrypto};
pub use envelope::{ChatEnvelope, Content, InboundMessage, MessageSecurity, PayloadMetadata};
pub use error::LinkError;
pub use identity::{negotiate_role, DeviceIdentity, Role};
pub use loopback::{LoopbackMedium, LoopbackTransport};
pub use manager::LinkManager;
pub use metrics::Metrics;
pub use orchestrator::LinkEvent;
pub use registry::{ConnectionRegistry, RegistryStats};
pub use transport::{DiscoverySink, DiscoveryTransport};
pub use trust::{FileTrustStore, MemoryTrustStore, TrustStore};
