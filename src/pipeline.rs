//! Message pipeline: envelope sealing, framing and the inverse on receipt
//!
//! ```text
//! Content ──► seal ──► ChatEnvelope ──► bincode ──► write_frame ──► stream
//!              │
//!              ├─ trusted peer:   encrypt(peer key), attach own public key
//!              └─ untrusted peer: plaintext (flagged on receipt)
//!
//! stream ──► read_frame ──► bincode ──► open ──► Heartbeat (dropped)
//!                                          └──► InboundMessage
//! ```

use std::io::Read;
use std::sync::Arc;

use crate::connection::PeerConnection;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::envelope::{Body, ChatEnvelope, Content, InboundMessage, MessageSecurity};
use crate::error::LinkError;
use crate::framing::{read_frame, write_frame};
use crate::identity::short_id;
use crate::trust::TrustStore;

/// Result of opening a received envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Liveness probe; never forwarded to the application
    Heartbeat,
    Message(InboundMessage),
}

pub struct MessagePipeline {
    local_id: String,
    crypto: Arc<dyn CryptoProvider>,
    trust: Arc<dyn TrustStore>,
}

impl MessagePipeline {
    pub fn new(
        local_id: impl Into<String>,
        crypto: Arc<dyn CryptoProvider>,
        trust: Arc<dyn TrustStore>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            crypto,
            trust,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Wrap `content` for `peer_id`, encrypting when the peer is trusted
    pub fn seal(&self, peer_id: &str, content: &Content) -> Result<ChatEnvelope, LinkError> {
        let body = match self.trust.peer_public_key(peer_id) {
            Some(key) => {
                let ciphertext = self.crypto.encrypt(&key, &content.to_bytes()?)?;
                let sender_public_key = self
                    .crypto
                    .identity_keypair()
                    .map(|pair| pair.public.to_bytes());
                Body::Encrypted {
                    ciphertext,
                    scheme: self.crypto.scheme().to_string(),
                    sender_public_key,
                }
            }
            None => {
                log::debug!("No trusted key for {}, sending plaintext", short_id(peer_id));
                Body::Plain(content.clone())
            }
        };
        Ok(ChatEnvelope::new(self.local_id.clone(), body))
    }

    /// Seal and write one message to `conn`
    pub fn send(&self, conn: &PeerConnection, content: &Content) -> Result<(), LinkError> {
        let envelope = self.seal(conn.peer_id(), content)?;
        write_envelope(conn, &envelope)?;
        conn.touch();
        Ok(())
    }

    /// Write a heartbeat through the same path as application traffic
    ///
    /// Our own heartbeats do not count as activity: only the peer's traffic
    /// (its heartbeats included) proves the peer is still there.
    pub fn send_heartbeat(&self, conn: &PeerConnection) -> Result<(), LinkError> {
        write_envelope(conn, &ChatEnvelope::heartbeat(self.local_id.clone()))
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Read and decode the next envelope
    ///
    /// Framing and I/O errors are stream-fatal. A frame that arrives intact
    /// but does not decode yields `LinkError::Serialization`, which callers
    /// drop without tearing the connection down.
    pub fn receive<R: Read + ?Sized>(&self, reader: &mut R) -> Result<ChatEnvelope, LinkError> {
        let frame = read_frame(reader)?;
        ChatEnvelope::from_bytes(&frame)
    }

    /// Decrypt if needed and classify
    pub fn open(&self, envelope: ChatEnvelope) -> Inbound {
        let (content, security) = match envelope.body {
            Body::Plain(content) => (content, MessageSecurity::Plaintext),
            Body::Encrypted {
                ciphertext, scheme, ..
            } => match self.decrypt(&ciphertext) {
                Ok(content) => (content, MessageSecurity::Encrypted { scheme }),
                Err(e) => {
                    log::warn!(
                        "Failed to decrypt message {} from {}: {}",
                        envelope.message_id,
                        short_id(&envelope.sender_id),
                        e
                    );
                    (
                        Content::Text(format!("[Decryption failed: {}]", e)),
                        MessageSecurity::DecryptionFailed,
                    )
                }
            },
        };

        if content.is_heartbeat() {
            return Inbound::Heartbeat;
        }

        Inbound::Message(InboundMessage {
            message_id: envelope.message_id,
            timestamp_ms: envelope.timestamp_ms,
            sender_id: envelope.sender_id,
            content,
            security,
        })
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Content, LinkError> {
        let pair = self
            .crypto
            .identity_keypair()
            .ok_or(CryptoError::MissingIdentity)?;
        let plaintext = self.crypto.decrypt(&pair.private, ciphertext)?;
        Content::from_bytes(&plaintext)
    }
}

fn write_envelope(conn: &PeerConnection, envelope: &ChatEnvelope) -> Result<(), LinkError> {
    let bytes = envelope.to_bytes()?;
    conn.with_writer(|writer| write_frame(writer, &bytes))
}
