//! Application message envelope
//!
//! One [`ChatEnvelope`] travels per frame. Its body is either plaintext
//! content or an encrypted blob, never both: the enum makes the mixed state
//! unrepresentable.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::control::HEARTBEAT;
use crate::error::LinkError;

/// Sender identity used for locally generated notices
pub const SYSTEM_SENDER: &str = "system";

// ============================================================================
// Wire Types
// ============================================================================

/// Wire-level application message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub message_id: String,
    /// Milliseconds since the Unix epoch, sender's clock
    pub timestamp_ms: u64,
    pub sender_id: String,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Plain(Content),
    Encrypted {
        /// Sealed bincode-encoded [`Content`]
        ciphertext: Vec<u8>,
        scheme: String,
        /// Sender's 64-byte public key, when it has one
        sender_public_key: Option<Vec<u8>>,
    },
}

/// What the application actually sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Text(String),
    Binary {
        data: Vec<u8>,
        filename: Option<String>,
        mime_type: Option<String>,
    },
}

/// Descriptive fields for a binary payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadMetadata {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
}

impl ChatEnvelope {
    /// New envelope with a fresh message ID and the current time
    pub fn new(sender_id: impl Into<String>, body: Body) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: now_ms(),
            sender_id: sender_id.into(),
            body,
        }
    }

    /// Liveness probe envelope
    pub fn heartbeat(sender_id: impl Into<String>) -> Self {
        Self::new(sender_id, Body::Plain(Content::heartbeat()))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.body, Body::Encrypted { .. })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text(text.into())
    }

    pub fn binary(data: Vec<u8>, metadata: PayloadMetadata) -> Self {
        Content::Binary {
            data,
            filename: metadata.filename,
            mime_type: metadata.mime_type,
        }
    }

    pub fn heartbeat() -> Self {
        Content::Text(HEARTBEAT.to_string())
    }

    /// Heartbeats are the reserved text value, checked after decryption
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Content::Text(t) if t == HEARTBEAT)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(t) => Some(t),
            Content::Binary { .. } => None,
        }
    }

    /// One-line human-readable rendering
    pub fn preview(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Binary {
                data,
                filename,
                mime_type,
            } => format!(
                "[binary {} ({}, {} bytes)]",
                filename.as_deref().unwrap_or("unnamed"),
                mime_type.as_deref().unwrap_or("application/octet-stream"),
                data.len()
            ),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ============================================================================
// Delivery Types
// ============================================================================

/// How a delivered message was protected in transit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSecurity {
    /// Decrypted with the local private key
    Encrypted { scheme: String },
    /// Sent unencrypted (peer had no trusted key for us)
    Plaintext,
    /// Marked encrypted but could not be opened; content is a placeholder
    DecryptionFailed,
    /// Generated locally, never on the wire
    System,
}

/// A message handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub timestamp_ms: u64,
    pub sender_id: String,
    pub content: Content,
    pub security: MessageSecurity,
}

impl InboundMessage {
    /// Locally generated notice, e.g. `[System] Connected to 1a2b3c4d`
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: now_ms(),
            sender_id: SYSTEM_SENDER.to_string(),
            content: Content::Text(text.into()),
            security: MessageSecurity::System,
        }
    }

    pub fn is_system(&self) -> bool {
        self.security == MessageSecurity::System
    }

    /// Whether the peer sent this without encryption
    pub fn was_unencrypted(&self) -> bool {
        self.security == MessageSecurity::Plaintext
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
