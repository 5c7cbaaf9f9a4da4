//! Control messages carried over the discovery side-channel
//!
//! Before a stream exists the only way to talk to a peer is the small,
//! unreliable message channel of the discovery layer. Three messages travel
//! there, each a short ASCII string:
//!
//! ```text
//! Initiator                                  Responder
//!   │                                            │
//!   │─── HANDSHAKE:<deviceId> ──────────────────►│
//!   │                                            │  open listener
//!   │◄── PORT:<n> ───────────────────────────────│
//!   │                                            │
//!   │═══ connect stream to <n> ═════════════════►│
//! ```
//!
//! `HEARTBEAT` is reserved for liveness probes. Decoding is total: anything
//! malformed is simply "not a control message".

/// Prefix of the handshake announcement
pub const HANDSHAKE_PREFIX: &str = "HANDSHAKE:";

/// Prefix of the port announcement
pub const PORT_PREFIX: &str = "PORT:";

/// Liveness probe marker
pub const HEARTBEAT: &str = "HEARTBEAT";

/// Acknowledgement prefix (reserved, recognised as system traffic only)
pub const ACK_PREFIX: &str = "ACK:";

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Initiator announces its device ID
    Handshake(String),
    /// Responder announces the port it is listening on
    Port(u16),
    /// Liveness probe
    Heartbeat,
}

impl ControlMessage {
    /// Encode to the ASCII wire form
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Handshake(id) => format!("{}{}", HANDSHAKE_PREFIX, id).into_bytes(),
            ControlMessage::Port(port) => format!("{}{}", PORT_PREFIX, port).into_bytes(),
            ControlMessage::Heartbeat => HEARTBEAT.as_bytes().to_vec(),
        }
    }

    /// Decode a side-channel payload
    ///
    /// Returns `None` for anything that is not a well-formed control message.
    pub fn decode(payload: &[u8]) -> Option<ControlMessage> {
        let text = std::str::from_utf8(payload).ok()?;

        if let Some(id) = parse_handshake(text) {
            return Some(ControlMessage::Handshake(id.to_string()));
        }
        if let Some(port) = parse_port(text) {
            return Some(ControlMessage::Port(port));
        }
        if is_heartbeat(text) {
            return Some(ControlMessage::Heartbeat);
        }
        None
    }
}

/// Extract the device ID from a `HANDSHAKE:` message
pub fn parse_handshake(text: &str) -> Option<&str> {
    let id = text.strip_prefix(HANDSHAKE_PREFIX)?;
    if id.is_empty() {
        return None;
    }
    Some(id)
}

/// Extract the port from a `PORT:` message
pub fn parse_port(text: &str) -> Option<u16> {
    let port: u16 = text.strip_prefix(PORT_PREFIX)?.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some(port)
}

/// Check for the heartbeat marker
pub fn is_heartbeat(text: &str) -> bool {
    text == HEARTBEAT
}

/// Check whether a payload belongs to the control vocabulary at all
///
/// Broader than [`ControlMessage::decode`]: a malformed `PORT:x` is still
/// control traffic, just unusable control traffic.
pub fn is_system_message(payload: &[u8]) -> bool {
    [HANDSHAKE_PREFIX, PORT_PREFIX, HEARTBEAT, ACK_PREFIX]
        .iter()
        .any(|prefix| payload.starts_with(prefix.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_forms() {
        assert_eq!(
            ControlMessage::Handshake("abc123".into()).encode(),
            b"HANDSHAKE:abc123".to_vec()
        );
        assert_eq!(ControlMessage::Port(40123).encode(), b"PORT:40123".to_vec());
        assert_eq!(ControlMessage::Heartbeat.encode(), b"HEARTBEAT".to_vec());
    }

    #[test]
    fn test_decode_each_kind() {
        assert_eq!(
            ControlMessage::decode(b"HANDSHAKE:B"),
            Some(ControlMessage::Handshake("B".into()))
        );
        assert_eq!(
            ControlMessage::decode(b"PORT:8080"),
            Some(ControlMessage::Port(8080))
        );
        assert_eq!(
            ControlMessage::decode(b"HEARTBEAT"),
            Some(ControlMessage::Heartbeat)
        );
    }

    #[test]
    fn test_handshake_keeps_everything_after_prefix() {
        assert_eq!(parse_handshake("HANDSHAKE:a:b"), Some("a:b"));
    }

    #[test]
    fn test_malformed_payloads_are_not_control() {
        assert_eq!(ControlMessage::decode(b""), None);
        assert_eq!(ControlMessage::decode(b"HANDSHAKE:"), None);
        assert_eq!(ControlMessage::decode(b"PORT:"), None);
        assert_eq!(ControlMessage::decode(b"PORT:abc"), None);
        assert_eq!(ControlMessage::decode(b"PORT:70000"), None);
        assert_eq!(ControlMessage::decode(b"PORT:-1"), None);
        assert_eq!(ControlMessage::decode(b"PORT:0"), None);
        assert_eq!(ControlMessage::decode(b"HEARTBEATS"), None);
        assert_eq!(ControlMessage::decode(b"hello there"), None);
        assert_eq!(ControlMessage::decode(&[0xff, 0xfe, 0x00]), None);
    }

    #[test]
    fn test_system_message_prefixes() {
        assert!(is_system_message(b"HANDSHAKE:x"));
        assert!(is_system_message(b"PORT:garbage"));
        assert!(is_system_message(b"HEARTBEAT"));
        assert!(is_system_message(b"ACK:17"));
        assert!(!is_system_message(b"hello"));
        assert!(!is_system_message(b""));
    }
}
