//! Length-prefixed framing for peer streams
//!
//! # Frame Layout
//!
//! ```text
//! ┌─────────────┬──────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode ChatEnvelope)   │
//! └─────────────┴──────────────────────────────────┘
//! ```
//!
//! The length is a big-endian signed 32-bit integer. Anything `<= 0` or
//! above [`MAX_FRAME_LEN`] means the stream is out of sync and cannot be
//! recovered, so readers treat it as fatal.

use std::io::{Read, Write};

use crate::error::LinkError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum frame payload (10,000,000 bytes)
pub const MAX_FRAME_LEN: usize = 10_000_000;

/// Length of the frame header
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Buffer Encoding/Decoding
// ============================================================================

/// Encode a payload into a single length-prefixed buffer
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, LinkError> {
    check_outgoing_len(payload.len())?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one frame from the front of `buf`
///
/// Returns the payload and the number of bytes consumed, or `Ok(None)` when
/// `buf` does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(&[u8], usize)>, LinkError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let length = check_incoming_len(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))?;

    let total = HEADER_LEN + length;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some((&buf[HEADER_LEN..total], total)))
}

// ============================================================================
// Stream I/O
// ============================================================================

/// Write one frame: prefix, payload, flush
///
/// Oversized payloads are rejected before anything touches the writer.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), LinkError> {
    check_outgoing_len(payload.len())?;

    writer.write_all(&(payload.len() as i32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, blocking until it is complete
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, LinkError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = check_incoming_len(i32::from_be_bytes(header))?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn check_outgoing_len(len: usize) -> Result<(), LinkError> {
    if len > MAX_FRAME_LEN {
        return Err(LinkError::FrameTooLarge(len));
    }
    Ok(())
}

fn check_incoming_len(raw: i32) -> Result<usize, LinkError> {
    if raw <= 0 || raw as usize > MAX_FRAME_LEN {
        return Err(LinkError::InvalidFrameLength(i64::from(raw)));
    }
    Ok(raw as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer that fails the test if anything is written to it
    struct UntouchedWriter;

    impl Write for UntouchedWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            panic!("oversized frame reached the writer");
        }

        fn flush(&mut self) -> std::io::Result<()> {
            panic!("oversized frame reached the writer");
        }
    }

    #[test]
    fn test_stream_io() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello");
    }

    #[test]
    fn test_max_size_frame_is_accepted() {
        let payload = vec![0xabu8; MAX_FRAME_LEN];
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + MAX_FRAME_LEN);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().len(), MAX_FRAME_LEN);
    }

    #[test]
    fn test_oversized_frame_rejected_before_write() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let result = write_frame(&mut UntouchedWriter, &payload);
        assert!(matches!(result, Err(LinkError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 1));
        assert!(matches!(encode_frame(&payload), Err(LinkError::FrameTooLarge(_))));
    }

    #[test]
    fn test_invalid_incoming_lengths_are_fatal() {
        for raw in [0i32, -1, i32::MIN, (MAX_FRAME_LEN as i32) + 1] {
            let mut cursor = Cursor::new(raw.to_be_bytes().to_vec());
            let err = read_frame(&mut cursor).unwrap_err();
            assert!(matches!(err, LinkError::InvalidFrameLength(_)), "len {}", raw);
            assert!(err.is_stream_fatal());
        }
    }

    #[test]
    fn test_truncated_payload_is_io_error() {
        let mut buf = 10i32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"short");
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, LinkError::Io(_)));
    }

    #[test]
    fn test_decode_frame_incomplete_and_multiple() {
        let mut buf = encode_frame(b"one").unwrap();
        buf.extend(encode_frame(b"two").unwrap());

        assert!(decode_frame(&buf[..2]).unwrap().is_none());
        assert!(decode_frame(&buf[..5]).unwrap().is_none());

        let (first, used) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(first, b"one");
        let (second, _) = decode_frame(&buf[used..]).unwrap().unwrap();
        assert_eq!(second, b"two");
    }
}
