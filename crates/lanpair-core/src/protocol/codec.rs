//! Binary codec for session frames.
//!
//! Wire format:
//! ```text
//! [msg_type:1][reserved:1][payload_len:4][payload:N]
//! ```
//! All multi-byte integers are big-endian.  The transport delivers whole
//! messages, so a frame must occupy its buffer exactly; trailing bytes are an
//! error.
//!
//! HELLO payload:
//! ```text
//! [protocol_version:2][sid_len:2][sid:sid_len][pk_len:2][pk_base64:pk_len]
//! ```
//! The version comes first so that a peer speaking a different version is
//! reported as such rather than as a malformed payload.

use thiserror::Error;

use crate::domain::identity::{PublicKey, SessionId};
use crate::protocol::messages::{
    MessageType, PairingRequest, WireMessage, HEADER_SIZE, PROTOCOL_VERSION,
};

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The HELLO carries a protocol version this build does not speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// A payload field could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The declared payload length does not match the bytes that arrived.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`WireMessage`] into a complete frame.
///
/// # Examples
///
/// ```rust
/// use lanpair_core::protocol::{decode_frame, encode_frame, WireMessage};
///
/// let frame = encode_frame(&WireMessage::Data(vec![1, 2, 3]));
/// assert_eq!(decode_frame(&frame).unwrap(), WireMessage::Data(vec![1, 2, 3]));
/// ```
pub fn encode_frame(msg: &WireMessage) -> Vec<u8> {
    let payload = match msg {
        WireMessage::Hello(req) => encode_hello(req),
        WireMessage::Data(bytes) => bytes.clone(),
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(msg.message_type() as u8);
    buf.push(0x00); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    buf
}

/// Decodes exactly one frame occupying all of `bytes`.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<WireMessage, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let type_byte = bytes[0];
    let msg_type =
        MessageType::try_from(type_byte).map_err(|_| ProtocolError::UnknownMessageType(type_byte))?;

    // bytes[1] is reserved – ignored on decode

    let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    let available = bytes.len() - HEADER_SIZE;
    if declared != available {
        return Err(ProtocolError::PayloadLengthMismatch { declared, available });
    }

    let payload = &bytes[HEADER_SIZE..];
    match msg_type {
        MessageType::Hello => decode_hello(payload).map(WireMessage::Hello),
        MessageType::Data => Ok(WireMessage::Data(payload.to_vec())),
    }
}

// ── HELLO payload ─────────────────────────────────────────────────────────────

fn encode_hello(req: &PairingRequest) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&req.protocol_version.to_be_bytes());
    write_length_prefixed_string(&mut buf, req.session_id.as_str());
    write_length_prefixed_string(&mut buf, &req.public_key.to_base64());
    buf
}

fn decode_hello(payload: &[u8]) -> Result<PairingRequest, ProtocolError> {
    let version = read_u16(payload, 0)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let (sid, offset) = read_length_prefixed_string(payload, 2)?;
    let (pk, offset) = read_length_prefixed_string(payload, offset)?;
    if offset != payload.len() {
        return Err(ProtocolError::MalformedPayload(format!(
            "{} trailing bytes after HELLO",
            payload.len() - offset
        )));
    }

    let session_id = SessionId::new(sid).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    let public_key =
        PublicKey::from_base64(&pk).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    Ok(PairingRequest {
        session_id,
        public_key,
        protocol_version: version,
    })
}

// ── Primitive helpers ─────────────────────────────────────────────────────────

fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn read_u16(payload: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    require_len(payload, offset + 2)?;
    Ok(u16::from_be_bytes([payload[offset], payload[offset + 1]]))
}

fn read_length_prefixed_string(payload: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    let len = read_u16(payload, offset)? as usize;
    let start = offset + 2;
    require_len(payload, start + len)?;
    let s = std::str::from_utf8(&payload[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?;
    Ok((s.to_string(), start + len))
}

fn require_len(payload: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if payload.len() < needed {
        return Err(ProtocolError::MalformedPayload(format!(
            "HELLO truncated: need {needed} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::KeyPair;

    fn hello() -> PairingRequest {
        PairingRequest::new(SessionId::new("ABC123").unwrap(), KeyPair::generate().public_key())
    }

    #[test]
    fn test_hello_round_trip() {
        let original = WireMessage::Hello(hello());
        assert_eq!(decode_frame(&encode_frame(&original)).unwrap(), original);
    }

    #[test]
    fn test_empty_data_frame_is_header_only() {
        let frame = encode_frame(&WireMessage::Data(Vec::new()));
        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(decode_frame(&frame).unwrap(), WireMessage::Data(Vec::new()));
    }

    #[test]
    fn test_header_layout() {
        // Arrange / Act
        let frame = encode_frame(&WireMessage::Data(vec![0xAA; 3]));

        // Assert
        assert_eq!(frame[0], MessageType::Data as u8);
        assert_eq!(frame[1], 0x00);
        assert_eq!(&frame[2..6], &3u32.to_be_bytes());
    }

    #[test]
    fn test_decode_empty_bytes_returns_insufficient_data() {
        assert_eq!(
            decode_frame(&[]),
            Err(ProtocolError::InsufficientData { needed: HEADER_SIZE, available: 0 })
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        assert_eq!(
            decode_frame(&[0x7F, 0, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownMessageType(0x7F))
        );
    }

    #[test]
    fn test_decode_trailing_bytes_is_length_mismatch() {
        let mut frame = encode_frame(&WireMessage::Data(vec![1, 2]));
        frame.push(0xFF);
        assert_eq!(
            decode_frame(&frame),
            Err(ProtocolError::PayloadLengthMismatch { declared: 2, available: 3 })
        );
    }

    #[test]
    fn test_decode_hello_with_future_version() {
        // Arrange
        let mut req = hello();
        req.protocol_version = PROTOCOL_VERSION + 1;
        let frame = encode_frame(&WireMessage::Hello(req));

        // Act / Assert
        assert_eq!(
            decode_frame(&frame),
            Err(ProtocolError::UnsupportedVersion(PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn test_decode_truncated_hello_is_malformed() {
        // Header claims a 3-byte HELLO payload: version plus one stray byte.
        let frame = [MessageType::Hello as u8, 0, 0, 0, 0, 3, 0x00, 0x01, 0x00];
        assert!(matches!(decode_frame(&frame), Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_decode_hello_with_lowercase_sid_is_malformed() {
        // Arrange: hand-build a HELLO whose sid is not a valid code
        let pk = KeyPair::generate().public_key().to_base64();
        let mut payload = Vec::new();
        payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        write_length_prefixed_string(&mut payload, "abc123");
        write_length_prefixed_string(&mut payload, &pk);
        let mut frame = vec![MessageType::Hello as u8, 0];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        // Act / Assert
        assert!(matches!(decode_frame(&frame), Err(ProtocolError::MalformedPayload(_))));
    }
}
