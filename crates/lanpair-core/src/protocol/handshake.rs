//! HELLO validation.
//!
//! The initiating side (the Sender) sends its [`PairingRequest`] first; the
//! responder checks it against its own expected session id and replies with
//! its own.  The initiator then checks the reply the same way.  Any failure
//! here is terminal for the session and is never retried automatically.

use std::time::Duration;

use thiserror::Error;

use crate::domain::identity::{PublicKey, SessionId};
use crate::protocol::codec::{decode_frame, ProtocolError};
use crate::protocol::messages::{PairingRequest, WireMessage, PROTOCOL_VERSION};

/// Why a handshake was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The peer's HELLO named a different session.
    #[error("session id mismatch: expected {expected}, peer sent {received}")]
    SessionMismatch {
        expected: SessionId,
        received: SessionId,
    },

    /// The peer speaks a protocol version this build does not.
    #[error("protocol version mismatch: local {local}, peer {received}")]
    VersionMismatch { local: u16, received: u16 },

    /// The HELLO could not be decoded.
    #[error("malformed handshake payload: {0}")]
    Malformed(String),

    /// A non-HELLO frame arrived while pairing.
    #[error("unexpected data frame during handshake")]
    UnexpectedFrame,

    /// No valid HELLO arrived within the handshake budget.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The transport closed before both HELLOs were exchanged.
    #[error("transport closed during handshake")]
    TransportClosed,
}

impl From<ProtocolError> for HandshakeFailure {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedVersion(received) => HandshakeFailure::VersionMismatch {
                local: PROTOCOL_VERSION,
                received,
            },
            other => HandshakeFailure::Malformed(other.to_string()),
        }
    }
}

/// Checks a decoded HELLO against the session this side expects.
///
/// Returns the peer's public key on success.
///
/// # Errors
///
/// [`HandshakeFailure::VersionMismatch`] or [`HandshakeFailure::SessionMismatch`].
pub fn validate_pairing_request(
    expected: &SessionId,
    request: &PairingRequest,
) -> Result<PublicKey, HandshakeFailure> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(HandshakeFailure::VersionMismatch {
            local: PROTOCOL_VERSION,
            received: request.protocol_version,
        });
    }
    if &request.session_id != expected {
        return Err(HandshakeFailure::SessionMismatch {
            expected: expected.clone(),
            received: request.session_id.clone(),
        });
    }
    Ok(request.public_key)
}

/// Decodes a frame received while pairing and validates it as a HELLO.
///
/// # Errors
///
/// Any [`HandshakeFailure`] except `Timeout` and `TransportClosed`.
pub fn accept_hello_frame(expected: &SessionId, frame: &[u8]) -> Result<PublicKey, HandshakeFailure> {
    match decode_frame(frame)? {
        WireMessage::Hello(request) => validate_pairing_request(expected, &request),
        WireMessage::Data(_) => Err(HandshakeFailure::UnexpectedFrame),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::KeyPair;
    use crate::protocol::codec::encode_frame;

    fn sid(code: &str) -> SessionId {
        SessionId::new(code).unwrap()
    }

    #[test]
    fn test_matching_hello_yields_peer_key() {
        // Arrange
        let key = KeyPair::generate().public_key();
        let frame = encode_frame(&WireMessage::Hello(PairingRequest::new(sid("ABC123"), key)));

        // Act
        let result = accept_hello_frame(&sid("ABC123"), &frame);

        // Assert
        assert_eq!(result, Ok(key));
    }

    #[test]
    fn test_session_mismatch_is_rejected() {
        let key = KeyPair::generate().public_key();
        let frame = encode_frame(&WireMessage::Hello(PairingRequest::new(sid("ZZZ999"), key)));

        assert_eq!(
            accept_hello_frame(&sid("ABC123"), &frame),
            Err(HandshakeFailure::SessionMismatch {
                expected: sid("ABC123"),
                received: sid("ZZZ999"),
            })
        );
    }

    #[test]
    fn test_version_mismatch_on_the_wire_is_reported_as_version_mismatch() {
        let mut req = PairingRequest::new(sid("ABC123"), KeyPair::generate().public_key());
        req.protocol_version = 7;
        let frame = encode_frame(&WireMessage::Hello(req));

        assert_eq!(
            accept_hello_frame(&sid("ABC123"), &frame),
            Err(HandshakeFailure::VersionMismatch { local: PROTOCOL_VERSION, received: 7 })
        );
    }

    #[test]
    fn test_version_mismatch_in_decoded_request() {
        let mut req = PairingRequest::new(sid("ABC123"), KeyPair::generate().public_key());
        req.protocol_version = 0;
        assert!(matches!(
            validate_pairing_request(&sid("ABC123"), &req),
            Err(HandshakeFailure::VersionMismatch { received: 0, .. })
        ));
    }

    #[test]
    fn test_data_frame_during_handshake_is_rejected() {
        let frame = encode_frame(&WireMessage::Data(b"too early".to_vec()));
        assert_eq!(
            accept_hello_frame(&sid("ABC123"), &frame),
            Err(HandshakeFailure::UnexpectedFrame)
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            accept_hello_frame(&sid("ABC123"), b"\x01"),
            Err(HandshakeFailure::Malformed(_))
        ));
    }
}
