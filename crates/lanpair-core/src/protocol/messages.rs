//! Frame types exchanged over a connected transport.
//!
//! One transport message carries exactly one frame.  Before a session is
//! Active the only legal frame is [`WireMessage::Hello`]; afterwards the only
//! legal frame is [`WireMessage::Data`].

use crate::domain::identity::{PublicKey, SessionId};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Handshake protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 6;

// ── Message type codes ────────────────────────────────────────────────────────

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Data = 0x10,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x10 => Ok(MessageType::Data),
            _ => Err(()),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// HELLO payload: sent once in each direction before a session is Active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub session_id: SessionId,
    pub public_key: PublicKey,
    pub protocol_version: u16,
}

impl PairingRequest {
    /// A request speaking this build's [`PROTOCOL_VERSION`].
    pub fn new(session_id: SessionId, public_key: PublicKey) -> Self {
        Self {
            session_id,
            public_key,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Any frame that can appear on a session transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Hello(PairingRequest),
    /// Opaque application bytes, only valid once the session is Active.
    Data(Vec<u8>),
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Hello(_) => MessageType::Hello,
            WireMessage::Data(_) => MessageType::Data,
        }
    }
}
