//! Session frame types, the binary codec and HELLO validation.

pub mod codec;
pub mod handshake;
pub mod messages;

pub use codec::{decode_frame, encode_frame, ProtocolError};
pub use handshake::{accept_hello_frame, validate_pairing_request, HandshakeFailure};
pub use messages::*;
