//! # lanpair-core
//!
//! Shared library for LanPair containing the pairing domain types and the
//! session wire protocol.  It has no dependencies on sockets, async runtimes
//! or discovery backends; those live in `lanpair-node`.
//!
//! - **`domain`** – Validated identity newtypes ([`SessionId`], [`PublicKey`],
//!   [`PeerAddress`]), the table-driven session [`StateMachine`], and the
//!   discovery metadata record (`sid`, `pk`, `v`).
//!
//! - **`protocol`** – The frame codec and HELLO validation.  A session is only
//!   Active after both sides sent and accepted a [`PairingRequest`] carrying
//!   the same session id.

pub mod domain;
pub mod protocol;

pub use domain::identity::{
    parse_usable_host, IdentityError, KeyPair, LocalIdentity, PeerAddress, PublicKey, Role,
    SessionId, SESSION_CODE_LEN,
};
pub use domain::service::{
    DiscoveredService, DiscoverySource, ServiceMetadata, ServiceName, SidHint, TxtRecord,
};
pub use domain::state::{SessionState, SessionTrigger, StateError, StateMachine, Transition};
pub use protocol::{
    accept_hello_frame, decode_frame, encode_frame, HandshakeFailure, PairingRequest,
    ProtocolError, WireMessage, PROTOCOL_VERSION,
};
