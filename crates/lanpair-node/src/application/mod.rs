//! Application layer: the pairing use cases.
//!
//! Code here depends on the transport, discovery and probe abstractions, never
//! on a concrete socket type, so every flow runs against in-memory doubles in
//! tests.
//!
//! # Sub-modules
//!
//! - **`session`** – The session actor: state machine, HELLO handshake and
//!   event emission for one pairing attempt.
//! - **`orchestrator`** – Races broadcast discovery against the subnet prober
//!   to turn a session code into a peer address.
//! - **`pairing`** – Complete Receiver and Sender flows built on the two above.

pub mod orchestrator;
pub mod pairing;
pub mod session;

pub use orchestrator::{PairingError, PairingOrchestrator, DEFAULT_DISCOVERY_TIMEOUT};
pub use pairing::{pair_as_receiver, pair_as_sender, PeerTarget};
pub use session::{
    Session, SessionConfig, SessionError, SessionEvent, SessionHandle, DEFAULT_HANDSHAKE_TIMEOUT,
    MAX_DATA_PAYLOAD,
};
