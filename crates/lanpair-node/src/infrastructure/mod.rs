//! Infrastructure layer: OS-facing adapters.
//!
//! Transports (WebSocket, in-memory), discovery backends (UDP broadcast,
//! mock), the subnet prober and configuration file storage.
//!
//! **Dependency rule**: this layer may depend on `lanpair_core`, but MUST NOT
//! import from `application`.

pub mod discovery;
pub mod probe;
pub mod storage;
pub mod transport;
