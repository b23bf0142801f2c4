//! Domain types for pairing: identities, the session state table and
//! discovery records.
//!
//! Nothing in this module performs I/O.

pub mod identity;
pub mod service;
pub mod state;
