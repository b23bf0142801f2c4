//! lanpair-node library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/` and the
//! `lanpair` binary share the same module tree.

pub mod application;
pub mod infrastructure;
