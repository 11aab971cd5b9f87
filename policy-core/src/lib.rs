//! Discovery engines, reconciliation, and scheduler for the policy
//! discovery system.
//!
//! This crate has no concrete storage, transport, or cluster-API
//! backend — those are supplied by implementors of the port traits in
//! [`ports`]. Everything here is pure computation plus orchestration
//! over those traits.

pub mod aggregation;
pub mod classify;
pub mod discovery;
pub mod error;
pub mod ports;
pub mod scheduler;

pub use error::{DiscoveryError, Result};
