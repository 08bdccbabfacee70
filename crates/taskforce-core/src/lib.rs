//! Shared foundation for the Taskforce orchestration core.
//!
//! This crate holds the pieces every other Taskforce crate speaks in:
//!
//! - [`TaskforceError`] / [`TaskforceResult`] — the error taxonomy.
//! - [`Envelope`] — the inter-worker message envelope with a closed,
//!   exhaustively-matched set of payload kinds.

/// Message envelope exchanged between the orchestrator and workers.
pub mod envelope;
/// Error taxonomy and result alias.
pub mod error;

pub use envelope::{Envelope, MessageHeader, MessageKind, Payload};
pub use error::{TaskforceError, TaskforceResult};
