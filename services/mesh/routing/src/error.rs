//! Routing error types.

use thiserror::Error;

/// Routing errors
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Envelope bytes do not decode
    #[error("envelope decode failed: {0}")]
    Decode(String),

    /// Envelope encode failed
    #[error("envelope encode failed: {0}")]
    Encode(String),

    /// Envelope decoded but violates protocol invariants
    #[error("protocol violation: {0}")]
    Violation(String),
}
