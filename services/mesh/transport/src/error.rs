//! Transport error types.

use thiserror::Error;

/// Transport adapter errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The adapter's peer endpoint is gone
    #[error("transport closed")]
    Closed,

    /// No path to the destination on any backbone
    #[error("no route to destination")]
    NoRoute,

    /// Adapter-specific failure
    #[error("transport backend error: {0}")]
    Backend(String),

    /// Encryption collaborator failure
    #[error("crypto error: {0}")]
    Crypto(String),
}
