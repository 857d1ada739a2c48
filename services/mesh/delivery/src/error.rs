//! Delivery layer error types.

use thiserror::Error;

/// Delivery layer errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The outbound frame channel is gone; the node is shutting down
    #[error("outbound channel closed")]
    ChannelClosed,

    /// Storage collaborator failure that could not be degraded around
    #[error(transparent)]
    Storage(#[from] ember_storage::StorageError),
}
