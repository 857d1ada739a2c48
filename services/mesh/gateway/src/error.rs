//! Gateway error types.

use crate::job::JobType;
use thiserror::Error;
use uuid::Uuid;

/// Gateway relay errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The node runs in client mode and accepts no relay jobs
    #[error("node is not a gateway")]
    NotGateway,

    /// The requested service is switched off on this gateway
    #[error("service {0:?} is disabled")]
    ServiceDisabled(JobType),

    /// No job with that id in the log
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// The job already reached a terminal status
    #[error("job {0} is already terminal")]
    AlreadyTerminal(Uuid),

    /// Invalid status transition
    #[error("invalid job transition: {0}")]
    InvalidTransition(String),

    /// External collaborator failure
    #[error("relay backend error: {0}")]
    Backend(String),

    /// A processing job exceeded its deadline
    #[error("relay job timed out")]
    Timeout,

    /// The engine worker is gone; the node is shutting down
    #[error("relay queue closed")]
    QueueClosed,
}
