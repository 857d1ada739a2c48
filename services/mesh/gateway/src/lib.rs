//! Gateway relay engine for the emberlink mesh.
//!
//! A gateway bridges mesh traffic that needs internet-only capabilities —
//! signed-transaction broadcast, Cashu token relay and redemption, payment
//! forwarding, chunk republish — to external collaborators, and mirrors
//! job outcomes back onto the backbone and the mesh. Client nodes keep the
//! engine disabled; gateways announce their capability set on a retained
//! well-known topic for discovery.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod job;
pub mod peers;
pub mod services;
pub mod stats;

pub use engine::{
    chunk_for_mesh, GatewayConfig, GatewayMode, RelayEngine, RelayRequest,
};
pub use error::GatewayError;
pub use job::{JobStatus, JobType, RelayJob};
pub use peers::{PeerRecord, PeerTable, DEFAULT_PEER_TIMEOUT};
pub use services::{BroadcastService, EcashService, PaymentService, RelayServices};
pub use stats::{GatewayStats, GatewayStatsSnapshot};
