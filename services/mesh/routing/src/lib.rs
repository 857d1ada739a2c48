//! Routing for the emberlink mesh: envelope validation, duplicate
//! suppression, and the per-node deliver/relay/drop decision.
//!
//! The engine is single-owner state: it lives inside the node's inbound
//! processing task and needs no internal locking. TTL strictly decreases
//! and hop count strictly increases by exactly one per relay hop; an
//! envelope with a spent budget is never relayed again.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dedup;
pub mod engine;
pub mod error;
pub mod message;

pub use dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW};
pub use engine::{DropReason, RouterStats, RoutingDecision, RoutingEngine, BROADCAST};
pub use error::RoutingError;
pub use message::{MeshMessage, MessageKind, DEFAULT_TTL, MAX_ENVELOPE_SIZE, MAX_TTL};
