//! At-least-once delivery for the emberlink mesh.
//!
//! Outbound frames that request acknowledgment are paired with persisted
//! pending-ack records. A matching ACK resolves the delivery; timeouts
//! retry up to a budget and then fail it. Status reaches the application
//! through events and polling, never through panics crossing this
//! boundary.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod msgid;
pub mod pending;
pub mod tracker;

pub use error::DeliveryError;
pub use msgid::{MessageIdAllocator, MESSAGE_ID_KEY};
pub use pending::{DeliveryEvent, DeliveryStatus, PendingAck};
pub use tracker::{AckConfig, DeliveryTracker};
