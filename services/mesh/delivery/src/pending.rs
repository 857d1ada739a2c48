//! Pending-acknowledgment records and delivery status.

use serde::{Deserialize, Serialize};

/// One in-flight delivery awaiting acknowledgment.
///
/// Persisted keyed by `message_id` so a restart does not silently lose
/// in-flight deliveries; the encoded frame rides along for re-dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAck {
    /// Message id the ACK will reference
    pub message_id: u32,
    /// Conversation the message belongs to
    pub conversation_id: String,
    /// Encoded frame bytes, re-sent on every retry
    pub frame: Vec<u8>,
    /// When the first dispatch happened, unix seconds
    pub sent_at: u64,
    /// Timeouts observed so far
    pub retry_count: u32,
    /// Timeout budget before the delivery fails
    pub max_retries: u32,
    /// When the next timeout fires, unix seconds
    pub next_retry_at: u64,
}

/// Application-visible delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Dispatched, awaiting acknowledgment (possibly retrying)
    Sending,
    /// Acknowledged by the destination
    Delivered,
    /// Retry budget exhausted or defensively expired
    Failed,
}

impl DeliveryStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

/// Status transition pushed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    /// Message the transition is about
    pub message_id: u32,
    /// Conversation the message belongs to
    pub conversation_id: String,
    /// New status
    pub status: DeliveryStatus,
}
