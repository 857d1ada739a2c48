//! Relay job model and lifecycle.

use crate::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Internet-side services a gateway can relay to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Broadcast a signed transaction
    TxBroadcast,
    /// Forward a Cashu token to its mint
    CashuRelay,
    /// Redeem a Cashu token
    CashuRedeem,
    /// Forward a payment request
    PaymentForward,
    /// Republish a completed chunk reassembly
    ChunkReassembly,
}

impl JobType {
    /// Every job type, for capability announcements.
    pub const ALL: [JobType; 5] = [
        JobType::TxBroadcast,
        JobType::CashuRelay,
        JobType::CashuRedeem,
        JobType::PaymentForward,
        JobType::ChunkReassembly,
    ];

    /// Stable token for topics and announcements.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::TxBroadcast => "tx_broadcast",
            JobType::CashuRelay => "cashu_relay",
            JobType::CashuRedeem => "cashu_redeem",
            JobType::PaymentForward => "payment_forward",
            JobType::ChunkReassembly => "chunk_reassembly",
        }
    }

    /// Parse a stable token back to a job type.
    pub fn parse(token: &str) -> Option<JobType> {
        match token {
            "tx_broadcast" => Some(JobType::TxBroadcast),
            "cashu_relay" => Some(JobType::CashuRelay),
            "cashu_redeem" => Some(JobType::CashuRedeem),
            "payment_forward" => Some(JobType::PaymentForward),
            "chunk_reassembly" => Some(JobType::ChunkReassembly),
            _ => None,
        }
    }

    /// Whether a failed attempt may be safely retried. Re-broadcasting a
    /// signed transaction or re-publishing a blob is duplicate-safe;
    /// redeeming a token or forwarding a payment is not.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            JobType::TxBroadcast | JobType::CashuRelay | JobType::ChunkReassembly
        )
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted, waiting for the worker
    Queued,
    /// Worker is calling the external service
    Processing,
    /// Service call succeeded
    Completed,
    /// Service call failed, timed out, or the job was cancelled
    Failed,
}

impl JobStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One unit of mesh-to-internet relay work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayJob {
    /// Job id
    pub id: Uuid,
    /// Which service the job targets
    pub job_type: JobType,
    /// Lifecycle state; monotonic, append-only once terminal
    pub status: JobStatus,
    /// Mesh node that requested the relay
    pub source_node: u64,
    /// Creation time, unix seconds
    pub created_at: u64,
    /// Last transition time, unix seconds
    pub updated_at: u64,
    /// Request payload handed to the external service
    pub payload: Vec<u8>,
    /// Service response on success
    pub result: Option<String>,
    /// Failure description on failure
    pub error: Option<String>,
    /// Attempts retried so far
    pub retry_count: u32,
    /// Retry budget for idempotent job types
    pub max_retries: u32,
}

impl RelayJob {
    /// Create a queued job.
    pub fn new(job_type: JobType, source_node: u64, payload: Vec<u8>, max_retries: u32) -> Self {
        let now = unix_now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Queued,
            source_node,
            created_at: now,
            updated_at: now,
            payload,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
        }
    }

    /// Advance the lifecycle. Transitions only move forward; a terminal job
    /// never changes again.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), GatewayError> {
        if self.status.is_terminal() {
            return Err(GatewayError::AlreadyTerminal(self.id));
        }
        let ok = matches!(
            (self.status, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        );
        if !ok {
            return Err(GatewayError::InvalidTransition(format!(
                "{:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = unix_now();
        Ok(())
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_is_monotonic() {
        let mut job = RelayJob::new(JobType::TxBroadcast, 1, vec![1], 2);
        assert_eq!(job.status, JobStatus::Queued);

        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Completed).unwrap();

        // Terminal is append-only
        assert!(matches!(
            job.transition(JobStatus::Failed),
            Err(GatewayError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            job.transition(JobStatus::Processing),
            Err(GatewayError::AlreadyTerminal(_))
        ));
    }

    #[test]
    fn test_queued_can_fail_directly() {
        // Cancellation path
        let mut job = RelayJob::new(JobType::CashuRedeem, 1, vec![], 0);
        job.transition(JobStatus::Failed).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut job = RelayJob::new(JobType::CashuRelay, 1, vec![], 0);
        assert!(matches!(
            job.transition(JobStatus::Completed),
            Err(GatewayError::InvalidTransition(_))
        ));
        assert!(matches!(
            job.transition(JobStatus::Queued),
            Err(GatewayError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_idempotence_split() {
        assert!(JobType::TxBroadcast.is_idempotent());
        assert!(JobType::CashuRelay.is_idempotent());
        assert!(JobType::ChunkReassembly.is_idempotent());
        assert!(!JobType::CashuRedeem.is_idempotent());
        assert!(!JobType::PaymentForward.is_idempotent());
    }
}
