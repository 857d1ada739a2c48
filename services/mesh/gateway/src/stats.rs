//! Gateway relay counters.
//!
//! Counters are monotonic while the gateway is active and reset only on
//! reactivation.

use crate::job::{unix_now, JobType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

/// Live gateway counters.
pub struct GatewayStats {
    jobs_by_type: DashMap<JobType, u64>,
    bytes_relayed: AtomicU64,
    jobs_failed: AtomicU64,
    peers_served: DashMap<u64, ()>,
    activated_at_unix: AtomicU64,
    activated_at: Mutex<Option<Instant>>,
}

impl GatewayStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            jobs_by_type: DashMap::new(),
            bytes_relayed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            peers_served: DashMap::new(),
            activated_at_unix: AtomicU64::new(0),
            activated_at: Mutex::new(None),
        }
    }

    /// Zero everything and restart the uptime clock.
    pub fn reset(&self) {
        self.jobs_by_type.clear();
        self.bytes_relayed.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.peers_served.clear();
        self.activated_at_unix.store(unix_now(), Ordering::Relaxed);
        *self.activated_at.lock().expect("stats lock poisoned") = Some(Instant::now());
    }

    /// Count a completed relay.
    pub fn record_completed(&self, job_type: JobType, bytes: u64, source_node: u64) {
        *self.jobs_by_type.entry(job_type).or_insert(0) += 1;
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
        self.peers_served.insert(source_node, ());
    }

    /// Count a failed relay.
    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            relayed_jobs: self
                .jobs_by_type
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            peers_served: self.peers_served.len() as u64,
            activated_at: self.activated_at_unix.load(Ordering::Relaxed),
            uptime_seconds: self
                .activated_at
                .lock()
                .expect("stats lock poisoned")
                .map(|at| at.elapsed().as_secs())
                .unwrap_or(0),
        }
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable counter snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatsSnapshot {
    /// Completed relays per job type
    pub relayed_jobs: HashMap<String, u64>,
    /// Payload bytes relayed
    pub bytes_relayed: u64,
    /// Failed jobs
    pub jobs_failed: u64,
    /// Distinct peers served
    pub peers_served: u64,
    /// Activation time, unix seconds (0 before first activation)
    pub activated_at: u64,
    /// Seconds since activation
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_reset() {
        let stats = GatewayStats::new();
        stats.record_completed(JobType::TxBroadcast, 100, 1);
        stats.record_completed(JobType::TxBroadcast, 50, 2);
        stats.record_completed(JobType::CashuRelay, 10, 1);
        stats.record_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.relayed_jobs.get("tx_broadcast"), Some(&2));
        assert_eq!(snap.relayed_jobs.get("cashu_relay"), Some(&1));
        assert_eq!(snap.bytes_relayed, 160);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.peers_served, 2);

        stats.reset();
        let snap = stats.snapshot();
        assert!(snap.relayed_jobs.is_empty());
        assert_eq!(snap.bytes_relayed, 0);
        assert_eq!(snap.peers_served, 0);
        assert!(snap.activated_at > 0);
    }
}
