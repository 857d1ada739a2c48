//! Peer bookkeeping: keyed upsert by node id with a staleness sweep.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default peer staleness timeout
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(300);

/// One peer the gateway has served
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer node id
    pub node_id: u64,
    /// Last contact, unix seconds
    pub last_seen: u64,
    /// Jobs this peer has submitted
    pub jobs_submitted: u64,
}

struct PeerEntry {
    record: PeerRecord,
    touched: Instant,
}

/// Peers keyed by node id, evicted after a staleness timeout.
pub struct PeerTable {
    peers: DashMap<u64, PeerEntry>,
    timeout: Duration,
}

impl PeerTable {
    /// Create a table with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PEER_TIMEOUT)
    }

    /// Create a table with an explicit staleness timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            timeout,
        }
    }

    /// Record contact from `node_id`, creating or refreshing its entry.
    pub fn upsert(&self, node_id: u64, now_unix: u64) {
        let mut entry = self.peers.entry(node_id).or_insert_with(|| PeerEntry {
            record: PeerRecord {
                node_id,
                last_seen: now_unix,
                jobs_submitted: 0,
            },
            touched: Instant::now(),
        });
        entry.record.last_seen = now_unix;
        entry.record.jobs_submitted += 1;
        entry.touched = Instant::now();
    }

    /// Drop peers unseen past the timeout. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let timeout = self.timeout;
        let before = self.peers.len();
        self.peers.retain(|node_id, entry| {
            let keep = entry.touched.elapsed() <= timeout;
            if !keep {
                debug!(node_id, "dropping stale peer");
            }
            keep
        });
        before - self.peers.len()
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of every tracked peer.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|e| e.value().record.clone()).collect()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_upsert_and_staleness_sweep() {
        let table = PeerTable::with_timeout(Duration::from_secs(10));
        table.upsert(1, 1000);
        table.upsert(2, 1000);
        table.upsert(1, 1001);
        assert_eq!(table.len(), 2);

        let peer1 = table
            .snapshot()
            .into_iter()
            .find(|p| p.node_id == 1)
            .unwrap();
        assert_eq!(peer1.jobs_submitted, 2);
        assert_eq!(peer1.last_seen, 1001);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(table.sweep(), 2);
        assert!(table.is_empty());
    }
}
