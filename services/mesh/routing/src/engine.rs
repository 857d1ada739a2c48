//! Per-node routing decisions: deliver, relay, or drop.

use crate::dedup::DedupCache;
use crate::message::{MeshMessage, MessageKind, DEFAULT_TTL};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Broadcast destination node id
pub const BROADCAST: u64 = 0;

/// Routing decision for one inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Hand the payload to the local application
    Deliver(MeshMessage),
    /// Re-emit a copy with TTL-1 toward the rest of the mesh
    Relay(MeshMessage),
    /// Broadcast: deliver locally and keep flooding
    DeliverAndRelay {
        /// Copy for the local application
        local: MeshMessage,
        /// Copy to re-emit with TTL-1
        relay: MeshMessage,
    },
    /// Discard the envelope
    Drop(DropReason),
}

/// Reason an envelope was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// `(from, msg_id)` already seen within the dedup window
    Duplicate,
    /// Hop budget spent
    TtlExhausted,
    /// Our own message echoed back by a neighbor
    Loopback,
    /// Envelope failed protocol validation
    Malformed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Duplicate => write!(f, "duplicate"),
            DropReason::TtlExhausted => write!(f, "ttl exhausted"),
            DropReason::Loopback => write!(f, "loopback"),
            DropReason::Malformed => write!(f, "malformed"),
        }
    }
}

/// Routing statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Envelopes handed to the local application
    pub delivered: u64,
    /// Envelopes re-emitted toward the mesh
    pub relayed: u64,
    /// Envelopes discarded
    pub dropped: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
}

impl RouterStats {
    fn record_drop(&mut self, reason: DropReason) {
        self.dropped += 1;
        *self.drop_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

/// Single-owner routing engine for one node.
///
/// Owns the dedup cache and group subscriptions; meant to live inside the
/// node's inbound-processing task, so no internal locking.
#[derive(Debug)]
pub struct RoutingEngine {
    local_node: u64,
    default_ttl: u8,
    groups: HashSet<u64>,
    dedup: DedupCache,
    stats: RouterStats,
}

impl RoutingEngine {
    /// Create an engine for `local_node` with default policy.
    pub fn new(local_node: u64) -> Self {
        Self {
            local_node,
            default_ttl: DEFAULT_TTL,
            groups: HashSet::new(),
            dedup: DedupCache::new(),
            stats: RouterStats::default(),
        }
    }

    /// Override the starting TTL used by [`RoutingEngine::create_message`].
    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Override the dedup cache (bounds are policy).
    pub fn with_dedup(mut self, dedup: DedupCache) -> Self {
        self.dedup = dedup;
        self
    }

    /// The node this engine routes for.
    pub fn local_node(&self) -> u64 {
        self.local_node
    }

    /// The starting TTL given to originated messages.
    pub fn default_ttl(&self) -> u8 {
        self.default_ttl
    }

    /// Subscribe to a logical group address.
    pub fn subscribe_group(&mut self, group: u64) {
        self.groups.insert(group);
    }

    /// Unsubscribe from a logical group address.
    pub fn unsubscribe_group(&mut self, group: u64) {
        self.groups.remove(&group);
    }

    /// Whether the node subscribes to `group`.
    pub fn is_subscribed(&self, group: u64) -> bool {
        self.groups.contains(&group)
    }

    /// Build a first-hop envelope from this node: hop count 0, policy TTL.
    pub fn create_message(
        &self,
        msg_id: u32,
        to: u64,
        kind: MessageKind,
        from_pubkey: String,
        enc: Vec<u8>,
    ) -> MeshMessage {
        MeshMessage::new(
            msg_id,
            self.local_node,
            to,
            self.default_ttl,
            kind,
            from_pubkey,
            enc,
        )
    }

    /// Decide what to do with one inbound envelope.
    ///
    /// Relaying is a transparent envelope hop: the copy differs from the
    /// input only by TTL-1 and hop+1; `enc` is never inspected.
    pub fn decide(&mut self, msg: MeshMessage) -> RoutingDecision {
        if msg.validate().is_err() {
            self.stats.record_drop(DropReason::Malformed);
            return RoutingDecision::Drop(DropReason::Malformed);
        }
        if msg.from == self.local_node {
            self.stats.record_drop(DropReason::Loopback);
            return RoutingDecision::Drop(DropReason::Loopback);
        }

        let key = msg.dedup_key();
        if self.dedup.contains(&key) {
            debug!(from = msg.from, msg_id = msg.msg_id, "duplicate envelope dropped");
            self.stats.record_drop(DropReason::Duplicate);
            return RoutingDecision::Drop(DropReason::Duplicate);
        }

        if msg.to == self.local_node || self.groups.contains(&msg.to) {
            self.dedup.record(key);
            self.stats.delivered += 1;
            return RoutingDecision::Deliver(msg);
        }

        if msg.to == BROADCAST {
            self.dedup.record(key);
            self.stats.delivered += 1;
            return match msg.next_hop() {
                Some(relay) => {
                    self.stats.relayed += 1;
                    RoutingDecision::DeliverAndRelay { local: msg, relay }
                }
                None => RoutingDecision::Deliver(msg),
            };
        }

        // Addressed to somebody else: forward while budget remains
        match msg.next_hop() {
            Some(relay) => {
                self.dedup.record(key);
                self.stats.relayed += 1;
                RoutingDecision::Relay(relay)
            }
            None => {
                debug!(from = msg.from, msg_id = msg.msg_id, "hop budget spent, dropping");
                self.stats.record_drop(DropReason::TtlExhausted);
                RoutingDecision::Drop(DropReason::TtlExhausted)
            }
        }
    }

    /// Routing statistics so far.
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Drop dedup entries older than the window.
    pub fn purge_dedup(&mut self) {
        self.dedup.purge_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupCache;
    use std::time::Duration;

    const LOCAL: u64 = 0xAA;
    const OTHER: u64 = 0xBB;
    const SENDER: u64 = 0xCC;

    fn inbound(to: u64, msg_id: u32, ttl: u8) -> MeshMessage {
        let mut msg = MeshMessage::new(
            msg_id,
            SENDER,
            to,
            ttl,
            MessageKind::Chat,
            "pk".into(),
            vec![9],
        );
        msg.hop_count = 1;
        msg
    }

    #[test]
    fn test_deliver_to_local() {
        let mut engine = RoutingEngine::new(LOCAL);
        match engine.decide(inbound(LOCAL, 1, 5)) {
            RoutingDecision::Deliver(msg) => assert_eq!(msg.msg_id, 1),
            other => panic!("expected Deliver, got {other:?}"),
        }
        assert_eq!(engine.stats().delivered, 1);
    }

    #[test]
    fn test_duplicate_delivers_at_most_once() {
        let mut engine = RoutingEngine::new(LOCAL);
        assert!(matches!(
            engine.decide(inbound(LOCAL, 1, 5)),
            RoutingDecision::Deliver(_)
        ));
        assert_eq!(
            engine.decide(inbound(LOCAL, 1, 5)),
            RoutingDecision::Drop(DropReason::Duplicate)
        );
        assert_eq!(engine.stats().delivered, 1);
        assert_eq!(engine.stats().drop_reasons.get("duplicate"), Some(&1));
    }

    #[test]
    fn test_relay_decrements_ttl_exactly_once() {
        let mut engine = RoutingEngine::new(LOCAL);
        match engine.decide(inbound(OTHER, 2, 5)) {
            RoutingDecision::Relay(relayed) => {
                assert_eq!(relayed.ttl, 4);
                assert_eq!(relayed.hop_count, 2);
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn test_ttl_zero_never_relays() {
        let mut engine = RoutingEngine::new(LOCAL);
        assert_eq!(
            engine.decide(inbound(OTHER, 3, 0)),
            RoutingDecision::Drop(DropReason::TtlExhausted)
        );
    }

    #[test]
    fn test_broadcast_delivers_and_relays() {
        let mut engine = RoutingEngine::new(LOCAL);
        match engine.decide(inbound(BROADCAST, 4, 5)) {
            RoutingDecision::DeliverAndRelay { local, relay } => {
                assert_eq!(local.ttl, 5);
                assert_eq!(relay.ttl, 4);
                assert_eq!(relay.hop_count, local.hop_count + 1);
            }
            other => panic!("expected DeliverAndRelay, got {other:?}"),
        }

        // Same broadcast again is a duplicate
        assert_eq!(
            engine.decide(inbound(BROADCAST, 4, 5)),
            RoutingDecision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn test_broadcast_with_spent_budget_still_delivers() {
        let mut engine = RoutingEngine::new(LOCAL);
        assert!(matches!(
            engine.decide(inbound(BROADCAST, 5, 0)),
            RoutingDecision::Deliver(_)
        ));
    }

    #[test]
    fn test_group_subscription_delivers() {
        let mut engine = RoutingEngine::new(LOCAL);
        engine.subscribe_group(0x6001);
        assert!(matches!(
            engine.decide(inbound(0x6001, 6, 5)),
            RoutingDecision::Deliver(_)
        ));

        engine.unsubscribe_group(0x6001);
        assert!(matches!(
            engine.decide(inbound(0x6001, 7, 5)),
            RoutingDecision::Relay(_)
        ));
    }

    #[test]
    fn test_own_echo_dropped() {
        let mut engine = RoutingEngine::new(LOCAL);
        let mut msg = inbound(OTHER, 8, 5);
        msg.from = LOCAL;
        assert_eq!(
            engine.decide(msg),
            RoutingDecision::Drop(DropReason::Loopback)
        );
    }

    #[test]
    fn test_malformed_never_delivered() {
        let mut engine = RoutingEngine::new(LOCAL);
        let mut msg = inbound(LOCAL, 9, 5);
        msg.from = 0;
        assert_eq!(
            engine.decide(msg),
            RoutingDecision::Drop(DropReason::Malformed)
        );
        assert_eq!(engine.stats().delivered, 0);
    }

    #[test]
    fn test_retransmission_after_cooldown_accepted() {
        let mut engine = RoutingEngine::new(LOCAL)
            .with_dedup(DedupCache::with_bounds(16, Duration::from_millis(0)));
        assert!(matches!(
            engine.decide(inbound(LOCAL, 10, 5)),
            RoutingDecision::Deliver(_)
        ));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            engine.decide(inbound(LOCAL, 10, 5)),
            RoutingDecision::Deliver(_)
        ));
    }

    #[test]
    fn test_create_message_initializes_first_hop() {
        let engine = RoutingEngine::new(LOCAL).with_default_ttl(9);
        let msg = engine.create_message(11, OTHER, MessageKind::Cashu, "pk".into(), vec![1]);
        assert_eq!(msg.hop_count, 0);
        assert_eq!(msg.ttl, 9);
        assert_eq!(msg.from, LOCAL);
    }
}
