//! Routing envelope for multi-hop delivery.
//!
//! A [`MeshMessage`] wraps an opaque encrypted payload with just enough
//! addressing to route it: sender, destination, hop budget, and a per-sender
//! message id. Relay hops never look inside `enc`.

use crate::RoutingError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on the hop budget
pub const MAX_TTL: u8 = 32;

/// Default hop budget for new messages
pub const DEFAULT_TTL: u8 = 7;

/// Maximum serialized envelope size accepted on decode
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// What an envelope carries, for dispatch without opening `enc`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Conversation text
    Chat = 1,
    /// Cashu e-cash token transfer
    Cashu = 2,
    /// Request for gateway relay to an internet service
    RelayRequest = 3,
    /// Relay job outcome
    RelayStatus = 4,
    /// Node or gateway announcement
    Announce = 5,
}

/// Multi-hop routing envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Message id, unique per sender
    pub msg_id: u32,
    /// Originating node id
    pub from: u64,
    /// Destination node id (0 = broadcast)
    pub to: u64,
    /// Remaining hop budget; strictly decreases per relay
    pub ttl: u8,
    /// Hops taken so far; strictly increases per relay
    pub hop_count: u8,
    /// Sender public key reference, hex
    pub from_pubkey: String,
    /// Opaque encrypted payload
    pub enc: Vec<u8>,
    /// Payload kind
    pub kind: MessageKind,
    /// Creation time, unix seconds
    pub ts: u64,
}

impl MeshMessage {
    /// Create a first-hop envelope: `hop_count` 0, the given TTL.
    pub fn new(
        msg_id: u32,
        from: u64,
        to: u64,
        ttl: u8,
        kind: MessageKind,
        from_pubkey: String,
        enc: Vec<u8>,
    ) -> Self {
        Self {
            msg_id,
            from,
            to,
            ttl,
            hop_count: 0,
            from_pubkey,
            enc,
            kind,
            ts: unix_now(),
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RoutingError> {
        bincode::serialize(self).map_err(|e| RoutingError::Encode(e.to_string()))
    }

    /// Deserialize and validate an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RoutingError> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(RoutingError::Decode(format!(
                "envelope of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        let msg: MeshMessage =
            bincode::deserialize(bytes).map_err(|e| RoutingError::Decode(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    /// Check protocol invariants the decode layer cannot express.
    pub fn validate(&self) -> Result<(), RoutingError> {
        if self.from == 0 {
            return Err(RoutingError::Violation("zero sender node id".into()));
        }
        if self.msg_id == 0 {
            return Err(RoutingError::Violation("zero message id".into()));
        }
        if self.ttl > MAX_TTL {
            return Err(RoutingError::Violation(format!(
                "ttl {} above protocol maximum {MAX_TTL}",
                self.ttl
            )));
        }
        Ok(())
    }

    /// The relayed copy of this envelope: TTL exactly one less, hop count
    /// exactly one more. `None` when the hop budget is spent.
    pub fn next_hop(&self) -> Option<MeshMessage> {
        if self.ttl == 0 {
            return None;
        }
        let mut relayed = self.clone();
        relayed.ttl -= 1;
        relayed.hop_count = relayed.hop_count.saturating_add(1);
        Some(relayed)
    }

    /// The pair deduplication and acknowledgments key on.
    pub fn dedup_key(&self) -> (u64, u32) {
        (self.from, self.msg_id)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MeshMessage {
        MeshMessage::new(
            42,
            1001,
            2002,
            DEFAULT_TTL,
            MessageKind::Chat,
            "ab12".into(),
            vec![1, 2, 3],
        )
    }

    #[test]
    fn test_envelope_round_trip() {
        let msg = sample();
        let bytes = msg.to_bytes().unwrap();
        let decoded = MeshMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(MeshMessage::from_bytes(b"\xFF\xFF\xFF").is_err());
        assert!(MeshMessage::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_validation() {
        let mut msg = sample();
        msg.from = 0;
        assert!(msg.validate().is_err());

        let mut msg = sample();
        msg.msg_id = 0;
        assert!(msg.validate().is_err());

        let mut msg = sample();
        msg.ttl = MAX_TTL + 1;
        assert!(msg.validate().is_err());

        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_next_hop_decrements_exactly_once() {
        let msg = sample();
        let relayed = msg.next_hop().unwrap();
        assert_eq!(relayed.ttl, msg.ttl - 1);
        assert_eq!(relayed.hop_count, msg.hop_count + 1);
        // Envelope content rides along untouched
        assert_eq!(relayed.enc, msg.enc);

        let mut spent = msg;
        spent.ttl = 0;
        assert!(spent.next_hop().is_none());
    }
}
