//! Frame header definitions: protocol constants, frame types, flags, and
//! the node id / printable alias mapping.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 30;

/// Trailing checksum size in bytes
pub const CHECKSUM_SIZE: usize = 2;

/// Maximum payload carried by one frame
pub const MAX_PAYLOAD_SIZE: usize = 200;

/// Maximum encoded frame size (header + payload + checksum)
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CHECKSUM_SIZE;

/// Destination node id meaning "every node"
pub const BROADCAST_NODE: u64 = 0;

/// Tag prefixing every printable node alias
pub const NODE_ALIAS_TAG: &str = "embr-";

/// Frame types carried on the radio link
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Plain text message
    Text = 0x01,
    /// Acknowledgment; payload carries the acked message id
    Ack = 0x02,
    /// One chunk of an oversized payload
    Chunk = 0x03,
    /// Request for a gateway to relay to an internet service
    RelayRequest = 0x04,
    /// Relay job outcome mirrored back onto the mesh
    RelayStatus = 0x05,
    /// Gateway capability announcement
    Announce = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Text),
            0x02 => Ok(FrameType::Ack),
            0x03 => Ok(FrameType::Chunk),
            0x04 => Ok(FrameType::RelayRequest),
            0x05 => Ok(FrameType::RelayStatus),
            0x06 => Ok(FrameType::Announce),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Frame flag bits; all eight bits are assigned
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Payload is an encrypted envelope
        const ENCRYPTED = 1 << 0;
        /// Payload is compressed
        const COMPRESSED = 1 << 1;
        /// Payload carries a multi-hop routing envelope
        const MULTI_HOP = 1 << 2;
        /// Sender expects an ACK frame back
        const ACK_REQUESTED = 1 << 3;
        /// Sub-mesh addressing information present
        const SUB_MESH = 1 << 4;
        /// Payload carries a signature
        const SIGNED = 1 << 5;
        /// Frame addresses every node
        const BROADCAST = 1 << 6;
        /// Frame was re-emitted by a relay hop
        const RELAY = 1 << 7;
    }
}

/// Render a node id as its printable alias: fixed tag + 16 hex digits.
pub fn node_alias(node_id: u64) -> String {
    format!("{NODE_ALIAS_TAG}{node_id:016x}")
}

/// Parse a printable alias back to a node id.
pub fn parse_alias(alias: &str) -> Result<u64, crate::WireError> {
    let hex = alias
        .strip_prefix(NODE_ALIAS_TAG)
        .ok_or_else(|| crate::WireError::Alias(alias.to_string()))?;
    if hex.len() != 16 {
        return Err(crate::WireError::Alias(alias.to_string()));
    }
    u64::from_str_radix(hex, 16).map_err(|_| crate::WireError::Alias(alias.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01).unwrap(), FrameType::Text);
        assert_eq!(FrameType::try_from(0x06).unwrap(), FrameType::Announce);
        assert!(FrameType::try_from(0x00).is_err());
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_flags() {
        let flags = Flags::ENCRYPTED | Flags::ACK_REQUESTED;
        assert!(flags.contains(Flags::ENCRYPTED));
        assert!(flags.contains(Flags::ACK_REQUESTED));
        assert!(!flags.contains(Flags::BROADCAST));
        assert_eq!(Flags::all().bits(), 0xFF);
    }

    #[test]
    fn test_alias_round_trip() {
        let id = 0x0011_2233_4455_6677u64;
        let alias = node_alias(id);
        assert_eq!(alias, "embr-0011223344556677");
        assert_eq!(parse_alias(&alias).unwrap(), id);
    }

    #[test]
    fn test_alias_rejects_garbage() {
        assert!(parse_alias("node-0011223344556677").is_err());
        assert!(parse_alias("embr-00112233").is_err());
        assert!(parse_alias("embr-00112233445566zz").is_err());
    }
}
