//! Frame encoding and decoding.
//!
//! Frames are fixed-header binary units with a trailing CRC16 checksum,
//! sized for radio links that cap transmissions near 200 payload bytes:
//!
//! ```text
//! offset 0   version        u8
//!        1   type           u8
//!        2   flags          u8
//!        3   ttl            u8
//!        4   message id     u32 (big-endian)
//!        8   from node id   u64
//!        16  to node id     u64 (0 = broadcast)
//!        24  timestamp      u32 (unix seconds)
//!        28  payload length u16
//!        30  payload        0..=200 bytes
//!         +  checksum       u16 CRC16/CCITT over every preceding byte
//! ```

use crate::header::{
    Flags, FrameType, BROADCAST_NODE, CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, WIRE_VERSION,
};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// One frame on the radio link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version
    pub version: u8,
    /// Frame type
    pub frame_type: FrameType,
    /// Flag bits
    pub flags: Flags,
    /// Remaining hop budget
    pub ttl: u8,
    /// Message id, unique per sender
    pub message_id: u32,
    /// Originating node id
    pub from_node: u64,
    /// Destination node id (0 = broadcast)
    pub to_node: u64,
    /// Creation time, unix seconds
    pub timestamp: u32,
    /// Opaque payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with empty payload and default TTL.
    pub fn new(frame_type: FrameType, from_node: u64, to_node: u64, message_id: u32) -> Self {
        Self {
            version: WIRE_VERSION,
            frame_type,
            flags: Flags::empty(),
            ttl: 0,
            message_id,
            from_node,
            to_node,
            timestamp: unix_now(),
            payload: Bytes::new(),
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Set flag bits.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the hop budget.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Build an ACK frame answering `acked`, carrying the acked message id
    /// as a 4-byte big-endian payload.
    pub fn ack_for(acked: &Frame, local_node: u64, message_id: u32) -> Self {
        Frame::new(FrameType::Ack, local_node, acked.from_node, message_id)
            .with_payload(Bytes::copy_from_slice(&acked.message_id.to_be_bytes()))
    }

    /// The message id an ACK frame acknowledges, if this is a well-formed ACK.
    pub fn acked_message_id(&self) -> Option<u32> {
        if self.frame_type != FrameType::Ack || self.payload.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Whether the frame addresses every node.
    pub fn is_broadcast(&self) -> bool {
        self.to_node == BROADCAST_NODE
    }

    /// Encode the frame to wire bytes, appending the CRC16 trailer.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::Oversize(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE);
        buf.put_u8(self.version);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.ttl);
        buf.put_u32(self.message_id);
        buf.put_u64(self.from_node);
        buf.put_u64(self.to_node);
        buf.put_u32(self.timestamp);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        let crc = crc16_ccitt(&buf);
        buf.put_u16(crc);

        Ok(buf.freeze())
    }

    /// Decode one frame from `buf`.
    ///
    /// The checksum must validate or the frame is rejected; a corrupt or
    /// truncated buffer is reported through [`WireError`], never a panic.
    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        if buf.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE + CHECKSUM_SIZE,
                have: buf.len(),
            });
        }

        let version = buf[0];
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let frame_type = FrameType::try_from(buf[1])?;
        let flags = Flags::from_bits_retain(buf[2]);
        let ttl = buf[3];

        let payload_len = u16::from_be_bytes([buf[28], buf[29]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WireError::Oversize(payload_len));
        }
        if HEADER_SIZE + payload_len + CHECKSUM_SIZE > buf.len() {
            return Err(WireError::Length {
                declared: payload_len,
                available: buf.len() - HEADER_SIZE - CHECKSUM_SIZE,
            });
        }

        let covered = HEADER_SIZE + payload_len;
        let expected = u16::from_be_bytes([buf[covered], buf[covered + 1]]);
        let computed = crc16_ccitt(&buf[..covered]);
        if expected != computed {
            return Err(WireError::Checksum { expected, computed });
        }

        Ok(Frame {
            version,
            frame_type,
            flags,
            ttl,
            message_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            from_node: u64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            to_node: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
            timestamp: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..HEADER_SIZE + payload_len]),
        })
    }
}

/// CRC16/CCITT: poly 0x1021, init 0xFFFF, MSB-first, no final XOR.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
