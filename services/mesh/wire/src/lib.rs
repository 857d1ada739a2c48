//! Radio frame codec and chunking for the emberlink mesh.
//!
//! This crate implements the low-level wire protocol for a constrained
//! multi-hop radio mesh: a fixed 30-byte big-endian frame header with a
//! trailing CRC16/CCITT checksum, a printable node alias mapping, and
//! split/reassembly of payloads too large for one ~200-byte frame.
//!
//! Everything here is a pure transform over byte buffers. Corrupt or
//! truncated input surfaces as a [`WireError`], never a panic, so a
//! transport read loop can feed frames straight into [`Frame::decode`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod error;
pub mod frame;
pub mod header;

pub use chunk::{
    split, AssemblyState, Chunk, ChunkHeader, ChunkKind, Reassembler, CHUNK_PREFIX, CHUNK_VERSION,
    DEFAULT_STREAM_IDLE, MAX_CHUNKS_PER_STREAM,
};
pub use error::WireError;
pub use frame::{crc16_ccitt, Frame};
pub use header::{
    node_alias, parse_alias, Flags, FrameType, BROADCAST_NODE, CHECKSUM_SIZE, HEADER_SIZE,
    MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, NODE_ALIAS_TAG, WIRE_VERSION,
};
