//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Buffer too short to hold a frame
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated {
        /// Minimum bytes required
        need: usize,
        /// Bytes actually available
        have: usize,
    },

    /// Declared payload length overruns the buffer
    #[error("declared payload length {declared} overruns buffer of {available} bytes")]
    Length {
        /// Payload length from the header
        declared: usize,
        /// Bytes available after the header
        available: usize,
    },

    /// Checksum mismatch
    #[error("checksum mismatch: frame carries {expected:#06x}, computed {computed:#06x}")]
    Checksum {
        /// Checksum carried in the frame trailer
        expected: u16,
        /// Checksum recomputed over the received bytes
        computed: u16,
    },

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown frame type
    #[error("unknown frame type {0:#04x}")]
    Type(u8),

    /// Payload exceeds the frame capacity
    #[error("payload of {0} bytes exceeds frame capacity")]
    Oversize(usize),

    /// Node alias does not parse
    #[error("invalid node alias: {0}")]
    Alias(String),

    /// Malformed chunk preamble
    #[error("malformed chunk header: {0}")]
    ChunkHeader(String),

    /// Frame capacity too small to carry a chunk preamble
    #[error("frame capacity {0} cannot carry a chunk preamble")]
    ChunkCapacity(usize),
}
