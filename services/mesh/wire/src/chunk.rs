//! Chunk splitting and reassembly for payloads that exceed one frame.
//!
//! Each chunk carries a text preamble ahead of its raw data bytes:
//!
//! ```text
//! MCHK|<version>|<streamId>|<chunkIndex>/<totalChunks>|<dataType>|
//! ```
//!
//! Stream ids are 32-hex uuids and data types are closed tokens, so none of
//! the variable fields can contain the delimiter; the parser scans exactly
//! five delimiters and treats everything after the fifth as chunk data.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Preamble tag opening every chunk
pub const CHUNK_PREFIX: &str = "MCHK";

/// Chunk preamble version
pub const CHUNK_VERSION: u8 = 1;

/// Upper bound on chunks per stream (indices render in at most 4 digits)
pub const MAX_CHUNKS_PER_STREAM: u32 = 9999;

/// How long an incomplete stream may sit idle before eviction
pub const DEFAULT_STREAM_IDLE: Duration = Duration::from_secs(300);

/// What kind of payload a chunk stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Plain text
    Text,
    /// Cashu e-cash token
    Cashu,
    /// Signed transaction package
    Transaction,
    /// Payment forwarding request
    Payment,
    /// Opaque binary
    Binary,
}

impl ChunkKind {
    /// Wire token for the preamble's dataType field.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Text => "text",
            ChunkKind::Cashu => "cashu",
            ChunkKind::Transaction => "tx",
            ChunkKind::Payment => "payment",
            ChunkKind::Binary => "bin",
        }
    }

    /// Parse a preamble dataType token.
    pub fn parse(token: &str) -> Result<Self, WireError> {
        match token {
            "text" => Ok(ChunkKind::Text),
            "cashu" => Ok(ChunkKind::Cashu),
            "tx" => Ok(ChunkKind::Transaction),
            "payment" => Ok(ChunkKind::Payment),
            "bin" => Ok(ChunkKind::Binary),
            other => Err(WireError::ChunkHeader(format!("unknown data type '{other}'"))),
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed chunk preamble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Preamble version
    pub version: u8,
    /// Stream id shared by every chunk of one payload
    pub stream_id: String,
    /// 0-based chunk index
    pub chunk_index: u32,
    /// Total number of chunks in the stream
    pub total_chunks: u32,
    /// Payload kind shared by every chunk of one payload
    pub kind: ChunkKind,
}

impl ChunkHeader {
    /// Render the preamble text.
    pub fn preamble(&self) -> String {
        format!(
            "{}|{}|{}|{}/{}|{}|",
            CHUNK_PREFIX, self.version, self.stream_id, self.chunk_index, self.total_chunks, self.kind
        )
    }

    /// Worst-case preamble size for a stream, with both indices rendered at
    /// full width. Used to derive the effective per-chunk data capacity.
    pub fn overhead(stream_id: &str, kind: ChunkKind) -> usize {
        format!(
            "{CHUNK_PREFIX}|{CHUNK_VERSION}|{stream_id}|{m}/{m}|{kind}|",
            m = MAX_CHUNKS_PER_STREAM
        )
        .len()
    }

    /// Parse a chunk payload into its preamble and data bytes.
    pub fn parse(payload: &[u8]) -> Result<(ChunkHeader, Bytes), WireError> {
        let mut pipes = Vec::with_capacity(5);
        for (i, b) in payload.iter().enumerate() {
            if *b == b'|' {
                pipes.push(i);
                if pipes.len() == 5 {
                    break;
                }
            }
        }
        if pipes.len() < 5 {
            return Err(WireError::ChunkHeader("missing preamble delimiters".into()));
        }

        let field = |from: usize, to: usize| -> Result<&str, WireError> {
            std::str::from_utf8(&payload[from..to])
                .map_err(|_| WireError::ChunkHeader("preamble is not UTF-8".into()))
        };

        if field(0, pipes[0])? != CHUNK_PREFIX {
            return Err(WireError::ChunkHeader("missing MCHK tag".into()));
        }

        let version: u8 = field(pipes[0] + 1, pipes[1])?
            .parse()
            .map_err(|_| WireError::ChunkHeader("bad version field".into()))?;
        if version != CHUNK_VERSION {
            return Err(WireError::ChunkHeader(format!("unsupported version {version}")));
        }

        let stream_id = field(pipes[1] + 1, pipes[2])?.to_string();
        if stream_id.is_empty() {
            return Err(WireError::ChunkHeader("empty stream id".into()));
        }

        let position = field(pipes[2] + 1, pipes[3])?;
        let (index_str, total_str) = position
            .split_once('/')
            .ok_or_else(|| WireError::ChunkHeader("bad index/total field".into()))?;
        let chunk_index: u32 = index_str
            .parse()
            .map_err(|_| WireError::ChunkHeader("bad chunk index".into()))?;
        let total_chunks: u32 = total_str
            .parse()
            .map_err(|_| WireError::ChunkHeader("bad chunk total".into()))?;
        if total_chunks == 0 || total_chunks > MAX_CHUNKS_PER_STREAM {
            return Err(WireError::ChunkHeader(format!("chunk total {total_chunks} out of range")));
        }
        if chunk_index >= total_chunks {
            return Err(WireError::ChunkHeader(format!(
                "chunk index {chunk_index} not below total {total_chunks}"
            )));
        }

        let kind = ChunkKind::parse(field(pipes[3] + 1, pipes[4])?)?;
        let data = Bytes::copy_from_slice(&payload[pipes[4] + 1..]);

        Ok((
            ChunkHeader {
                version,
                stream_id,
                chunk_index,
                total_chunks,
                kind,
            },
            data,
        ))
    }
}

/// One chunk ready for framing
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Preamble fields
    pub header: ChunkHeader,
    /// Data slice of the original payload
    pub data: Bytes,
}

impl Chunk {
    /// Render preamble + data as one frame payload.
    pub fn encode(&self) -> Bytes {
        let preamble = self.header.preamble();
        let mut buf = BytesMut::with_capacity(preamble.len() + self.data.len());
        buf.put_slice(preamble.as_bytes());
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Split a payload into ordered chunks under a fresh stream id.
///
/// The effective per-chunk capacity is `frame_capacity` minus the worst-case
/// preamble overhead; a payload that fits one chunk still gets the preamble
/// with `total_chunks = 1`.
pub fn split(payload: &[u8], kind: ChunkKind, frame_capacity: usize) -> Result<Vec<Chunk>, WireError> {
    let stream_id = Uuid::new_v4().simple().to_string();
    let overhead = ChunkHeader::overhead(&stream_id, kind);
    let effective = match frame_capacity.checked_sub(overhead) {
        Some(c) if c > 0 => c,
        _ => return Err(WireError::ChunkCapacity(frame_capacity)),
    };

    let total = if payload.is_empty() {
        1
    } else {
        (payload.len() + effective - 1) / effective
    };
    if total > MAX_CHUNKS_PER_STREAM as usize {
        return Err(WireError::Oversize(payload.len()));
    }

    let mut chunks = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * effective;
        let end = std::cmp::min(start + effective, payload.len());
        chunks.push(Chunk {
            header: ChunkHeader {
                version: CHUNK_VERSION,
                stream_id: stream_id.clone(),
                chunk_index: index as u32,
                total_chunks: total as u32,
                kind,
            },
            data: Bytes::copy_from_slice(&payload[start..end]),
        });
    }

    debug!(
        stream = %stream_id,
        chunks = total,
        bytes = payload.len(),
        "split payload into chunk stream"
    );
    Ok(chunks)
}

/// Reassembly state for one stream
#[derive(Debug)]
pub struct AssemblyState {
    /// Stream id
    pub stream_id: String,
    /// Expected chunk count
    pub total_chunks: u32,
    /// Payload kind
    pub kind: ChunkKind,
    /// Chunks received so far, keyed by index
    received: BTreeMap<u32, Bytes>,
    /// When the stream was first seen
    created_at: Instant,
    /// Cached completeness hint; reassembly re-verifies every index
    complete: bool,
}

impl AssemblyState {
    fn new(stream_id: String, total_chunks: u32, kind: ChunkKind) -> Self {
        Self {
            stream_id,
            total_chunks,
            kind,
            received: BTreeMap::new(),
            created_at: Instant::now(),
            complete: false,
        }
    }

    /// Chunks received so far.
    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Concatenate the payload if, and only if, every index `0..total` is
    /// present. Checked explicitly rather than trusting the cached flag or
    /// the map size alone.
    pub fn reassemble(&self) -> Option<Bytes> {
        if self.received.len() != self.total_chunks as usize {
            return None;
        }
        for index in 0..self.total_chunks {
            if !self.received.contains_key(&index) {
                return None;
            }
        }
        let mut buf = BytesMut::new();
        for data in self.received.values() {
            buf.put_slice(data);
        }
        Some(buf.freeze())
    }
}

/// Assembly table collecting chunk streams until they complete or go stale.
#[derive(Debug)]
pub struct Reassembler {
    streams: HashMap<String, AssemblyState>,
    max_idle: Duration,
}

impl Reassembler {
    /// Create a reassembler with the default idle eviction period.
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_STREAM_IDLE)
    }

    /// Create a reassembler with a custom idle eviction period.
    pub fn with_max_idle(max_idle: Duration) -> Self {
        Self {
            streams: HashMap::new(),
            max_idle,
        }
    }

    /// Insert one chunk. Out-of-order arrival is fine and re-inserting an
    /// already-seen index is a no-op. Returns the reassembled payload once
    /// the stream completes; the stream is consumed at that point.
    pub fn insert(
        &mut self,
        header: ChunkHeader,
        data: Bytes,
    ) -> Result<Option<(ChunkKind, Bytes)>, WireError> {
        let state = self
            .streams
            .entry(header.stream_id.clone())
            .or_insert_with(|| {
                AssemblyState::new(header.stream_id.clone(), header.total_chunks, header.kind)
            });

        if state.total_chunks != header.total_chunks || state.kind != header.kind {
            return Err(WireError::ChunkHeader(format!(
                "stream {} chunk disagrees with existing state",
                header.stream_id
            )));
        }

        state.received.entry(header.chunk_index).or_insert(data);
        state.complete = state.received.len() == state.total_chunks as usize;

        if let Some(payload) = state.reassemble() {
            let kind = state.kind;
            let stream_id = state.stream_id.clone();
            self.streams.remove(&stream_id);
            debug!(stream = %stream_id, bytes = payload.len(), "chunk stream complete");
            return Ok(Some((kind, payload)));
        }
        Ok(None)
    }

    /// Received/total progress for a stream, if it is known.
    pub fn progress(&self, stream_id: &str) -> Option<(u32, u32)> {
        self.streams
            .get(stream_id)
            .map(|s| (s.received_count(), s.total_chunks))
    }

    /// Evict streams idle past the configured bound. Returns how many were
    /// dropped.
    pub fn evict_idle(&mut self) -> usize {
        let max_idle = self.max_idle;
        let before = self.streams.len();
        self.streams.retain(|stream_id, state| {
            let keep = state.created_at.elapsed() <= max_idle;
            if !keep {
                warn!(
                    stream = %stream_id,
                    received = state.received_count(),
                    total = state.total_chunks,
                    "evicting stale chunk stream"
                );
            }
            keep
        });
        before - self.streams.len()
    }

    /// Number of in-flight streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no streams are in flight.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_round_trip() {
        let header = ChunkHeader {
            version: CHUNK_VERSION,
            stream_id: "a".repeat(32),
            chunk_index: 2,
            total_chunks: 5,
            kind: ChunkKind::Cashu,
        };
        let chunk = Chunk {
            header: header.clone(),
            data: Bytes::from_static(b"\x00\x01|\x02raw"),
        };

        let (parsed, data) = ChunkHeader::parse(&chunk.encode()).unwrap();
        assert_eq!(parsed, header);
        // Data containing the delimiter survives untouched
        assert_eq!(&data[..], b"\x00\x01|\x02raw");
    }

    #[test]
    fn test_parse_rejects_malformed_preambles() {
        assert!(ChunkHeader::parse(b"nope").is_err());
        assert!(ChunkHeader::parse(b"XCHK|1|abc|0/2|text|d").is_err());
        assert!(ChunkHeader::parse(b"MCHK|1|abc|2/2|text|d").is_err()); // index == total
        assert!(ChunkHeader::parse(b"MCHK|1|abc|0/0|text|d").is_err());
        assert!(ChunkHeader::parse(b"MCHK|1|abc|0/2|dunno|d").is_err());
        assert!(ChunkHeader::parse(b"MCHK|9|abc|0/2|text|d").is_err());
        assert!(ChunkHeader::parse(b"MCHK|1||0/2|text|d").is_err());
    }

    #[test]
    fn test_small_payload_single_chunk() {
        let chunks = split(b"tiny", ChunkKind::Text, 232).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].header.total_chunks, 1);
        assert_eq!(&chunks[0].data[..], b"tiny");
    }

    #[test]
    fn test_scenario_cashu_split_and_out_of_order_reassembly() {
        // 500 bytes at 188 effective capacity -> ceil(500/188) = 3 chunks
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let stream_id = "s".repeat(32);
        let capacity = ChunkHeader::overhead(&stream_id, ChunkKind::Cashu) + 188;

        let chunks = split(&payload, ChunkKind::Cashu, capacity).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), 188);
        assert_eq!(chunks[2].data.len(), 500 - 2 * 188);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for index in [2usize, 0, 1] {
            let chunk = &chunks[index];
            result = reassembler
                .insert(chunk.header.clone(), chunk.data.clone())
                .unwrap();
        }
        let (kind, bytes) = result.expect("stream should complete on the third chunk");
        assert_eq!(kind, ChunkKind::Cashu);
        assert_eq!(&bytes[..], &payload[..]);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_duplicate_chunk_is_noop() {
        let payload = vec![7u8; 400];
        let chunks = split(&payload, ChunkKind::Binary, 232).unwrap();
        assert!(chunks.len() > 1);

        let mut reassembler = Reassembler::new();
        // Deliver chunk 0 three times, then the rest once
        for _ in 0..3 {
            let done = reassembler
                .insert(chunks[0].header.clone(), chunks[0].data.clone())
                .unwrap();
            assert!(done.is_none());
            assert_eq!(
                reassembler.progress(&chunks[0].header.stream_id),
                Some((1, chunks.len() as u32))
            );
        }
        let mut result = None;
        for chunk in &chunks[1..] {
            result = reassembler
                .insert(chunk.header.clone(), chunk.data.clone())
                .unwrap();
        }
        assert_eq!(&result.unwrap().1[..], &payload[..]);
    }

    #[test]
    fn test_stream_disagreement_rejected() {
        let mut reassembler = Reassembler::new();
        let header = ChunkHeader {
            version: CHUNK_VERSION,
            stream_id: "x".repeat(32),
            chunk_index: 0,
            total_chunks: 3,
            kind: ChunkKind::Text,
        };
        reassembler
            .insert(header.clone(), Bytes::from_static(b"a"))
            .unwrap();

        let mut conflicting = header;
        conflicting.chunk_index = 1;
        conflicting.total_chunks = 4;
        assert!(reassembler
            .insert(conflicting, Bytes::from_static(b"b"))
            .is_err());
    }

    #[test]
    fn test_idle_stream_eviction() {
        let mut reassembler = Reassembler::with_max_idle(Duration::from_millis(0));
        let chunks = split(&[1u8; 400], ChunkKind::Binary, 232).unwrap();
        reassembler
            .insert(chunks[0].header.clone(), chunks[0].data.clone())
            .unwrap();
        assert_eq!(reassembler.len(), 1);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reassembler.evict_idle(), 1);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_capacity_too_small_for_preamble() {
        assert!(matches!(
            split(b"data", ChunkKind::Text, 10),
            Err(WireError::ChunkCapacity(10))
        ));
    }
}
