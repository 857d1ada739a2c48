//! Keyed persistence for emberlink: upsert/query by natural id with
//! pluggable backends.
//!
//! The mesh stack persists small records — pending acknowledgments, relay
//! jobs, message-id counters — keyed by a natural id inside a namespace.
//! This crate provides that collaborator with read-your-writes semantics,
//! an in-memory backend for dev/tests, and a durable file backend with
//! checksummed append-only logs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use thiserror::Error;

/// Namespace holding pending-acknowledgment records
pub const NS_PENDING_ACK: &str = "pending_ack";
/// Namespace holding relay-job records
pub const NS_RELAY_JOB: &str = "relay_job";
/// Namespace holding allocation counters
pub const NS_COUNTER: &str = "counter";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keyed upsert/query store.
///
/// Writes are visible to subsequent reads on the same handle; keys are
/// unique within a namespace.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Insert or replace the value for `key` in `ns`.
    async fn upsert(&self, ns: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Fetch the value for `key` in `ns`, if present.
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete the value for `key` in `ns`. Deleting a missing key is a no-op.
    async fn remove(&self, ns: &str, key: &str) -> Result<(), StorageError>;

    /// All `(key, value)` pairs in `ns`, in unspecified order.
    async fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    InMemory,
    /// File-based storage with per-namespace append-only logs
    File {
        /// Data directory path
        data_dir: String,
        /// Fsync frequency (1 = every write, N = every N writes)
        fsync_every: u32,
    },
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::InMemory
    }
}

// Re-export backend implementations
pub use backend::file::{FileStore, FileStoreConfig};
pub use backend::mem::MemoryStore;

/// Open a store for the given mode.
pub async fn open_store(mode: StorageMode) -> Result<std::sync::Arc<dyn KeyedStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(std::sync::Arc::new(MemoryStore::new())),
        StorageMode::File {
            data_dir,
            fsync_every,
        } => {
            let config = FileStoreConfig {
                data_dir: data_dir.into(),
                fsync_every,
                ..FileStoreConfig::default()
            };
            Ok(std::sync::Arc::new(FileStore::open(config)?))
        }
    }
}
