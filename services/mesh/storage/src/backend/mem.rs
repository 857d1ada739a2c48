//! In-memory storage backend for development and testing

use crate::{KeyedStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// In-memory keyed store
pub struct MemoryStore {
    /// (namespace, key) -> value
    entries: DashMap<(String, String), Vec<u8>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of entries across all namespaces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn upsert(&self, ns: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        debug!("mem upsert ns={} key={} len={}", ns, key, value.len());
        self.entries
            .insert((ns.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .entries
            .get(&(ns.to_string(), key.to_string()))
            .map(|v| v.clone()))
    }

    async fn remove(&self, ns: &str, key: &str) -> Result<(), StorageError> {
        debug!("mem remove ns={} key={}", ns, key);
        self.entries.remove(&(ns.to_string(), key.to_string()));
        Ok(())
    }

    async fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == ns)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect())
    }
}
