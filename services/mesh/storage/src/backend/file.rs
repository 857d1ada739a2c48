//! File-based storage backend with checksummed logs and recovery

use crate::{KeyedStore, StorageError};
use async_trait::async_trait;
use crc32fast::Hasher;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const OP_UPSERT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// op(u8) + key_len(u16) + val_len(u32)
const RECORD_HEADER_SIZE: usize = 1 + 2 + 4;
/// Trailing CRC32 over header + key + value
const RECORD_TRAILER_SIZE: usize = 4;

/// Configuration for the file store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory; one log file per namespace
    pub data_dir: PathBuf,
    /// Fsync frequency (1 = every write, N = every N writes)
    pub fsync_every: u32,
    /// Compact a namespace once this many dead records accumulate
    pub compact_min_dead: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./emberdata"),
            fsync_every: 1,
            compact_min_dead: 1024,
        }
    }
}

struct Namespace {
    index: HashMap<String, Vec<u8>>,
    file: File,
    path: PathBuf,
    writes_since_sync: u32,
    dead_records: u64,
}

/// File-backed keyed store.
///
/// Each namespace is an append-only log of checksummed upsert/remove
/// records, replayed into an in-memory index on first touch. A torn tail is
/// truncated at the last intact record; a log corrupt from the first record
/// resets that namespace to empty rather than failing every open.
pub struct FileStore {
    config: FileStoreConfig,
    namespaces: DashMap<String, Namespace>,
}

impl FileStore {
    /// Open a file store rooted at the configured data directory.
    pub fn open(config: FileStoreConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            config,
            namespaces: DashMap::new(),
        })
    }

    fn validate_ns(ns: &str) -> Result<(), StorageError> {
        if ns.is_empty()
            || !ns
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StorageError::Invalid(format!("bad namespace '{ns}'")));
        }
        Ok(())
    }

    fn ensure_ns(
        &self,
        ns: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Namespace>, StorageError> {
        Self::validate_ns(ns)?;
        match self.namespaces.entry(ns.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Ok(occupied.into_ref()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let path = self.config.data_dir.join(format!("{ns}.log"));
                let (index, dead_records) = replay_log(&path)?;
                let file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(&path)?;

                info!(
                    "opened namespace '{}': {} live entries, {} dead records",
                    ns,
                    index.len(),
                    dead_records
                );

                Ok(vacant.insert(Namespace {
                    index,
                    file,
                    path,
                    writes_since_sync: 0,
                    dead_records,
                }))
            }
        }
    }

    fn write_record(
        &self,
        state: &mut Namespace,
        op: u8,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        let record = encode_record(op, key, value);
        state.file.write_all(&record)?;

        state.writes_since_sync += 1;
        if state.writes_since_sync >= self.config.fsync_every {
            state.file.sync_all()?;
            state.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Rewrite a namespace log from its live index, dropping dead records.
    fn compact(&self, ns: &str, state: &mut Namespace) -> Result<(), StorageError> {
        let tmp_path = state.path.with_extension("log.tmp");
        let mut tmp = File::create(&tmp_path)?;
        for (key, value) in &state.index {
            tmp.write_all(&encode_record(OP_UPSERT, key, value))?;
        }
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &state.path)?;

        state.file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&state.path)?;
        state.writes_since_sync = 0;

        info!(
            "compacted namespace '{}': {} live entries kept, {} dead records dropped",
            ns,
            state.index.len(),
            state.dead_records
        );
        state.dead_records = 0;
        Ok(())
    }

    fn maybe_compact(&self, ns: &str, state: &mut Namespace) -> Result<(), StorageError> {
        if state.dead_records >= self.config.compact_min_dead
            && state.dead_records > state.index.len() as u64
        {
            self.compact(ns, state)?;
        }
        Ok(())
    }
}

fn encode_record(op: u8, key: &str, value: &[u8]) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len() + RECORD_TRAILER_SIZE);
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf
}

/// Replay a namespace log into an index. Returns the index and the number
/// of dead (superseded or removed) records encountered.
fn replay_log(path: &PathBuf) -> Result<(HashMap<String, Vec<u8>>, u64), StorageError> {
    let mut index = HashMap::new();
    let mut dead = 0u64;

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((index, dead)),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut offset = 0usize;
    while offset + RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE <= buf.len() {
        let op = buf[offset];
        let key_len = u16::from_le_bytes([buf[offset + 1], buf[offset + 2]]) as usize;
        let val_len = u32::from_le_bytes([
            buf[offset + 3],
            buf[offset + 4],
            buf[offset + 5],
            buf[offset + 6],
        ]) as usize;

        let body_end = offset + RECORD_HEADER_SIZE + key_len + val_len;
        let record_end = body_end + RECORD_TRAILER_SIZE;
        if record_end > buf.len() {
            break; // torn tail
        }

        let mut hasher = Hasher::new();
        hasher.update(&buf[offset..body_end]);
        let computed = hasher.finalize();
        let stored = u32::from_le_bytes([
            buf[body_end],
            buf[body_end + 1],
            buf[body_end + 2],
            buf[body_end + 3],
        ]);
        if computed != stored {
            break; // everything from here on is untrustworthy
        }

        let key_start = offset + RECORD_HEADER_SIZE;
        let key = match std::str::from_utf8(&buf[key_start..key_start + key_len]) {
            Ok(k) => k.to_string(),
            Err(_) => break,
        };

        match op {
            OP_UPSERT => {
                let value = buf[key_start + key_len..body_end].to_vec();
                if index.insert(key, value).is_some() {
                    dead += 1;
                }
            }
            OP_REMOVE => {
                index.remove(&key);
                dead += 2; // the removed record and the tombstone itself
            }
            _ => break,
        }
        offset = record_end;
    }

    if offset < buf.len() {
        // Truncate at the last intact record; offset 0 resets the namespace.
        warn!(
            "namespace log {:?}: discarding {} corrupt trailing bytes at offset {}",
            path,
            buf.len() - offset,
            offset
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
    }

    Ok((index, dead))
}

#[async_trait]
impl KeyedStore for FileStore {
    async fn upsert(&self, ns: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        debug!("file upsert ns={} key={} len={}", ns, key, value.len());
        let mut state = self.ensure_ns(ns)?;
        self.write_record(&mut state, OP_UPSERT, key, value)?;
        if state.index.insert(key.to_string(), value.to_vec()).is_some() {
            state.dead_records += 1;
        }
        self.maybe_compact(ns, &mut state)?;
        Ok(())
    }

    async fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let state = self.ensure_ns(ns)?;
        Ok(state.index.get(key).cloned())
    }

    async fn remove(&self, ns: &str, key: &str) -> Result<(), StorageError> {
        debug!("file remove ns={} key={}", ns, key);
        let mut state = self.ensure_ns(ns)?;
        if state.index.remove(key).is_some() {
            self.write_record(&mut state, OP_REMOVE, key, &[])?;
            state.dead_records += 2;
            self.maybe_compact(ns, &mut state)?;
        }
        Ok(())
    }

    async fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let state = self.ensure_ns(ns)?;
        Ok(state
            .index
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn store_at(dir: &std::path::Path) -> FileStore {
        FileStore::open(FileStoreConfig {
            data_dir: dir.to_path_buf(),
            fsync_every: 1,
            compact_min_dead: 4,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = store_at(dir.path());
            store.upsert("jobs", "a", b"one").await.unwrap();
            store.upsert("jobs", "b", b"two").await.unwrap();
            store.upsert("jobs", "b", b"two-v2").await.unwrap();
            store.remove("jobs", "a").await.unwrap();
        }

        let store = store_at(dir.path());
        assert_eq!(store.get("jobs", "a").await.unwrap(), None);
        assert_eq!(
            store.get("jobs", "b").await.unwrap(),
            Some(b"two-v2".to_vec())
        );
        assert_eq!(store.scan("jobs").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = store_at(dir.path());
            store.upsert("acks", "k1", b"v1").await.unwrap();
        }
        // Simulate a crash mid-write: garbage appended after the last record
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join("acks.log"))
                .unwrap();
            file.write_all(&[OP_UPSERT, 0xFF, 0xFF, 0x01]).unwrap();
        }

        let store = store_at(dir.path());
        assert_eq!(store.get("acks", "k1").await.unwrap(), Some(b"v1".to_vec()));
        // The namespace stays writable after truncation
        store.upsert("acks", "k2", b"v2").await.unwrap();
        assert_eq!(store.scan("acks").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fully_corrupt_log_resets_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.log"), b"not a log at all").unwrap();

        let store = store_at(dir.path());
        assert_eq!(store.get("bad", "any").await.unwrap(), None);
        store.upsert("bad", "fresh", b"start").await.unwrap();
        assert_eq!(
            store.get("bad", "fresh").await.unwrap(),
            Some(b"start".to_vec())
        );
    }

    #[tokio::test]
    async fn test_compaction_keeps_live_state() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = store_at(dir.path());
            for round in 0..10 {
                store
                    .upsert("ctr", "hot", format!("v{round}").as_bytes())
                    .await
                    .unwrap();
            }
        }

        let store = store_at(dir.path());
        assert_eq!(store.get("ctr", "hot").await.unwrap(), Some(b"v9".to_vec()));
    }

    #[tokio::test]
    async fn test_bad_namespace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        assert!(store.get("../escape", "k").await.is_err());
        assert!(store.get("", "k").await.is_err());
    }
}
