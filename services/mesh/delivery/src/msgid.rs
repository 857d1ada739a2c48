//! Message-id allocation.
//!
//! Ids are unique per sender. The canonical path is a persisted counter
//! that survives restarts; when storage is unavailable the allocator falls
//! back to a truncated-timestamp seed with a rolling low half — best
//! effort only, since that can collide across fast restarts.

use ember_storage::{KeyedStore, NS_COUNTER};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Key the counter persists under in [`NS_COUNTER`]
pub const MESSAGE_ID_KEY: &str = "message_id";

/// Allocates per-sender-unique u32 message ids.
pub struct MessageIdAllocator {
    store: Option<Arc<dyn KeyedStore>>,
    next: AtomicU32,
    degraded: AtomicBool,
}

impl MessageIdAllocator {
    /// Open the allocator, resuming from the persisted counter when one
    /// exists.
    pub async fn open(store: Option<Arc<dyn KeyedStore>>) -> Self {
        let (start, degraded) = match &store {
            Some(store) => match store.get(NS_COUNTER, MESSAGE_ID_KEY).await {
                Ok(Some(raw)) => {
                    let last = std::str::from_utf8(&raw)
                        .ok()
                        .and_then(|s| s.parse::<u32>().ok());
                    match last {
                        Some(last) => (last.wrapping_add(1).max(1), false),
                        None => {
                            warn!("persisted message-id counter is unreadable, reseeding");
                            (fallback_seed(), false)
                        }
                    }
                }
                Ok(None) => (1, false),
                Err(e) => {
                    warn!("message-id counter unavailable, falling back to timestamp seed: {e}");
                    (fallback_seed(), true)
                }
            },
            None => (fallback_seed(), true),
        };

        debug!(start, degraded, "message-id allocator ready");
        Self {
            store,
            next: AtomicU32::new(start),
            degraded: AtomicBool::new(degraded),
        }
    }

    /// Allocate the next id and persist the counter (best effort).
    pub async fn next_id(&self) -> u32 {
        let mut id = self.next.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            // Zero is reserved; skip it on wrap
            id = self.next.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(store) = &self.store {
            if let Err(e) = store
                .upsert(NS_COUNTER, MESSAGE_ID_KEY, id.to_string().as_bytes())
                .await
            {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!("message-id counter persistence lost, ids are best-effort: {e}");
                }
            }
        }
        id
    }

    /// Whether allocation is running on the best-effort fallback.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

/// Truncated unix time in the high half, rolling low 16 bits.
fn fallback_seed() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    ((now & 0xFFFF) << 16).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_storage::MemoryStore;

    #[tokio::test]
    async fn test_ids_are_sequential_and_nonzero() {
        let allocator = MessageIdAllocator::open(None).await;
        let a = allocator.next_id().await;
        let b = allocator.next_id().await;
        assert_ne!(a, 0);
        assert_eq!(b, a.wrapping_add(1));
        assert!(allocator.is_degraded());
    }

    #[tokio::test]
    async fn test_counter_survives_reopen() {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());

        let first = {
            let allocator = MessageIdAllocator::open(Some(store.clone())).await;
            assert!(!allocator.is_degraded());
            let mut last = 0;
            for _ in 0..5 {
                last = allocator.next_id().await;
            }
            last
        };

        let allocator = MessageIdAllocator::open(Some(store)).await;
        let next = allocator.next_id().await;
        assert_eq!(next, first + 1, "reopened counter must not reissue ids");
    }
}
