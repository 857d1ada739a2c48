//! Bounded deduplication cache over `(sender, message id)` pairs.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default maximum tracked pairs
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Default window after which a pair may legitimately reappear
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Recently seen `(from, msg_id)` pairs, bounded by both entry count and a
/// time window so a legitimate retransmission after cooldown gets through.
#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<(u64, u32), Instant>,
    order: VecDeque<(u64, u32)>,
    capacity: usize,
    window: Duration,
}

impl DedupCache {
    /// Create a cache with the default bounds.
    pub fn new() -> Self {
        Self::with_bounds(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW)
    }

    /// Create a cache with explicit bounds.
    pub fn with_bounds(capacity: usize, window: Duration) -> Self {
        Self {
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            window,
        }
    }

    /// Whether `key` was seen within the window.
    pub fn contains(&self, key: &(u64, u32)) -> bool {
        self.seen
            .get(key)
            .map(|at| at.elapsed() <= self.window)
            .unwrap_or(false)
    }

    /// Record `key` as seen now, evicting the oldest entries past capacity.
    pub fn record(&mut self, key: (u64, u32)) {
        if self.seen.insert(key, Instant::now()).is_none() {
            self.order.push_back(key);
        }
        while self.seen.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drop entries older than the window.
    pub fn purge_expired(&mut self) {
        let window = self.window;
        self.seen.retain(|_, at| at.elapsed() <= window);
        self.order.retain(|key| self.seen.contains_key(key));
    }

    /// Number of tracked pairs.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_contains() {
        let mut cache = DedupCache::new();
        assert!(!cache.contains(&(1, 1)));
        cache.record((1, 1));
        assert!(cache.contains(&(1, 1)));
        assert!(!cache.contains(&(1, 2)));
    }

    #[test]
    fn test_capacity_eviction_drops_oldest() {
        let mut cache = DedupCache::with_bounds(3, DEFAULT_DEDUP_WINDOW);
        for id in 1..=4u32 {
            cache.record((1, id));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&(1, 1)));
        assert!(cache.contains(&(1, 4)));
    }

    #[test]
    fn test_window_expiry_allows_retransmission() {
        let mut cache = DedupCache::with_bounds(16, Duration::from_millis(0));
        cache.record((1, 1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.contains(&(1, 1)));

        cache.purge_expired();
        assert!(cache.is_empty());
    }
}
