//! In-memory LRU cache with per-entry expiry.

use std::hash::Hash;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Bounded cache whose entries expire after a fixed time-to-live.
///
/// Least recently used entries are evicted first once `max_size` is reached.
pub struct TtlCache<K, V> {
    entries: Mutex<IndexMap<K, Entry<V>>>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Get a live entry and mark it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let entry = entries.shift_remove(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }

        let value = entry.value.clone();
        entries.insert(key.clone(), entry);
        Some(value)
    }

    pub fn put(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        entries.shift_remove(&key);

        if entries.len() >= self.max_size {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
        }
        while entries.len() >= self.max_size {
            entries.shift_remove_index(0);
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().shift_remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
