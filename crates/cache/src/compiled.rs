//! Single-flight cache of compiled header skeletons.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::debug;

struct Slot<V> {
    version: u64,
    cell: Arc<OnceCell<Arc<V>>>,
}

/// Caches one computed value per key (tenant or site namespace).
///
/// Concurrent misses on the same key share a single computation. A failed
/// computation is not stored, so the next caller retries. Every new slot gets
/// a fresh version number, which the compute function receives.
pub struct CompiledHeaderCache<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    last_good: RwLock<HashMap<String, Arc<V>>>,
    generation: AtomicU64,
}

impl<V: Send + Sync> CompiledHeaderCache<V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            last_good: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key`, computing it at most once on a miss.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (version, cell) = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                version: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
                cell: Arc::new(OnceCell::new()),
            });
            (slot.version, slot.cell.clone())
        };

        if let Some(value) = cell.get() {
            return Ok(value.clone());
        }

        let value = cell
            .get_or_try_init(|| async move {
                debug!(key, version, "Compiling headers");
                compute(version).await.map(Arc::new)
            })
            .await?
            .clone();

        // A slot replaced by invalidation must not overwrite a newer result.
        let slots = self.slots.lock();
        if slots.get(key).map(|s| s.version) == Some(version) {
            self.last_good.write().insert(key.to_string(), value.clone());
        }
        drop(slots);

        Ok(value)
    }

    /// Drop the cached value for `key`. Call only after the mutation has committed.
    pub fn invalidate(&self, key: &str) {
        if self.slots.lock().remove(key).is_some() {
            debug!(key, "Invalidated compiled headers");
        }
    }

    /// The cached value, if present and computed.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        let cell = self.slots.lock().get(key).map(|s| s.cell.clone())?;
        cell.get().cloned()
    }

    /// The most recent successfully computed value, even if since invalidated.
    pub fn last_good(&self, key: &str) -> Option<Arc<V>> {
        self.last_good.read().get(key).cloned()
    }

    /// Number of keys with a live slot.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl<V: Send + Sync> Default for CompiledHeaderCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
