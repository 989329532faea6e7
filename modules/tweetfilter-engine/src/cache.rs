//! Rating cache: merge-upserts keyed by item id, with coalesced writes to the
//! key-value store and an immediate path for results that must not be lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use tweetfilter_common::{
    now_millis, CacheEntry, CacheUpdate, CleanupStats, ItemId, KeyValueStore, TweetFilterError,
};

/// Store key holding the serialized ratings map.
pub const RATINGS_KEY: &str = "tweetRatings";

#[derive(Clone)]
pub struct RatingCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: Mutex<HashMap<ItemId, CacheEntry>>,
    store: Arc<dyn KeyValueStore>,
    flush_delay: Duration,
    flush_scheduled: AtomicBool,
}

impl RatingCache {
    pub fn new(store: Arc<dyn KeyValueStore>, flush_delay: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                store,
                flush_delay,
                flush_scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// Build a cache seeded from whatever the store holds. Only finished
    /// ratings are kept; they are marked as coming from storage.
    pub fn load(store: Arc<dyn KeyValueStore>, flush_delay: Duration) -> Self {
        let cache = Self::new(store, flush_delay);
        let raw = cache.inner.store.get_or(RATINGS_KEY, "{}");

        let parsed: HashMap<ItemId, CacheEntry> = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Stored ratings are unreadable, starting empty");
                HashMap::new()
            }
        };

        let total = parsed.len();
        let mut entries = cache.lock();
        for (id, mut entry) in parsed {
            if !entry.is_final() {
                continue;
            }
            entry.from_storage = true;
            entries.insert(id, entry);
        }
        info!(loaded = entries.len(), dropped = total - entries.len(), "Loaded cached ratings");
        drop(entries);

        cache
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemId, CacheEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Read an entry. An interrupted entry (not streaming, no score) is
    /// deleted and reported as missing.
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(entry) if entry.is_interrupted() => {
                debug!(item_id = %id, "Dropping interrupted cache entry");
                entries.remove(id);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// A finished rating, if one exists.
    pub fn get_final(&self, id: &str) -> Option<CacheEntry> {
        self.get(id).filter(CacheEntry::is_final)
    }

    pub fn has(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Merge `update` into the entry and persist on the coalescing timer.
    pub fn set(&self, id: &str, update: CacheUpdate) {
        self.merge(id, update);
        self.schedule_flush();
    }

    /// Merge `update` and persist before returning.
    pub fn set_immediate(&self, id: &str, update: CacheUpdate) {
        self.merge(id, update);
        self.flush_or_warn();
    }

    fn merge(&self, id: &str, update: CacheUpdate) {
        let now = now_millis();
        let mut entries = self.lock();
        entries.entry(id.to_string()).or_default().merge(update, now);
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            self.schedule_flush();
        }
        removed
    }

    /// Remove the entry unless it holds a finished rating. Used when a stream
    /// is cancelled so nothing half-written is left behind.
    pub fn discard_unfinished(&self, id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(entry) if !entry.is_final() => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every interrupted entry.
    pub fn cleanup(&self) -> CleanupStats {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_interrupted());
        let stats = CleanupStats {
            deleted: before - entries.len(),
            remaining: entries.len(),
        };
        drop(entries);

        if stats.deleted > 0 {
            self.flush_or_warn();
        }
        info!(deleted = stats.deleted, remaining = stats.remaining, "Cache cleanup");
        stats
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.flush_or_warn();
    }

    /// Write every finished rating to the store.
    pub fn flush(&self) -> Result<(), TweetFilterError> {
        let serialized = {
            let entries = self.lock();
            let finals: BTreeMap<&ItemId, &CacheEntry> =
                entries.iter().filter(|(_, e)| e.is_final()).collect();
            serde_json::to_string(&finals).map_err(|e| TweetFilterError::Storage(e.to_string()))?
        };
        self.inner.store.set(RATINGS_KEY, &serialized)?;
        debug!(bytes = serialized.len(), "Flushed rating cache");
        Ok(())
    }

    fn flush_or_warn(&self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to persist rating cache");
        }
    }

    /// Arm the flush timer unless it is already armed. Writes that land
    /// before it fires ride along with that flush.
    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner.flush_scheduled.store(false, Ordering::Release);
            self.flush_or_warn();
            return;
        };

        let cache = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(cache.inner.flush_delay).await;
            cache.inner.flush_scheduled.store(false, Ordering::Release);
            cache.flush_or_warn();
        });
    }
}
