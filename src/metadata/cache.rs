// Metadata cache for the object storage node
//
// Bounded LRU cache in front of the metadata store. The cache is strictly a
// subset of the store: write-through on store, invalidate on delete, never
// the source of truth for existence. Callers always receive a copy.

use crate::types::ObjectMetadata;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(3600);

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookup hits
    pub hits: u64,

    /// Lookup misses
    pub misses: u64,

    /// Entries currently cached
    pub entries: usize,

    /// hits / (hits + misses)
    pub hit_rate: f64,
}

struct CacheEntry {
    metadata: ObjectMetadata,
    #[allow(dead_code)]
    cached_at: Instant,
    last_access: Instant,
    access_count: u64,
}

/// Bounded LRU cache of metadata records
pub struct MetadataCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    max_idle: Duration,
}

impl MetadataCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }

    /// Look up a key, returning a defensive copy on hit.
    pub fn get(&self, key: &str) -> Option<ObjectMetadata> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.metadata.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or refresh an entry.
    ///
    /// A record older than the cached one (by `updated_at`) is ignored, so
    /// racing writers converge on the last write.
    pub fn put(&self, metadata: &ObjectMetadata) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.peek(&metadata.key) {
            if existing.metadata.updated_at > metadata.updated_at {
                return;
            }
        }
        let now = Instant::now();
        entries.put(
            metadata.key.clone(),
            CacheEntry {
                metadata: metadata.clone(),
                cached_at: now,
                last_access: now,
                access_count: 0,
            },
        );
    }

    /// Drop a key from the cache.
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// hits / (hits + misses), or 0 when the cache is untouched.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            entries: self.len(),
            hit_rate: self.hit_rate(),
        }
    }

    /// Evict entries untouched for at least `max_idle`. Returns the count.
    pub fn evict_idle(&self) -> usize {
        let mut entries = self.entries.lock();
        let idle: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.last_access.elapsed() >= self.max_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &idle {
            entries.pop(key);
        }
        idle.len()
    }

    /// Spawn the background maintenance loop.
    ///
    /// The task holds a weak reference and exits once the cache is dropped.
    pub fn start_maintenance(cache: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let evicted = cache.evict_idle();
                if evicted > 0 {
                    debug!("metadata cache maintenance evicted {} idle entries", evicted);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key: &str) -> ObjectMetadata {
        ObjectMetadata::new(key)
    }

    #[test]
    fn hit_and_miss_accounting() {
        let cache = MetadataCache::new(10);
        assert!(cache.get("a").is_none());
        cache.put(&meta("a"));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = MetadataCache::new(2);
        cache.put(&meta("a"));
        cache.put(&meta("b"));
        // Touch "a" so "b" is the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.put(&meta("c"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn returns_defensive_copies() {
        let cache = MetadataCache::new(4);
        cache.put(&meta("a"));
        let mut copy = cache.get("a").unwrap();
        copy.content_type = "mutated".to_string();
        assert_eq!(cache.get("a").unwrap().content_type, "");
    }

    #[test]
    fn stale_put_does_not_clobber_newer_entry() {
        let cache = MetadataCache::new(4);
        let mut newer = meta("a");
        newer.content_type = "new".to_string();
        let mut older = meta("a");
        older.content_type = "old".to_string();
        older.updated_at = newer.updated_at - chrono::Duration::seconds(5);

        cache.put(&newer);
        cache.put(&older);
        assert_eq!(cache.get("a").unwrap().content_type, "new");
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = MetadataCache::new(4);
        cache.put(&meta("a"));
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }
}
