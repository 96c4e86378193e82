//! In-memory deduplication cache for event fingerprints.
//!
//! Tracks which event ids have already been broadcast so the ingress can
//! reject duplicates. Entries expire after a TTL; when the cache reaches its
//! size bound, a 20% batch is evicted to make room. This is an emergency bulk
//! cut by iteration order, not an LRU; the TTL does the real cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

/// TTL-bounded set of recently broadcast event ids.
///
/// Thread-safe; share via `Arc`.
pub struct DedupCache {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone)]
pub struct DedupCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl DedupCache {
    /// Create a cache with the given entry lifetime and capacity bound.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether a fingerprint is present and unexpired.
    ///
    /// An entry past its TTL counts as a miss but is left in place; the
    /// reaper and capacity eviction handle deletion. A hit does not refresh
    /// the entry's timestamp.
    pub fn is_cached(&self, fingerprint: &str) -> bool {
        let entries = self.entries.read();
        let fresh = entries
            .get(fingerprint)
            .is_some_and(|inserted| inserted.elapsed() <= self.ttl);
        drop(entries);

        if fresh {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dedup_hits_total").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dedup_misses_total").increment(1);
        }
        fresh
    }

    /// Record a fingerprint as broadcast.
    ///
    /// If the cache is at capacity, evicts `max_size / 5` entries first.
    pub fn insert(&self, fingerprint: &str) {
        let mut entries = self.entries.write();

        if entries.len() >= self.max_size {
            let batch = (self.max_size / 5).max(1);
            let victims: Vec<String> = entries.keys().take(batch).cloned().collect();
            for key in &victims {
                entries.remove(key);
            }
            debug!(
                "Dedup cache full ({}), evicted {} entries",
                self.max_size,
                victims.len()
            );
            metrics::counter!("dedup_evictions_total").increment(victims.len() as u64);
        }

        entries.insert(fingerprint.to_string(), Instant::now());
    }

    /// Delete every entry past its TTL. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, inserted| inserted.elapsed() <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Dedup reaper removed {} expired entries", removed);
        }
        removed
    }

    /// How often the background reaper should wake: a tenth of the TTL,
    /// clamped to [30s, 5min].
    pub fn reaper_interval(&self) -> Duration {
        (self.ttl / 10)
            .min(Duration::from_secs(5 * 60))
            .max(Duration::from_secs(30))
    }

    /// Number of entries currently held (expired or not).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DedupCacheStats {
        DedupCacheStats {
            size: self.len(),
            max_size: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_ms: u64, max: usize) -> DedupCache {
        DedupCache::new(Duration::from_millis(ttl_ms), max)
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = cache(60_000, 100);

        assert!(!cache.is_cached("abc"));
        cache.insert("abc");
        assert!(cache.is_cached("abc"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_expired_entry_counts_as_miss() {
        let cache = cache(20, 100);
        cache.insert("abc");
        std::thread::sleep(Duration::from_millis(40));

        assert!(!cache.is_cached("abc"));
        // lookup does not delete; only the reaper does
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = cache(20, 100);
        cache.insert("old");
        std::thread::sleep(Duration::from_millis(40));
        cache.insert("fresh");

        let removed = cache.purge_expired();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_cached("fresh"));
    }

    #[test]
    fn test_capacity_eviction_drops_twenty_percent() {
        let cache = cache(60_000, 10);
        for i in 0..10 {
            cache.insert(&format!("id-{}", i));
        }
        assert_eq!(cache.len(), 10);

        // at capacity: the next insert evicts 10/5 = 2 entries, then inserts
        cache.insert("one-more");
        assert_eq!(cache.len(), 9);
        assert!(cache.is_cached("one-more"));
    }

    #[test]
    fn test_size_never_exceeds_max() {
        let cache = cache(60_000, 10);
        for i in 0..100 {
            cache.insert(&format!("id-{}", i));
            assert!(cache.len() <= 10);
        }
    }

    #[test]
    fn test_counters_are_monotonic() {
        let cache = cache(60_000, 100);
        let mut last = 0;
        for i in 0..10 {
            cache.insert(&format!("id-{}", i));
            cache.is_cached(&format!("id-{}", i));
            cache.is_cached("absent");
            let stats = cache.stats();
            let total = stats.hits + stats.misses;
            assert!(total >= last);
            last = total;
        }
    }

    #[test]
    fn test_reaper_interval_clamping() {
        // ttl/10 below 30s clamps up
        assert_eq!(
            cache(60_000, 10).reaper_interval(),
            Duration::from_secs(30)
        );
        // 10min ttl -> 60s
        assert_eq!(
            DedupCache::new(Duration::from_secs(600), 10).reaper_interval(),
            Duration::from_secs(60)
        );
        // huge ttl clamps to 5min
        assert_eq!(
            DedupCache::new(Duration::from_secs(86_400), 10).reaper_interval(),
            Duration::from_secs(300)
        );
    }
}
