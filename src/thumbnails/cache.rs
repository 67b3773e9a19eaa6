//! Bounded LRU cache of decoded thumbnails.
//!
//! - Capacity is counted in entries, not bytes
//! - Insertion beyond capacity evicts the least recently used entry and
//!   releases its lease before the new entry becomes visible
//! - A single mutex guards every structural change (hit reordering, insertion,
//!   eviction); operations are O(1) and contention is UI-driven, so low

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::resource::{Dispose, Lease};
use crate::PageIndex;

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently cached.
    pub entries: usize,
    /// Maximum number of entries.
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    /// Entries dropped to make room for newer ones.
    pub evictions: u64,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheState<K: Hash + Eq, R: Dispose> {
    entries: LruCache<K, Lease<R>>,
    stats: CacheStats,
}

/// Thread-safe LRU store of image leases keyed by page index.
///
/// Cloning yields another handle to the same cache.
pub struct ThumbnailCache<R: Dispose, K: Hash + Eq + Copy = PageIndex> {
    state: Arc<Mutex<CacheState<K, R>>>,
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

impl<R: Dispose, K: Hash + Eq + Copy + std::fmt::Debug> ThumbnailCache<R, K> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = non_zero(capacity);
        debug!(capacity = capacity.get(), "Initialized thumbnail cache");

        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                stats: CacheStats {
                    capacity: capacity.get(),
                    ..Default::default()
                },
            })),
        }
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn try_get(&self, key: &K) -> Option<Lease<R>> {
        let mut state = self.state.lock();
        let hit = state.entries.get(key).cloned();
        if hit.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        hit
    }

    /// Insert `value` as the most recently used entry.
    ///
    /// At capacity the least recently used entry is evicted first. A previous
    /// value for the same key is replaced. Either displaced lease is released
    /// while the lock is still held, so its image is disposed before any reader
    /// can observe the new entry (unless someone else still holds it).
    pub fn put(&self, key: K, value: Lease<R>) {
        let mut state = self.state.lock();
        let displaced = state.entries.push(key, value);
        state.stats.insertions += 1;

        if let Some((old_key, old_value)) = displaced {
            if old_key != key {
                state.stats.evictions += 1;
                trace!(evicted = ?old_key, inserted = ?key, "Evicted thumbnail from cache");
            }
            drop(old_value);
        }

        state.stats.entries = state.entries.len();
    }

    /// Check for `key` without touching recency.
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Remove `key`, returning its lease if present.
    ///
    /// The image is disposed once the returned lease (and any other holder)
    /// is dropped.
    pub fn remove(&self, key: &K) -> Option<Lease<R>> {
        let mut state = self.state.lock();
        let removed = state.entries.pop(key);
        state.stats.entries = state.entries.len();
        removed
    }

    /// Drop every entry, disposing images nobody else holds.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.stats.entries = 0;
        debug!(count, "Cleared thumbnail cache");
    }

    /// Change the capacity, evicting least recently used entries if needed.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = non_zero(capacity);
        let mut state = self.state.lock();
        while state.entries.len() > capacity.get() {
            if state.entries.pop_lru().is_none() {
                break;
            }
            state.stats.evictions += 1;
        }
        state.entries.resize(capacity);
        state.stats.capacity = capacity.get();
        state.stats.entries = state.entries.len();
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        self.state.lock().entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().entries.cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }
}

impl<R: Dispose, K: Hash + Eq + Copy> Clone for ThumbnailCache<R, K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TrackedImage;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn filled(capacity: usize, pages: &[u32]) -> (ThumbnailCache<TrackedImage>, Arc<AtomicUsize>) {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = ThumbnailCache::new(capacity);
        for &page in pages {
            cache.put(page, Lease::new(TrackedImage::new(page, &disposals)));
        }
        (cache, disposals)
    }

    fn sorted_keys(cache: &ThumbnailCache<TrackedImage>) -> Vec<u32> {
        let mut keys = cache.keys();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_evicts_oldest_insertion() {
        let (cache, disposals) = filled(3, &[1, 2, 3, 4]);

        assert_eq!(sorted_keys(&cache), vec![2, 3, 4]);
        assert!(!cache.contains(&1));
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_hit_protects_from_eviction() {
        let (cache, disposals) = filled(3, &[1, 2, 3]);

        let hit = cache.try_get(&1).map(|lease| lease.page_index);
        assert_eq!(hit, Some(1));

        cache.put(4, Lease::new(TrackedImage::new(4, &disposals)));
        assert_eq!(sorted_keys(&cache), vec![1, 3, 4]);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retains_most_recent_insertions() {
        let capacity = 7;
        let pages: Vec<u32> = (0..50).collect();
        let (cache, disposals) = filled(capacity, &pages);

        assert_eq!(sorted_keys(&cache), (43..50).collect::<Vec<_>>());
        assert_eq!(disposals.load(Ordering::SeqCst), 50 - capacity);

        cache.clear();
        assert_eq!(disposals.load(Ordering::SeqCst), 50);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_outside_holder_defers_disposal() {
        let (cache, disposals) = filled(1, &[1]);
        let shown = cache.try_get(&1).unwrap();

        cache.put(2, Lease::new(TrackedImage::new(2, &disposals)));
        assert!(!cache.contains(&1));
        // Still displayed somewhere: must stay alive.
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        assert_eq!(shown.page_index, 1);

        drop(shown);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replace_same_key() {
        let (cache, disposals) = filled(2, &[5]);
        cache.put(5, Lease::new(TrackedImage::new(5, &disposals)));

        assert_eq!(cache.len(), 1);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_remove_and_stats() {
        let (cache, disposals) = filled(4, &[1, 2]);

        assert!(cache.try_get(&9).is_none());
        assert!(cache.try_get(&2).is_some());

        let removed = cache.remove(&1);
        assert!(removed.is_some());
        drop(removed);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert!(cache.remove(&1).is_none());

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shrink_capacity() {
        let (cache, disposals) = filled(4, &[1, 2, 3, 4]);
        cache.set_capacity(2);

        assert_eq!(cache.capacity(), 2);
        assert_eq!(sorted_keys(&cache), vec![3, 4]);
        assert_eq!(disposals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let (cache, _) = filled(0, &[1, 2]);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.keys(), vec![2]);
    }
}
