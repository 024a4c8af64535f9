//! In-memory decoded-resource cache bounded by a byte budget.
//!
//! Entries live in a sharded map so lookups never contend on a single lock.
//! Inserts, eviction and clearing share one accounting lock, so the byte total
//! always matches the stored entries. Eviction removes the least recently
//! accessed entries that no live target is bound to, until the total drops
//! under the water mark.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, TargetKey, TargetRef};
use crate::domain::ports::Payload;

/// Default hard ceiling of the cache, in bytes.
pub const DEFAULT_CEILING_BYTES: u64 = 24 * 1024 * 1024;

/// Default post-cleanup water mark, in bytes.
pub const DEFAULT_WATER_MARK_BYTES: u64 = 12 * 1024 * 1024;

/// A cached payload with its accounting data.
pub struct CachedEntry<P> {
    payload: Arc<P>,
    size: u64,
    last_access: AtomicU64,
    bound: Mutex<HashMap<TargetKey, TargetRef>>,
}

impl<P: Payload> CachedEntry<P> {
    fn new(payload: Arc<P>, tick: u64) -> Self {
        let size = payload.size_in_bytes();
        Self {
            payload,
            size,
            last_access: AtomicU64::new(tick),
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// The decoded payload.
    #[must_use]
    pub fn payload(&self) -> &Arc<P> {
        &self.payload
    }

    /// Estimated size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns true while at least one live target displays this entry.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        let mut bound = self.bound.lock();
        bound.retain(|_, target| target.strong_count() > 0);
        !bound.is_empty()
    }

    fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }

    fn recency(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn bind(&self, target: TargetKey, liveness: TargetRef) {
        self.bound.lock().insert(target, liveness);
    }

    fn unbind(&self, target: TargetKey) {
        self.bound.lock().remove(&target);
    }
}

impl<P> std::fmt::Debug for CachedEntry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEntry")
            .field("size", &self.size)
            .field("last_access", &self.last_access.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// What a target displays.
struct Binding {
    key: CacheKey,
    target: TargetRef,
}

/// Byte-bounded cache of decoded payloads, safe to share between workers and
/// the UI thread.
pub struct MemoryCache<P> {
    entries: DashMap<CacheKey, Arc<CachedEntry<P>>>,
    bindings: DashMap<TargetKey, Binding>,
    total_bytes: AtomicU64,
    clock: AtomicU64,
    ceiling: u64,
    water_mark: u64,
    cleanup: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<P: Payload> MemoryCache<P> {
    /// Creates a cache with the given ceiling and water mark.
    /// A water mark above the ceiling is clamped to the ceiling.
    #[must_use]
    pub fn new(ceiling: u64, water_mark: u64) -> Self {
        Self {
            entries: DashMap::new(),
            bindings: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            ceiling,
            water_mark: water_mark.min(ceiling),
            cleanup: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Looks up an entry and marks it as recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry<P>>> {
        let entry = self.entries.get(key).map(|e| e.value().clone());
        if let Some(entry) = &entry {
            entry.touch(self.tick());
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
        }
        entry
    }

    /// Returns true if `key` is cached, without touching recency or statistics.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Wraps and stores a payload, then evicts if the ceiling is exceeded.
    pub fn put(&self, key: CacheKey, payload: Arc<P>) -> Arc<CachedEntry<P>> {
        let entry = Arc::new(CachedEntry::new(payload, self.tick()));
        let guard = self.cleanup.lock();
        if let Some(previous) = self.entries.insert(key.clone(), entry.clone()) {
            self.total_bytes.fetch_sub(previous.size, Ordering::Relaxed);
            // Targets bound to the old payload now show the same key.
            for (target, liveness) in previous.bound.lock().drain() {
                entry.bind(target, liveness);
            }
        }
        self.total_bytes.fetch_add(entry.size, Ordering::Relaxed);
        debug!(key = %key, size = entry.size, "Stored payload in memory cache");

        if self.total_bytes() > self.ceiling {
            self.evict_locked(&guard, self.water_mark, Some(&key));
        }
        entry
    }

    /// Records that `target` now displays the entry under `key`, releasing
    /// whatever it displayed before.
    pub fn bind(&self, target: TargetKey, liveness: TargetRef, key: &CacheKey) {
        let binding = Binding {
            key: key.clone(),
            target: liveness.clone(),
        };
        if let Some(previous) = self.bindings.insert(target, binding)
            && previous.key != *key
            && let Some(old) = self.entries.get(&previous.key)
        {
            old.unbind(target);
        }
        if let Some(entry) = self.entries.get(key) {
            entry.bind(target, liveness);
        }
    }

    /// Releases whatever `target` displays, making it evictable again.
    pub fn unbind(&self, target: TargetKey) {
        if let Some((_, binding)) = self.bindings.remove(&target)
            && let Some(entry) = self.entries.get(&binding.key)
        {
            entry.unbind(target);
        }
    }

    /// Evicts every entry that is not bound to a live target.
    /// Used when decoding ran out of memory.
    pub fn emergency_cleanup(&self) -> usize {
        let guard = self.cleanup.lock();
        debug!(total = self.total_bytes(), "Emergency memory cache cleanup");
        self.evict_locked(&guard, 0, None)
    }

    /// Drops every entry and binding.
    pub fn clear(&self) {
        let _guard = self.cleanup.lock();
        self.entries.clear();
        self.bindings.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        debug!("Cleared memory cache");
    }

    /// Number of targets recorded as displaying an entry.
    #[must_use]
    pub fn bound_targets(&self) -> usize {
        self.bindings.len()
    }

    /// Total estimated bytes of all entries.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured hard ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Configured water mark.
    #[must_use]
    pub const fn water_mark(&self) -> u64 {
        self.water_mark
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            entries: self.len(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Evicts least recently accessed unbound entries until the total is at
    /// most `target`. Bound entries are skipped, so the total may stay above
    /// the target when nothing else is left. Bindings of dropped targets are
    /// pruned on the way.
    fn evict_locked(
        &self,
        _guard: &MutexGuard<'_, ()>,
        target: u64,
        keep: Option<&CacheKey>,
    ) -> usize {
        self.bindings
            .retain(|_, binding| binding.target.strong_count() > 0);
        if self.total_bytes() <= target {
            return 0;
        }

        let mut candidates: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .filter(|e| Some(e.key()) != keep && !e.value().is_bound())
            .map(|e| (e.key().clone(), e.value().recency()))
            .collect();
        candidates.sort_by_key(|(_, recency)| *recency);

        let mut evicted = 0;
        for (key, _) in candidates {
            if self.total_bytes() <= target {
                break;
            }
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| !e.is_bound()) {
                self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                evicted += 1;
                trace!(key = %key, size = entry.size, "Evicted from memory cache");
            }
        }

        let total = self.total_bytes();
        if total > target {
            debug!(total, target, "Memory cache still above target, remaining entries are bound");
        }
        debug!(evicted, total, "Memory cache cleanup complete");
        evicted
    }
}

impl<P> std::fmt::Debug for MemoryCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .field("total_bytes", &self.total_bytes.load(Ordering::Relaxed))
            .field("ceiling", &self.ceiling)
            .field("water_mark", &self.water_mark)
            .finish_non_exhaustive()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached payloads.
    pub entries: usize,
    /// Current estimated size in bytes.
    pub total_bytes: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} entries, {} bytes, {:.1}% hit rate ({} hits, {} misses)",
            self.entries, self.total_bytes, self.hit_rate, self.hits, self.misses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::target_ref;

    fn blob(size: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0u8; size])
    }

    #[test]
    fn test_put_then_get_returns_same_payload() {
        let cache = MemoryCache::new(1000, 500);
        let payload = blob(10);

        cache.put(CacheKey::new("a"), payload.clone());
        let entry = cache.get(&CacheKey::new("a")).unwrap();

        assert!(Arc::ptr_eq(entry.payload(), &payload));
    }

    #[test]
    fn test_repeated_get_keeps_accounting() {
        let cache = MemoryCache::new(1000, 500);
        cache.put(CacheKey::new("a"), blob(100));
        let before = cache.total_bytes();

        for _ in 0..5 {
            let _ = cache.get(&CacheKey::new("a"));
        }

        assert_eq!(cache.total_bytes(), before);
        assert_eq!(cache.stats().hits, 5);
    }

    #[test]
    fn test_replacing_key_keeps_accounting() {
        let cache = MemoryCache::new(1000, 500);
        cache.put(CacheKey::new("a"), blob(100));
        cache.put(CacheKey::new("a"), blob(40));

        assert_eq!(cache.total_bytes(), 40);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_reaches_water_mark() {
        let cache = MemoryCache::new(1000, 400);
        for i in 0..10 {
            cache.put(CacheKey::new(format!("k{i}")), blob(100));
        }
        assert_eq!(cache.total_bytes(), 1000);

        // The eleventh insertion crosses the ceiling and triggers a cleanup pass.
        cache.put(CacheKey::new("k10"), blob(100));

        assert!(cache.total_bytes() <= 400);
        assert!(cache.contains(&CacheKey::new("k10")));
        assert!(!cache.contains(&CacheKey::new("k0")));
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        let cache = MemoryCache::new(300, 200);
        cache.put(CacheKey::new("old"), blob(100));
        cache.put(CacheKey::new("mid"), blob(100));
        cache.put(CacheKey::new("new"), blob(100));

        // Accessing "old" makes "mid" the eviction candidate.
        let _ = cache.get(&CacheKey::new("old"));
        cache.put(CacheKey::new("newest"), blob(100));

        assert!(cache.contains(&CacheKey::new("old")));
        assert!(!cache.contains(&CacheKey::new("mid")));
    }

    #[test]
    fn test_bound_entries_survive_and_overshoot_is_tolerated() {
        let cache = MemoryCache::new(250, 100);
        let view_a = Arc::new(());
        let view_b = Arc::new(());

        cache.put(CacheKey::new("a"), blob(100));
        cache.bind(TargetKey::of(&view_a), target_ref(&view_a), &CacheKey::new("a"));
        cache.put(CacheKey::new("b"), blob(100));
        cache.bind(TargetKey::of(&view_b), target_ref(&view_b), &CacheKey::new("b"));
        cache.put(CacheKey::new("c"), blob(100));

        assert!(cache.contains(&CacheKey::new("a")));
        assert!(cache.contains(&CacheKey::new("b")));
        assert_eq!(cache.total_bytes(), 300);
    }

    #[test]
    fn test_dropped_target_releases_entry() {
        let cache = MemoryCache::new(150, 100);
        let view = Arc::new(());

        cache.put(CacheKey::new("a"), blob(100));
        cache.bind(TargetKey::of(&view), target_ref(&view), &CacheKey::new("a"));
        drop(view);
        cache.put(CacheKey::new("b"), blob(100));

        assert!(!cache.contains(&CacheKey::new("a")));
    }

    #[test]
    fn test_rebinding_target_releases_previous_entry() {
        let cache = MemoryCache::new(10_000, 10_000);
        let view = Arc::new(());
        let target = TargetKey::of(&view);

        cache.put(CacheKey::new("a"), blob(10));
        cache.put(CacheKey::new("b"), blob(10));
        cache.bind(target, target_ref(&view), &CacheKey::new("a"));
        cache.bind(target, target_ref(&view), &CacheKey::new("b"));

        assert!(!cache.get(&CacheKey::new("a")).unwrap().is_bound());
        assert!(cache.get(&CacheKey::new("b")).unwrap().is_bound());

        cache.unbind(target);
        assert!(!cache.get(&CacheKey::new("b")).unwrap().is_bound());
    }

    #[test]
    fn test_emergency_cleanup_keeps_bound() {
        let cache = MemoryCache::new(10_000, 5_000);
        let view = Arc::new(());
        cache.put(CacheKey::new("a"), blob(10));
        cache.put(CacheKey::new("b"), blob(10));
        cache.bind(TargetKey::of(&view), target_ref(&view), &CacheKey::new("b"));

        assert_eq!(cache.emergency_cleanup(), 1);
        assert!(cache.contains(&CacheKey::new("b")));
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn test_clear() {
        let cache = MemoryCache::new(10_000, 5_000);
        cache.put(CacheKey::new("a"), blob(10));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_cleanup_prunes_dropped_targets() {
        let cache = MemoryCache::new(10_000, 5_000);
        let kept = Arc::new(());
        cache.put(CacheKey::new("a"), blob(10));
        cache.put(CacheKey::new("b"), blob(10));
        let dropped: Vec<_> = (0..5).map(Arc::new).collect();
        for view in &dropped {
            cache.bind(TargetKey::of(view), target_ref(view), &CacheKey::new("a"));
        }
        cache.bind(TargetKey::of(&kept), target_ref(&kept), &CacheKey::new("b"));
        assert_eq!(cache.bound_targets(), 6);
        drop(dropped);

        assert_eq!(cache.emergency_cleanup(), 1);
        assert_eq!(cache.bound_targets(), 1);
        assert!(cache.contains(&CacheKey::new("b")));
    }

    #[test]
    fn test_clear_racing_inserts_keeps_accounting() {
        let cache = Arc::new(MemoryCache::new(1_000_000, 500_000));
        for round in 0..20 {
            let writers: Vec<_> = (0..4)
                .map(|t| {
                    let cache = cache.clone();
                    std::thread::spawn(move || {
                        for i in 0..25 {
                            cache.put(CacheKey::new(format!("{round}-{t}-{i}")), blob(100));
                        }
                    })
                })
                .collect();
            for _ in 0..10 {
                cache.clear();
                std::thread::yield_now();
            }
            for writer in writers {
                writer.join().unwrap();
            }

            let sum: u64 = cache.entries.iter().map(|e| e.value().size()).sum();
            assert_eq!(sum, cache.total_bytes(), "round {round}");
        }

        cache.emergency_cleanup();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_concurrent_inserts_keep_budget() {
        let cache = Arc::new(MemoryCache::new(2_000, 1_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.put(CacheKey::new(format!("{t}-{i}")), blob(50));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sum: u64 = cache.entries.iter().map(|e| e.value().size()).sum();
        assert_eq!(sum, cache.total_bytes());
        assert!(cache.total_bytes() <= 2_000);
    }
}
