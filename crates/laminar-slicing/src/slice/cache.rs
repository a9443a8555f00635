//! Bounded front cache from slice start to slice.
//!
//! `SliceCache` maps slice starts to non-owning [`SliceRef`]s with FIFO, LRU
//! or second-chance eviction. A removed slice can never be reached through
//! the cache, its entry just stops resolving.
//!
//! Eviction order is kept in a queue of `(start, stamp)` pairs. Re-queuing an
//! entry gives it a fresh stamp and leaves the old pair behind; pairs whose
//! stamp no longer matches their entry are skipped when they reach the front
//! and purged once they outnumber the live entries.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;

use super::state::Slice;
use super::SliceHandle;
use crate::config::{CachePolicy, SliceCacheConfig};
use crate::Timestamp;

/// Validity-checked, non-owning reference to a slice.
#[derive(Debug, Clone, Default)]
pub struct SliceRef {
    handle: Option<SliceHandle>,
    slice: Weak<Slice>,
}

impl SliceRef {
    /// Creates a reference to a live slice.
    #[must_use]
    pub fn new(slice: &Arc<Slice>) -> Self {
        Self {
            handle: Some(slice.handle()),
            slice: Arc::downgrade(slice),
        }
    }

    /// Handle of the referenced slice.
    #[must_use]
    pub fn handle(&self) -> Option<SliceHandle> {
        self.handle
    }

    /// The slice, if it is still owned by its store.
    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<Slice>> {
        let slice = self.slice.upgrade()?;
        (!slice.is_retired() && Some(slice.handle()) == self.handle).then_some(slice)
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: SliceRef,
    /// Stamp of this entry's live position in the eviction queue.
    stamp: u64,
    /// Hit since it was last queued (second chance only).
    referenced: bool,
}

/// Lookup counters of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetrics {
    /// Total `lookup` calls.
    pub lookups: u64,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found an entry whose slice was already removed.
    pub stale: u64,
    /// Entries evicted to make room.
    pub evictions: u64,
}

impl CacheMetrics {
    /// Lookups that fell through to the store, stale entries included.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.lookups - self.hits
    }

    /// Hit rate as a fraction in `[0.0, 1.0]`. Returns 0.0 if no lookups.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

/// Fixed-capacity slice cache for one worker.
///
/// The back of the eviction queue holds the most recently inserted (FIFO,
/// second chance) or most recently used (LRU) entry; eviction takes from the
/// front. With [`CachePolicy::SecondChance`], a front entry that was hit
/// since it was queued goes to the back once instead of being evicted.
///
/// Not synchronized: keep one cache per worker thread.
#[derive(Debug)]
pub struct SliceCache {
    enabled: bool,
    policy: CachePolicy,
    entries: FxHashMap<Timestamp, CacheEntry>,
    order: VecDeque<(Timestamp, u64)>,
    clock: u64,
    max_entries: usize,
    metrics: CacheMetrics,
}

impl SliceCache {
    /// Creates a cache from configuration.
    #[must_use]
    pub fn new(config: &SliceCacheConfig) -> Self {
        Self::with_policy(
            config.policy,
            if config.enable_slice_cache {
                config.number_of_entries
            } else {
                0
            },
        )
    }

    /// Creates a cache with explicit policy and capacity; capacity 0 disables it.
    #[must_use]
    pub fn with_policy(policy: CachePolicy, max_entries: usize) -> Self {
        Self {
            enabled: max_entries > 0,
            policy,
            entries: FxHashMap::default(),
            order: VecDeque::with_capacity(max_entries),
            clock: 0,
            max_entries,
            metrics: CacheMetrics::default(),
        }
    }

    /// Looks up the slice starting at `key`.
    ///
    /// Stale entries are dropped and reported as misses.
    pub fn lookup(&mut self, key: Timestamp) -> Option<Arc<Slice>> {
        if !self.enabled {
            return None;
        }
        self.metrics.lookups += 1;
        let entry = self.entries.get_mut(&key)?;
        let Some(slice) = entry.value.upgrade() else {
            self.metrics.stale += 1;
            tracing::debug!(slice_start = key, "dropping stale slice cache entry");
            self.entries.remove(&key);
            return None;
        };
        self.metrics.hits += 1;
        match self.policy {
            CachePolicy::Lru => self.requeue(key),
            CachePolicy::SecondChance => entry.referenced = true,
            CachePolicy::Fifo => {}
        }
        Some(slice)
    }

    /// Inserts or replaces an entry. Returns the key of the evicted entry, if any.
    pub fn insert(&mut self, key: Timestamp, value: SliceRef) -> Option<Timestamp> {
        if !self.enabled {
            return None;
        }
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            if self.policy == CachePolicy::Lru {
                self.requeue(key);
            }
            return None;
        }

        let evicted = if self.entries.len() >= self.max_entries {
            self.evict()
        } else {
            None
        };
        let stamp = self.tick();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stamp,
                referenced: false,
            },
        );
        self.enqueue(key, stamp);
        evicted
    }

    /// Removes a key from the cache. Returns `true` if it was present.
    pub fn invalidate(&mut self, key: Timestamp) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of entries currently in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum capacity; 0 when disabled.
    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Eviction policy.
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Whether the cache stores anything at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lookup counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn enqueue(&mut self, key: Timestamp, stamp: u64) {
        self.order.push_back((key, stamp));
        if self.order.len() > 2 * self.max_entries {
            let entries = &self.entries;
            self.order
                .retain(|(key, stamp)| entries.get(key).is_some_and(|e| e.stamp == *stamp));
        }
    }

    /// Moves a live entry to the back of the queue.
    fn requeue(&mut self, key: Timestamp) {
        let stamp = self.tick();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.stamp = stamp;
            self.enqueue(key, stamp);
        }
    }

    fn evict(&mut self) -> Option<Timestamp> {
        while let Some((key, stamp)) = self.order.pop_front() {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.stamp != stamp {
                continue;
            }
            if std::mem::take(&mut entry.referenced) {
                self.requeue(key);
                continue;
            }
            self.entries.remove(&key);
            self.metrics.evictions += 1;
            return Some(key);
        }
        None
    }
}
