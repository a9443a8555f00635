//! Owning container of the live slices of one operator instance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{SliceAssigner, SliceError, SliceHandle, SliceLifecycle};
use super::state::Slice;
use crate::config::SliceKind;
use crate::time::Watermark;
use crate::Timestamp;

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    slice: Option<Arc<Slice>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_start: BTreeMap<Timestamp, usize>,
    closed: bool,
}

impl StoreInner {
    fn get(&self, start: Timestamp) -> Option<&Arc<Slice>> {
        let &slot = self.by_start.get(&start)?;
        self.slots.get(slot)?.slice.as_ref()
    }

    fn live(&self) -> impl Iterator<Item = &Arc<Slice>> + '_ {
        self.by_start
            .values()
            .filter_map(|&slot| self.slots.get(slot)?.slice.as_ref())
    }

    fn insert(&mut self, build: impl FnOnce(SliceHandle) -> Slice) -> Arc<Slice> {
        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        });
        let entry = &mut self.slots[slot];
        let slice = Arc::new(build(SliceHandle {
            slot,
            generation: entry.generation,
        }));
        entry.slice = Some(Arc::clone(&slice));
        self.by_start.insert(slice.start(), slot);
        slice
    }

    fn take(&mut self, start: Timestamp) -> Option<Arc<Slice>> {
        let slot = self.by_start.remove(&start)?;
        let entry = self.slots.get_mut(slot)?;
        let slice = entry.slice.take()?;
        entry.generation += 1;
        self.free.push(slot);
        slice.retire();
        Some(slice)
    }
}

/// Thread-safe owner of every live [`Slice`] of one operator instance.
///
/// Slices live in a generation-tagged arena indexed by slice start. Lookups
/// take a read lock; only creating or removing a slice takes the write lock,
/// and only for the map update. Slice content is never touched under the
/// store lock.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use laminar_slicing::config::{SliceKind, WindowSpec};
/// use laminar_slicing::slice::{SliceAssigner, SliceStore};
///
/// let store = SliceStore::new(SliceAssigner::new(WindowSpec::tumbling(10)), SliceKind::Aggregation, 4);
/// let a = store.get_or_create_slice(3)?;
/// let b = store.get_or_create_slice(7)?;
/// assert!(Arc::ptr_eq(&a, &b));
/// assert_eq!(a.interval(), (0, 10));
/// # Ok::<(), laminar_slicing::slice::SliceError>(())
/// ```
#[derive(Debug)]
pub struct SliceStore {
    assigner: SliceAssigner,
    kind: SliceKind,
    partitions: usize,
    inner: RwLock<StoreInner>,
    created: AtomicU64,
    removed: AtomicU64,
}

impl SliceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(assigner: SliceAssigner, kind: SliceKind, partitions: usize) -> Self {
        Self {
            assigner,
            kind,
            partitions,
            inner: RwLock::new(StoreInner::default()),
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
        }
    }

    /// Slice boundaries used by this store.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Kind of every slice in this store.
    #[must_use]
    pub fn kind(&self) -> SliceKind {
        self.kind
    }

    /// Returns the slice containing `timestamp`, creating it if needed.
    ///
    /// Concurrent first-time callers for the same interval race for the write
    /// lock; the first one creates the slice and all observe the same `Arc`.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::StoreClosed`] after [`close`](Self::close).
    pub fn get_or_create_slice(&self, timestamp: Timestamp) -> Result<Arc<Slice>, SliceError> {
        let (start, end) = self.assigner.slice_bounds(timestamp);
        {
            let inner = self.inner.read();
            if inner.closed {
                return Err(SliceError::StoreClosed);
            }
            if let Some(slice) = inner.get(start) {
                return Ok(Arc::clone(slice));
            }
        }

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(SliceError::StoreClosed);
        }
        if let Some(slice) = inner.get(start) {
            return Ok(Arc::clone(slice));
        }
        let (kind, partitions) = (self.kind, self.partitions);
        let slice = inner.insert(|handle| Slice::new(start, end, handle, kind, partitions));
        drop(inner);

        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(slice_start = start, slice_end = end, "created slice");
        Ok(slice)
    }

    /// Returns the slice starting exactly at `start`.
    #[must_use]
    pub fn get_slice(&self, start: Timestamp) -> Option<Arc<Slice>> {
        self.inner.read().get(start).cloned()
    }

    /// Slices lying entirely within `[start, end)`, ordered by start.
    #[must_use]
    pub fn get_slices_for_range(&self, start: Timestamp, end: Timestamp) -> Vec<Arc<Slice>> {
        if start >= end {
            return Vec::new();
        }
        let inner = self.inner.read();
        inner
            .by_start
            .range(start..end)
            .filter_map(|(_, &slot)| inner.slots.get(slot)?.slice.as_ref())
            .filter(|slice| slice.end() <= end)
            .cloned()
            .collect()
    }

    /// Snapshot of every live slice, ordered by start.
    #[must_use]
    pub fn get_all_slices(&self) -> Vec<Arc<Slice>> {
        self.inner.read().live().cloned().collect()
    }

    /// Open slices closed by `watermark`, in ascending end order.
    #[must_use]
    pub fn closed_by(&self, watermark: Watermark) -> Vec<Arc<Slice>> {
        let inner = self.inner.read();
        inner
            .live()
            .take_while(|slice| watermark.closes(slice.end()))
            .filter(|slice| slice.lifecycle() == SliceLifecycle::Open)
            .cloned()
            .collect()
    }

    /// Flushed slices that no window beyond `watermark` still needs.
    #[must_use]
    pub fn expired_by(&self, watermark: Watermark) -> Vec<Timestamp> {
        let inner = self.inner.read();
        inner
            .live()
            .take_while(|slice| watermark.closes(slice.end()))
            .filter(|slice| {
                slice.lifecycle() == SliceLifecycle::Flushed
                    && watermark.closes(self.assigner.retention_end(slice.start()))
            })
            .map(|slice| slice.start())
            .collect()
    }

    /// Resolves a handle; `None` if the slice was removed since.
    #[must_use]
    pub fn resolve(&self, handle: SliceHandle) -> Option<Arc<Slice>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.slice.clone()
    }

    /// Removes the slice starting at `start`.
    ///
    /// # Errors
    ///
    /// - [`SliceError::NotFound`] if no such slice is live
    /// - [`SliceError::WritersInFlight`] if a writer still holds the slice;
    ///   the slice stays in the store
    pub fn remove_slice(&self, start: Timestamp) -> Result<Arc<Slice>, SliceError> {
        let mut inner = self.inner.write();
        let slice = inner.get(start).ok_or(SliceError::NotFound { start })?;
        let writers = slice.in_flight_writers();
        if writers > 0 {
            let (start, end) = slice.interval();
            tracing::error!(slice_start = start, slice_end = end, writers, "removal with writers in flight");
            return Err(SliceError::WritersInFlight { start, end, writers });
        }
        let slice = inner.take(start).ok_or(SliceError::NotFound { start })?;
        drop(inner);

        self.removed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(slice_start = slice.start(), slice_end = slice.end(), "removed slice");
        Ok(slice)
    }

    /// Inserts a slice with explicit bounds, or returns the existing one.
    ///
    /// Used when restoring migrated state.
    ///
    /// # Errors
    ///
    /// - [`SliceError::BoundsMismatch`] if `[start, end)` is not a slice of
    ///   this store's window specification
    /// - [`SliceError::StoreClosed`] after [`close`](Self::close)
    pub fn get_or_insert_exact(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Arc<Slice>, SliceError> {
        let (expected_start, expected_end) = self.assigner.slice_bounds(start);
        if (expected_start, expected_end) != (start, end) {
            return Err(SliceError::BoundsMismatch {
                start,
                end,
                expected_start,
                expected_end,
            });
        }
        self.get_or_create_slice(start)
    }

    /// Refuses further creations and drains every slice.
    ///
    /// Returned slices are already retired; any handle or cache entry pointing
    /// at them resolves to nothing.
    pub fn close(&self) -> Vec<Arc<Slice>> {
        let mut inner = self.inner.write();
        inner.closed = true;
        let starts: Vec<Timestamp> = inner.by_start.keys().copied().collect();
        let drained: Vec<_> = starts.into_iter().filter_map(|s| inner.take(s)).collect();
        drop(inner);
        self.removed.fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Number of live slices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_start.len()
    }

    /// Returns `true` if no slice is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_start.is_empty()
    }

    /// Total slices ever created.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Total slices ever removed.
    #[must_use]
    pub fn removed_count(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}
