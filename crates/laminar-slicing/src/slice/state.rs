//! Slice content and lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::SliceError;
use crate::buffer::Record;
use crate::config::SliceKind;
use crate::Timestamp;

/// Arena position of a slice, tagged with the slot's generation.
///
/// A handle outlives its slice; resolving it after removal yields nothing
/// because the slot's generation has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceHandle {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

impl SliceHandle {
    /// Arena slot.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Slot generation at creation time.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Trigger state of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SliceLifecycle {
    /// Accepting writes.
    Open = 0,
    /// Closed by the watermark; handed to the probe.
    Triggering = 1,
    /// Acknowledged by the probe.
    Flushed = 2,
}

impl SliceLifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Triggering,
            _ => Self::Flushed,
        }
    }
}

/// Outcome of [`Slice::try_trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAttempt {
    /// The caller owns the trigger and must hand the slice to the probe.
    Triggered,
    /// A writer was in flight; the slice stays open.
    WritersInFlight,
    /// Another caller triggered the slice first.
    AlreadyTriggered,
}

/// Running aggregate of one key within one slice.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
pub struct PartialAggregate {
    /// Number of values.
    pub count: u64,
    /// Sum of values (wrapping).
    pub sum: i64,
    /// Smallest value.
    pub min: i64,
    /// Largest value.
    pub max: i64,
}

impl PartialAggregate {
    /// Aggregate of a single value.
    #[must_use]
    pub fn of(value: i64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    /// Folds one value in.
    pub fn add(&mut self, value: i64) {
        self.count += 1;
        self.sum = self.sum.wrapping_add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Combines two partial aggregates of the same key.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.sum = self.sum.wrapping_add(other.sum);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Mean of the values, `None` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

/// Per-key aggregation state, striped by key hash.
#[derive(Debug)]
pub struct AggregationState {
    records: AtomicU64,
    stripes: Box<[Mutex<FxHashMap<u64, PartialAggregate>>]>,
}

impl AggregationState {
    fn new(stripes: usize) -> Self {
        Self {
            records: AtomicU64::new(0),
            stripes: (0..stripes.max(1))
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
        }
    }

    fn stripe(&self, key: u64) -> &Mutex<FxHashMap<u64, PartialAggregate>> {
        &self.stripes[partition_of(key, self.stripes.len())]
    }

    pub(crate) fn merge(&self, key: u64, aggregate: &PartialAggregate) {
        self.stripe(key)
            .lock()
            .entry(key)
            .and_modify(|a| a.merge(aggregate))
            .or_insert(*aggregate);
        self.records.fetch_add(aggregate.count, Ordering::AcqRel);
    }

    /// Number of records folded in.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Acquire)
    }

    /// Snapshot of every key's aggregate, ordered by key.
    #[must_use]
    pub fn aggregates(&self) -> Vec<(u64, PartialAggregate)> {
        let mut out: Vec<_> = self
            .stripes
            .iter()
            .flat_map(|stripe| {
                stripe
                    .lock()
                    .iter()
                    .map(|(&k, &a)| (k, a))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_unstable_by_key(|&(k, _)| k);
        out
    }

    /// Aggregate of one key.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<PartialAggregate> {
        self.stripe(key).lock().get(&key).copied()
    }
}

/// Input side of a two-way join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Left (build) input.
    Left,
    /// Right (probe) input.
    Right,
}

/// One buffered join tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTuple {
    /// Join key.
    pub key: u64,
    /// Record timestamp.
    pub timestamp: Timestamp,
    /// Tuple bytes.
    pub payload: Bytes,
}

#[derive(Debug)]
struct JoinSideState {
    tuples: AtomicU64,
    partitions: Box<[Mutex<Vec<JoinTuple>>]>,
}

impl JoinSideState {
    fn new(partitions: usize) -> Self {
        Self {
            tuples: AtomicU64::new(0),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }
}

/// Per-side, hash-partitioned tuple storage of a join slice.
#[derive(Debug)]
pub struct JoinState {
    left: JoinSideState,
    right: JoinSideState,
}

impl JoinState {
    fn new(partitions: usize) -> Self {
        Self {
            left: JoinSideState::new(partitions),
            right: JoinSideState::new(partitions),
        }
    }

    fn side(&self, side: JoinSide) -> &JoinSideState {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    pub(crate) fn push(&self, side: JoinSide, tuple: JoinTuple) {
        let state = self.side(side);
        state.partitions[partition_of(tuple.key, state.partitions.len())]
            .lock()
            .push(tuple);
        state.tuples.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of hash partitions per side.
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.left.partitions.len()
    }

    /// Tuples stored for `side`.
    #[must_use]
    pub fn tuple_count(&self, side: JoinSide) -> u64 {
        self.side(side).tuples.load(Ordering::Acquire)
    }

    /// Copy of one partition of one side.
    #[must_use]
    pub fn partition(&self, side: JoinSide, partition: usize) -> Vec<JoinTuple> {
        self.side(side)
            .partitions
            .get(partition)
            .map(|p| p.lock().clone())
            .unwrap_or_default()
    }

    /// Copy of every tuple of one side, partition by partition.
    #[must_use]
    pub fn tuples(&self, side: JoinSide) -> Vec<JoinTuple> {
        self.side(side)
            .partitions
            .iter()
            .flat_map(|p| p.lock().clone())
            .collect()
    }

    /// Partition that tuples with `key` land in.
    #[must_use]
    pub fn partition_for(&self, key: u64) -> usize {
        partition_of(key, self.num_partitions())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn partition_of(key: u64, partitions: usize) -> usize {
    (fxhash::hash64(&key) % partitions as u64) as usize
}

/// What a slice holds.
#[derive(Debug)]
pub enum SliceState {
    /// Record count and per-key partial aggregates.
    Aggregation(AggregationState),
    /// Two-sided join tuples.
    Join(JoinState),
}

/// Record or tuple counts of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TupleCounts {
    /// Aggregated records, or left-side tuples for joins.
    pub left: u64,
    /// Right-side tuples; always 0 for aggregation slices.
    pub right: u64,
}

impl TupleCounts {
    /// Total count.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.left + self.right
    }
}

/// State of one `[start, end)` time bucket.
///
/// The interval is immutable; the content is mutated concurrently by every
/// worker that sees a record in the interval. Writers announce themselves
/// through [`begin_write`](Self::begin_write) so the trigger and the store
/// can tell whether a write is still in flight.
#[derive(Debug)]
pub struct Slice {
    start: Timestamp,
    end: Timestamp,
    handle: SliceHandle,
    lifecycle: AtomicU8,
    writers: AtomicUsize,
    retired: AtomicBool,
    emit_failed: AtomicBool,
    state: SliceState,
}

impl Slice {
    pub(crate) fn new(
        start: Timestamp,
        end: Timestamp,
        handle: SliceHandle,
        kind: SliceKind,
        partitions: usize,
    ) -> Self {
        let state = match kind {
            SliceKind::Aggregation => SliceState::Aggregation(AggregationState::new(partitions)),
            SliceKind::Join => SliceState::Join(JoinState::new(partitions)),
        };
        Self {
            start,
            end,
            handle,
            lifecycle: AtomicU8::new(SliceLifecycle::Open as u8),
            writers: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            emit_failed: AtomicBool::new(false),
            state,
        }
    }

    /// Slice start (inclusive).
    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Slice end (exclusive).
    #[must_use]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// `(start, end)`.
    #[must_use]
    pub fn interval(&self) -> (Timestamp, Timestamp) {
        (self.start, self.end)
    }

    /// Arena handle.
    #[must_use]
    pub fn handle(&self) -> SliceHandle {
        self.handle
    }

    /// Kind of content.
    #[must_use]
    pub fn kind(&self) -> SliceKind {
        match self.state {
            SliceState::Aggregation(_) => SliceKind::Aggregation,
            SliceState::Join(_) => SliceKind::Join,
        }
    }

    /// Content.
    #[must_use]
    pub fn state(&self) -> &SliceState {
        &self.state
    }

    /// Aggregation content, if this is an aggregation slice.
    #[must_use]
    pub fn aggregation(&self) -> Option<&AggregationState> {
        match &self.state {
            SliceState::Aggregation(state) => Some(state),
            SliceState::Join(_) => None,
        }
    }

    /// Join content, if this is a join slice.
    #[must_use]
    pub fn join(&self) -> Option<&JoinState> {
        match &self.state {
            SliceState::Join(state) => Some(state),
            SliceState::Aggregation(_) => None,
        }
    }

    /// Records (aggregation) or per-side tuples (join) stored so far.
    #[must_use]
    pub fn tuple_counts(&self) -> TupleCounts {
        match &self.state {
            SliceState::Aggregation(state) => TupleCounts {
                left: state.records(),
                right: 0,
            },
            SliceState::Join(state) => TupleCounts {
                left: state.tuple_count(JoinSide::Left),
                right: state.tuple_count(JoinSide::Right),
            },
        }
    }

    /// Returns `true` if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tuple_counts().total() == 0
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> SliceLifecycle {
        SliceLifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Writers currently holding a [`SliceWriteGuard`].
    #[must_use]
    pub fn in_flight_writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    /// Returns `true` once the store has removed the slice.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Registers a writer.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::Closed`] if the slice was already triggered.
    pub fn begin_write(&self) -> Result<SliceWriteGuard<'_>, SliceError> {
        self.writers.fetch_add(1, Ordering::SeqCst);
        if self.lifecycle.load(Ordering::SeqCst) != SliceLifecycle::Open as u8 {
            self.writers.fetch_sub(1, Ordering::SeqCst);
            return Err(SliceError::Closed {
                start: self.start,
                end: self.end,
            });
        }
        Ok(SliceWriteGuard { slice: self })
    }

    /// Moves the slice from `Open` to `Triggering`.
    ///
    /// Rolls back to `Open` if a writer is in flight, so the write lands
    /// before the slice is handed to the probe.
    pub fn try_trigger(&self) -> TriggerAttempt {
        if self
            .lifecycle
            .compare_exchange(
                SliceLifecycle::Open as u8,
                SliceLifecycle::Triggering as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return TriggerAttempt::AlreadyTriggered;
        }
        if self.writers.load(Ordering::SeqCst) > 0 {
            self.lifecycle
                .store(SliceLifecycle::Open as u8, Ordering::SeqCst);
            return TriggerAttempt::WritersInFlight;
        }
        TriggerAttempt::Triggered
    }

    /// Moves the slice from `Open` to `Triggering` without waiting for writers.
    ///
    /// Returns `false` if it was already triggered.
    pub fn seal(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                SliceLifecycle::Open as u8,
                SliceLifecycle::Triggering as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Moves a sealed slice back to `Open`. Returns `false` if it was not `Triggering`.
    pub(crate) fn reopen(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                SliceLifecycle::Triggering as u8,
                SliceLifecycle::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Records the probe's acknowledgment.
    pub fn mark_flushed(&self) {
        self.lifecycle
            .store(SliceLifecycle::Flushed as u8, Ordering::SeqCst);
    }

    /// Flags a triggered slice whose emission was rejected, so a later
    /// flush may claim it again.
    pub(crate) fn mark_emit_failed(&self) {
        self.emit_failed.store(true, Ordering::SeqCst);
    }

    /// Claims a slice whose emission was rejected. Succeeds at most once
    /// per rejection.
    pub(crate) fn take_emit_failure(&self) -> bool {
        self.emit_failed.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

/// Proof that a writer is registered on a slice; unregisters on drop.
#[derive(Debug)]
pub struct SliceWriteGuard<'a> {
    slice: &'a Slice,
}

impl SliceWriteGuard<'_> {
    /// Folds a record into an aggregation slice.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::KindMismatch`] on a join slice.
    pub fn aggregate(&self, record: &Record) -> Result<(), SliceError> {
        let SliceState::Aggregation(state) = &self.slice.state else {
            return Err(self.mismatch(SliceKind::Aggregation));
        };
        state
            .stripe(record.key)
            .lock()
            .entry(record.key)
            .and_modify(|a| a.add(record.value))
            .or_insert_with(|| PartialAggregate::of(record.value));
        state.records.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Appends a record to one side of a join slice.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::KindMismatch`] on an aggregation slice.
    pub fn append(&self, side: JoinSide, record: &Record) -> Result<(), SliceError> {
        let SliceState::Join(state) = &self.slice.state else {
            return Err(self.mismatch(SliceKind::Join));
        };
        state.push(
            side,
            JoinTuple {
                key: record.key,
                timestamp: record.timestamp,
                payload: record.payload.clone(),
            },
        );
        Ok(())
    }

    /// The slice being written.
    #[must_use]
    pub fn slice(&self) -> &Slice {
        self.slice
    }

    fn mismatch(&self, expected: SliceKind) -> SliceError {
        SliceError::KindMismatch {
            start: self.slice.start,
            end: self.slice.end,
            expected,
        }
    }
}

impl Drop for SliceWriteGuard<'_> {
    fn drop(&mut self) {
        self.slice.writers.fetch_sub(1, Ordering::SeqCst);
    }
}
