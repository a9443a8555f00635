//! # Slice Module
//!
//! Time-bucketed operator state.
//!
//! A slice holds the build-side state of one `[start, end)` interval: record
//! counts and partial aggregates for aggregation operators, or hash-partitioned
//! per-side tuples for stream joins. Every worker thread that sees a record in
//! the interval writes to the same slice.
//!
//! ## Components
//!
//! - [`SliceAssigner`]: maps a timestamp to its deterministic slice bounds
//! - [`SliceStore`]: owns every live slice; concurrency-safe get-or-create
//! - [`SliceCache`]: bounded per-worker front cache of [`SliceRef`]s
//! - [`SliceSnapshot`]: serializable slice content used by state migration
//!
//! ## Lifecycle
//!
//! ```text
//! Open ──(watermark passes end, no writer in flight)──▶ Triggering ──(probe ack)──▶ Flushed
//!   │                                                                                  │
//!   └──────────────── removed by the store once no window needs it ◀───────────────────┘
//! ```

mod assigner;
mod cache;
mod migration;
mod state;
mod store;

pub use assigner::{SliceAssigner, WindowId, WindowIdVec};
pub use cache::{CacheMetrics, SliceCache, SliceRef};
pub use migration::{
    decode_slices, encode_slices, read_frame, write_frame, KeyedAggregate, SliceSnapshot,
    SnapshotContent, TupleSnapshot, FRAME_HEADER_LEN,
};
pub use state::{
    AggregationState, JoinSide, JoinState, JoinTuple, PartialAggregate, Slice, SliceHandle,
    SliceLifecycle, SliceState, SliceWriteGuard, TriggerAttempt, TupleCounts,
};
pub use store::SliceStore;

pub(crate) use migration::selected_for_migration;

use crate::config::SliceKind;
use crate::{ErrorKind, Timestamp};

/// Slice store and slice content errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SliceError {
    /// A slice cannot be removed or flushed while a writer holds it.
    #[error("slice [{start}, {end}) has {writers} writer(s) in flight")]
    WritersInFlight {
        /// Slice start.
        start: Timestamp,
        /// Slice end.
        end: Timestamp,
        /// Writers observed.
        writers: usize,
    },

    /// No live slice starts at the given timestamp.
    #[error("no slice starts at {start}")]
    NotFound {
        /// Requested start.
        start: Timestamp,
    },

    /// The slice was already triggered and accepts no more writes.
    #[error("slice [{start}, {end}) is closed")]
    Closed {
        /// Slice start.
        start: Timestamp,
        /// Slice end.
        end: Timestamp,
    },

    /// The store was closed by termination.
    #[error("slice store is closed")]
    StoreClosed,

    /// A write or restore does not match the slice's content kind.
    #[error("slice [{start}, {end}) is not a {expected:?} slice")]
    KindMismatch {
        /// Slice start.
        start: Timestamp,
        /// Slice end.
        end: Timestamp,
        /// Kind the operation needs.
        expected: SliceKind,
    },

    /// Restored bounds do not fall on this operator's slice grid.
    #[error("[{start}, {end}) is not a slice; expected [{expected_start}, {expected_end})")]
    BoundsMismatch {
        /// Given start.
        start: Timestamp,
        /// Given end.
        end: Timestamp,
        /// Start computed by the assigner.
        expected_start: Timestamp,
        /// End computed by the assigner.
        expected_end: Timestamp,
    },

    /// Slice snapshots could not be encoded or decoded.
    #[error("slice serialization failed: {0}")]
    Serialization(String),
}

impl SliceError {
    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WritersInFlight { .. }
            | Self::NotFound { .. }
            | Self::Closed { .. }
            | Self::StoreClosed => ErrorKind::OrderingViolation,
            Self::KindMismatch { .. } | Self::BoundsMismatch { .. } => ErrorKind::Configuration,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// The `[start, end)` interval involved, when known.
    #[must_use]
    pub fn slice_interval(&self) -> Option<(Timestamp, Timestamp)> {
        match *self {
            Self::WritersInFlight { start, end, .. }
            | Self::Closed { start, end }
            | Self::KindMismatch { start, end, .. }
            | Self::BoundsMismatch { start, end, .. } => Some((start, end)),
            Self::NotFound { .. } | Self::StoreClosed | Self::Serialization(_) => None,
        }
    }
}
