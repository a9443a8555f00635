//! Multi-origin watermark processor.
//!
//! Each origin feeds `(sequence, timestamp)` pairs through its own
//! [`MonotonicSequence`]; the origin watermark is the timestamp of the
//! highest contiguous sequence prefix. The global watermark is the minimum
//! over all active origins, published through `fetch_max` so no reader ever
//! sees it decrease.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::RwLock;
use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{TimeError, Watermark};
use crate::sequence::{MonotonicSequence, SequenceData, SequenceSnapshot};
use crate::{OriginId, Timestamp};

#[derive(Debug)]
struct OriginWatermark {
    sequence: MonotonicSequence<Timestamp>,
    watermark: AtomicU64,
}

impl OriginWatermark {
    fn new(origin: OriginId, max_pending: usize) -> Self {
        Self {
            sequence: MonotonicSequence::new(origin, max_pending),
            watermark: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Default)]
struct OriginTable {
    active: FxHashMap<OriginId, Arc<OriginWatermark>>,
    removed: FxHashSet<OriginId>,
}

/// A buffered, not yet released watermark update.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct PendingWatermark {
    /// Sequence position of the update.
    pub sequence: SequenceData,
    /// Reported timestamp.
    pub timestamp: Timestamp,
}

/// Checkpointed state of one origin.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct OriginCheckpoint {
    /// Origin.
    pub origin: OriginId,
    /// Current origin watermark.
    pub watermark: Timestamp,
    /// Lowest sequence number not yet released.
    pub next_sequence: u64,
    /// Updates waiting for a gap to close.
    pub pending: Vec<PendingWatermark>,
}

/// Checkpoint of a [`MultiOriginWatermarkProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct WatermarkCheckpoint {
    /// Global watermark at checkpoint time.
    pub global: Timestamp,
    /// Active origins, ordered by id.
    pub origins: Vec<OriginCheckpoint>,
}

impl WatermarkCheckpoint {
    /// Encodes the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TimeError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| TimeError::Serialization(e.to_string()))
    }

    /// Decodes a checkpoint produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Serialization`] if the bytes are not a valid checkpoint.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TimeError> {
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, RkyvError>(&aligned)
            .map_err(|e| TimeError::Serialization(e.to_string()))
    }
}

/// Combines per-origin watermarks into one global watermark.
///
/// Updates for different origins only share a read lock on the origin table;
/// each origin sequences its own updates behind its own mutex.
///
/// # Example
///
/// ```rust
/// use laminar_slicing::sequence::SequenceData;
/// use laminar_slicing::time::{MultiOriginWatermarkProcessor, Watermark};
/// use laminar_slicing::OriginId;
///
/// let processor = MultiOriginWatermarkProcessor::new(64);
/// processor.create_origin(OriginId(1));
///
/// // Sequence 2 is held back until sequence 1 arrives.
/// processor.update_watermark(20, SequenceData::single(2), OriginId(1))?;
/// assert_eq!(processor.current_watermark(), Watermark::new(0));
///
/// processor.update_watermark(10, SequenceData::single(1), OriginId(1))?;
/// assert_eq!(processor.current_watermark(), Watermark::new(20));
/// # Ok::<(), laminar_slicing::time::TimeError>(())
/// ```
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    origins: RwLock<OriginTable>,
    global: AtomicU64,
    max_pending: usize,
}

impl MultiOriginWatermarkProcessor {
    /// Creates a processor without origins; `max_pending` bounds each origin's backlog.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            origins: RwLock::new(OriginTable::default()),
            global: AtomicU64::new(0),
            max_pending,
        }
    }

    /// Creates a processor for a fixed set of origins.
    #[must_use]
    pub fn with_origins(origins: impl IntoIterator<Item = OriginId>, max_pending: usize) -> Self {
        let processor = Self::new(max_pending);
        for origin in origins {
            processor.create_origin(origin);
        }
        processor
    }

    /// Registers an origin. Returns `false` if it already exists.
    ///
    /// A new origin starts at watermark 0 and holds the global watermark back
    /// until it catches up; the global watermark itself never decreases.
    pub fn create_origin(&self, origin: OriginId) -> bool {
        let mut table = self.origins.write();
        if table.active.contains_key(&origin) {
            return false;
        }
        table.removed.remove(&origin);
        table
            .active
            .insert(origin, Arc::new(OriginWatermark::new(origin, self.max_pending)));
        tracing::debug!(%origin, "created watermark origin");
        true
    }

    /// Applies one origin watermark update and returns the new global watermark.
    ///
    /// # Errors
    ///
    /// - [`TimeError::UnknownOrigin`] / [`TimeError::OriginRemoved`] for origins
    ///   that are not active
    /// - [`TimeError::Sequence`] if the sequence position is invalid or the
    ///   origin's backlog is full
    /// - [`TimeError::WatermarkRegression`] if a released timestamp is below the
    ///   origin's current watermark; the watermark is not lowered
    pub fn update_watermark(
        &self,
        timestamp: Timestamp,
        sequence: SequenceData,
        origin: OriginId,
    ) -> Result<Watermark, TimeError> {
        let table = self.origins.read();
        let entry = match table.active.get(&origin) {
            Some(entry) => Arc::clone(entry),
            None if table.removed.contains(&origin) => return Err(TimeError::OriginRemoved(origin)),
            None => return Err(TimeError::UnknownOrigin(origin)),
        };

        let released = entry.sequence.insert(sequence, timestamp)?;
        let mut regression = None;
        for (_, new) in released {
            let current = entry.watermark.fetch_max(new, Ordering::SeqCst);
            if new < current && regression.is_none() {
                regression = Some((current, new));
            }
        }

        let global = self.recompute(&table);
        drop(table);

        if let Some((current, new)) = regression {
            tracing::error!(%origin, current, new, "origin watermark regression");
            return Err(TimeError::WatermarkRegression {
                origin,
                current,
                new,
            });
        }
        Ok(global)
    }

    /// Returns the global watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        Watermark(self.global.load(Ordering::SeqCst))
    }

    /// Returns the watermark of one active origin.
    #[must_use]
    pub fn origin_watermark(&self, origin: OriginId) -> Option<Watermark> {
        self.origins
            .read()
            .active
            .get(&origin)
            .map(|o| Watermark(o.watermark.load(Ordering::SeqCst)))
    }

    /// Checks that `origin` accepts updates.
    ///
    /// # Errors
    ///
    /// [`TimeError::UnknownOrigin`] or [`TimeError::OriginRemoved`].
    pub fn check_origin(&self, origin: OriginId) -> Result<(), TimeError> {
        let table = self.origins.read();
        if table.active.contains_key(&origin) {
            Ok(())
        } else if table.removed.contains(&origin) {
            Err(TimeError::OriginRemoved(origin))
        } else {
            Err(TimeError::UnknownOrigin(origin))
        }
    }

    /// Active origins, ordered by id.
    #[must_use]
    pub fn origins(&self) -> Vec<OriginId> {
        let mut origins: Vec<_> = self.origins.read().active.keys().copied().collect();
        origins.sort_unstable();
        origins
    }

    /// Number of active origins.
    #[must_use]
    pub fn num_origins(&self) -> usize {
        self.origins.read().active.len()
    }

    /// Excludes a terminated origin from the minimum and returns the new global watermark.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownOrigin`] if the origin is not active.
    pub fn remove_origin(&self, origin: OriginId) -> Result<Watermark, TimeError> {
        let mut table = self.origins.write();
        let removed = table
            .active
            .remove(&origin)
            .ok_or(TimeError::UnknownOrigin(origin))?;
        table.removed.insert(origin);
        let discarded = removed.sequence.discard_pending();
        let global = self.recompute(&table);
        tracing::info!(%origin, discarded, %global, "removed watermark origin");
        Ok(global)
    }

    /// Captures every active origin and the global watermark.
    #[must_use]
    pub fn checkpoint(&self) -> WatermarkCheckpoint {
        let table = self.origins.read();
        let mut origins: Vec<OriginCheckpoint> = table
            .active
            .iter()
            .map(|(&origin, entry)| {
                let snapshot = entry.sequence.snapshot();
                OriginCheckpoint {
                    origin,
                    watermark: entry.watermark.load(Ordering::SeqCst),
                    next_sequence: snapshot.next_sequence,
                    pending: snapshot
                        .pending
                        .into_iter()
                        .map(|(sequence, timestamp)| PendingWatermark {
                            sequence,
                            timestamp,
                        })
                        .collect(),
                }
            })
            .collect();
        origins.sort_unstable_by_key(|o| o.origin);
        WatermarkCheckpoint {
            global: self.global.load(Ordering::SeqCst),
            origins,
        }
    }

    /// Replaces all origins with the checkpointed ones.
    ///
    /// The global watermark becomes the maximum of the current and the
    /// checkpointed value, so restoring never moves it backwards.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Sequence`] if a pending entry is inconsistent.
    pub fn restore(&self, checkpoint: WatermarkCheckpoint) -> Result<Watermark, TimeError> {
        let mut active = FxHashMap::default();
        for origin in checkpoint.origins {
            let snapshot = SequenceSnapshot {
                next_sequence: origin.next_sequence,
                pending: origin
                    .pending
                    .into_iter()
                    .map(|p| (p.sequence, p.timestamp))
                    .collect(),
            };
            let sequence =
                MonotonicSequence::from_snapshot(origin.origin, self.max_pending, snapshot)?;
            active.insert(
                origin.origin,
                Arc::new(OriginWatermark {
                    sequence,
                    watermark: AtomicU64::new(origin.watermark),
                }),
            );
        }

        let mut table = self.origins.write();
        table.active = active;
        table.removed.clear();
        self.global.fetch_max(checkpoint.global, Ordering::SeqCst);
        let global = self.recompute(&table);
        tracing::info!(origins = table.active.len(), %global, "restored watermark checkpoint");
        Ok(global)
    }

    fn recompute(&self, table: &OriginTable) -> Watermark {
        let min = table
            .active
            .values()
            .map(|o| o.watermark.load(Ordering::SeqCst))
            .min();
        match min {
            Some(min) => {
                let previous = self.global.fetch_max(min, Ordering::SeqCst);
                Watermark(previous.max(min))
            }
            None => self.current_watermark(),
        }
    }
}
