//! Slice snapshots for state migration.
//!
//! Slice content is captured as plain [`SliceSnapshot`] values, encoded with
//! rkyv and written as one length-prefixed frame spread over as many
//! provider buffers as needed.
//!
//! Frame layout:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u64 (LE)  | rkyv(Vec<SliceSnapshot>)  |
//! +----------------+---------------------------+
//! ```

use bytes::Bytes;
use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::state::{JoinSide, JoinTuple, PartialAggregate, Slice, SliceState, SliceWriteGuard};
use super::SliceError;
use crate::buffer::{Buffer, BufferError, BufferProvider};
use crate::config::SliceKind;
use crate::Timestamp;

/// Size of the frame length header.
pub const FRAME_HEADER_LEN: usize = 8;

/// Partial aggregate of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct KeyedAggregate {
    /// Grouping key.
    pub key: u64,
    /// Aggregate.
    pub aggregate: PartialAggregate,
}

/// One join tuple.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct TupleSnapshot {
    /// Join key.
    pub key: u64,
    /// Record timestamp.
    pub timestamp: Timestamp,
    /// Tuple bytes.
    pub payload: Vec<u8>,
}

impl From<&JoinTuple> for TupleSnapshot {
    fn from(tuple: &JoinTuple) -> Self {
        Self {
            key: tuple.key,
            timestamp: tuple.timestamp,
            payload: tuple.payload.to_vec(),
        }
    }
}

impl From<&TupleSnapshot> for JoinTuple {
    fn from(tuple: &TupleSnapshot) -> Self {
        Self {
            key: tuple.key,
            timestamp: tuple.timestamp,
            payload: Bytes::copy_from_slice(&tuple.payload),
        }
    }
}

/// Captured slice content.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum SnapshotContent {
    /// Per-key aggregates, ordered by key.
    Aggregation(Vec<KeyedAggregate>),
    /// Tuples of both join sides.
    Join {
        /// Left-side tuples.
        left: Vec<TupleSnapshot>,
        /// Right-side tuples.
        right: Vec<TupleSnapshot>,
    },
}

impl SnapshotContent {
    /// Kind of slice this content belongs to.
    #[must_use]
    pub fn kind(&self) -> SliceKind {
        match self {
            Self::Aggregation(_) => SliceKind::Aggregation,
            Self::Join { .. } => SliceKind::Join,
        }
    }
}

/// Serializable copy of one slice.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct SliceSnapshot {
    /// Slice start.
    pub start: Timestamp,
    /// Slice end.
    pub end: Timestamp,
    /// Content.
    pub content: SnapshotContent,
}

impl Slice {
    /// Captures the slice content.
    #[must_use]
    pub fn snapshot(&self) -> SliceSnapshot {
        let content = match self.state() {
            SliceState::Aggregation(state) => SnapshotContent::Aggregation(
                state
                    .aggregates()
                    .into_iter()
                    .map(|(key, aggregate)| KeyedAggregate { key, aggregate })
                    .collect(),
            ),
            SliceState::Join(state) => SnapshotContent::Join {
                left: state.tuples(JoinSide::Left).iter().map(Into::into).collect(),
                right: state.tuples(JoinSide::Right).iter().map(Into::into).collect(),
            },
        };
        SliceSnapshot {
            start: self.start(),
            end: self.end(),
            content,
        }
    }

    /// Merges migrated content into this slice.
    ///
    /// # Errors
    ///
    /// - [`SliceError::Closed`] if the slice was already triggered
    /// - [`SliceError::KindMismatch`] if the snapshot holds the other kind of content
    pub fn restore(&self, snapshot: &SliceSnapshot) -> Result<(), SliceError> {
        self.begin_write()?.restore(snapshot)
    }

    fn merge_snapshot(&self, snapshot: &SliceSnapshot) -> Result<(), SliceError> {
        match (self.state(), &snapshot.content) {
            (SliceState::Aggregation(state), SnapshotContent::Aggregation(aggregates)) => {
                for entry in aggregates {
                    state.merge(entry.key, &entry.aggregate);
                }
            }
            (SliceState::Join(state), SnapshotContent::Join { left, right }) => {
                for tuple in left {
                    state.push(JoinSide::Left, tuple.into());
                }
                for tuple in right {
                    state.push(JoinSide::Right, tuple.into());
                }
            }
            _ => {
                return Err(SliceError::KindMismatch {
                    start: self.start(),
                    end: self.end(),
                    expected: self.kind(),
                })
            }
        }
        Ok(())
    }
}

impl SliceWriteGuard<'_> {
    /// Merges migrated content into the guarded slice.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::KindMismatch`] if the snapshot holds the other kind of content.
    pub fn restore(&self, snapshot: &SliceSnapshot) -> Result<(), SliceError> {
        self.slice().merge_snapshot(snapshot)
    }
}

/// Whether the slice `[start, end)` belongs to the migration range `[start_ts, stop_ts)`.
pub(crate) fn selected_for_migration(
    start: Timestamp,
    end: Timestamp,
    start_ts: Timestamp,
    stop_ts: Timestamp,
) -> bool {
    (start >= start_ts && start < stop_ts) || (end > start_ts && end < stop_ts)
}

/// Encodes snapshots with rkyv.
///
/// # Errors
///
/// Returns [`SliceError::Serialization`] if encoding fails.
#[allow(clippy::ptr_arg)]
pub fn encode_slices(snapshots: &Vec<SliceSnapshot>) -> Result<Vec<u8>, SliceError> {
    rkyv::to_bytes::<RkyvError>(snapshots)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| SliceError::Serialization(e.to_string()))
}

/// Decodes snapshots produced by [`encode_slices`].
///
/// # Errors
///
/// Returns [`SliceError::Serialization`] if the bytes are not a valid encoding.
pub fn decode_slices(bytes: &[u8]) -> Result<Vec<SliceSnapshot>, SliceError> {
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<Vec<SliceSnapshot>, RkyvError>(&aligned)
        .map_err(|e| SliceError::Serialization(e.to_string()))
}

/// Writes `payload` as one length-prefixed frame into buffers from `provider`.
///
/// On failure every buffer taken so far is released back to the provider.
///
/// # Errors
///
/// - [`BufferError::TooSmall`] if the provider's buffers cannot hold the header
/// - [`BufferError::Exhausted`] if the provider runs out of buffers
pub fn write_frame(
    provider: &dyn BufferProvider,
    payload: &[u8],
) -> Result<Vec<Buffer>, BufferError> {
    let size = provider.buffer_size();
    if size < FRAME_HEADER_LEN {
        return Err(BufferError::TooSmall {
            size,
            min: FRAME_HEADER_LEN,
        });
    }

    let header = (payload.len() as u64).to_le_bytes();
    let mut buffers: Vec<Buffer> = Vec::new();
    for part in [&header[..], payload] {
        let mut rest = part;
        while !rest.is_empty() {
            let full = buffers.last().map_or(true, |b| b.remaining() == 0);
            if full {
                match next_buffer(provider) {
                    Ok(buffer) => buffers.push(buffer),
                    Err(e) => {
                        for buffer in buffers {
                            provider.release(buffer);
                        }
                        return Err(e);
                    }
                }
            }
            if let Some(buffer) = buffers.last_mut() {
                let written = buffer.write(rest);
                rest = &rest[written..];
            }
        }
    }
    Ok(buffers)
}

fn next_buffer(provider: &dyn BufferProvider) -> Result<Buffer, BufferError> {
    let mut buffer = provider.get_buffer()?;
    buffer.clear();
    if buffer.remaining() == 0 {
        let size = buffer.capacity();
        provider.release(buffer);
        return Err(BufferError::TooSmall {
            size,
            min: FRAME_HEADER_LEN,
        });
    }
    Ok(buffer)
}

/// Reads back the payload of a frame written by [`write_frame`].
///
/// # Errors
///
/// Returns [`BufferError::Truncated`] if the buffers hold fewer bytes than
/// the header announces.
pub fn read_frame(buffers: &[Buffer]) -> Result<Vec<u8>, BufferError> {
    let mut bytes = Vec::with_capacity(buffers.iter().map(Buffer::len).sum());
    for buffer in buffers {
        bytes.extend_from_slice(buffer.as_slice());
    }
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(BufferError::Truncated {
            expected: FRAME_HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
    let len = usize::try_from(u64::from_le_bytes(header)).unwrap_or(usize::MAX);
    let body = &bytes[FRAME_HEADER_LEN..];
    if body.len() < len {
        return Err(BufferError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }
    Ok(body[..len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{FixedBufferPool, Record};
    use crate::slice::{SliceHandle, TriggerAttempt};

    fn slice(kind: SliceKind) -> Slice {
        Slice::new(
            10,
            20,
            SliceHandle {
                slot: 0,
                generation: 0,
            },
            kind,
            2,
        )
    }

    // ==================== Snapshot Tests ====================

    #[test]
    fn test_aggregation_snapshot_merges_into_existing() {
        let source = slice(SliceKind::Aggregation);
        {
            let w = source.begin_write().unwrap();
            w.aggregate(&Record::new(11, 1, 5)).unwrap();
            w.aggregate(&Record::new(12, 1, 7)).unwrap();
            w.aggregate(&Record::new(13, 2, -1)).unwrap();
        }
        let snapshot = source.snapshot();
        assert_eq!(snapshot.content.kind(), SliceKind::Aggregation);

        let target = slice(SliceKind::Aggregation);
        {
            let w = target.begin_write().unwrap();
            w.aggregate(&Record::new(15, 1, 100)).unwrap();
        }
        target.restore(&snapshot).unwrap();

        let state = target.aggregation().unwrap();
        let key1 = state.get(1).unwrap();
        assert_eq!(key1.count, 3);
        assert_eq!(key1.sum, 112);
        assert_eq!(key1.max, 100);
        assert_eq!(state.get(2).map(|a| a.min), Some(-1));
        assert_eq!(target.tuple_counts().left, 4);
        assert_eq!(target.in_flight_writers(), 0);
    }

    #[test]
    fn test_join_snapshot_keeps_payloads() {
        let source = slice(SliceKind::Join);
        {
            let w = source.begin_write().unwrap();
            w.append(JoinSide::Left, &Record::new(11, 3, 0).with_payload(&b"left"[..]))
                .unwrap();
            w.append(JoinSide::Right, &Record::new(12, 3, 0).with_payload(&b"right"[..]))
                .unwrap();
        }
        let target = slice(SliceKind::Join);
        target.restore(&source.snapshot()).unwrap();

        let join = target.join().unwrap();
        assert_eq!(join.tuple_count(JoinSide::Left), 1);
        assert_eq!(
            join.tuples(JoinSide::Right)[0].payload,
            Bytes::from_static(b"right")
        );
    }

    #[test]
    fn test_restore_rejects_other_kind() {
        let snapshot = slice(SliceKind::Join).snapshot();
        let target = slice(SliceKind::Aggregation);
        let err = target.restore(&snapshot).unwrap_err();
        assert!(matches!(
            err,
            SliceError::KindMismatch {
                expected: SliceKind::Aggregation,
                ..
            }
        ));
    }

    #[test]
    fn test_restore_into_sealed_slice_fails() {
        let snapshot = slice(SliceKind::Aggregation).snapshot();
        let target = slice(SliceKind::Aggregation);
        target.seal();
        assert_eq!(
            target.restore(&snapshot).unwrap_err(),
            SliceError::Closed { start: 10, end: 20 }
        );
    }

    #[test]
    fn test_held_guard_keeps_slice_open_for_restore() {
        let source = slice(SliceKind::Aggregation);
        source.begin_write().unwrap().aggregate(&Record::new(12, 3, 7)).unwrap();
        let snapshot = source.snapshot();

        let target = slice(SliceKind::Aggregation);
        let guard = target.begin_write().unwrap();
        assert_eq!(target.try_trigger(), TriggerAttempt::WritersInFlight);
        guard.restore(&snapshot).unwrap();
        drop(guard);
        assert_eq!(target.aggregation().unwrap().get(3).unwrap().sum, 7);
    }

    #[test]
    fn test_migration_range_selection() {
        // Starts inside the range.
        assert!(selected_for_migration(10, 20, 10, 30));
        // Ends inside the range.
        assert!(selected_for_migration(0, 15, 10, 30));
        // Ends exactly at the range start.
        assert!(!selected_for_migration(0, 10, 10, 30));
        // Starts at the range stop.
        assert!(!selected_for_migration(30, 40, 10, 30));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode_slices(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SliceError::Serialization(_)));
    }

    // ==================== Frame Tests ====================

    #[test]
    fn test_frame_spans_buffers() {
        let pool = FixedBufferPool::new(16, 8);
        let payload: Vec<u8> = (0..40).collect();

        let buffers = write_frame(&pool, &payload).unwrap();
        // 8 header bytes + 40 payload bytes over 16-byte buffers.
        assert_eq!(buffers.len(), 3);
        assert_eq!(pool.in_use(), 3);
        assert_eq!(read_frame(&buffers).unwrap(), payload);

        for buffer in buffers {
            pool.release(buffer);
        }
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_frame_exhaustion_releases_taken_buffers() {
        let pool = FixedBufferPool::new(16, 2);
        let err = write_frame(&pool, &[0u8; 64]).unwrap_err();
        assert_eq!(err, BufferError::Exhausted { capacity: 2 });
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_frame_buffer_too_small() {
        let pool = FixedBufferPool::new(4, 4);
        let err = write_frame(&pool, b"x").unwrap_err();
        assert_eq!(err, BufferError::TooSmall { size: 4, min: 8 });
    }

    #[test]
    fn test_truncated_frame() {
        let pool = FixedBufferPool::new(16, 4);
        let mut buffers = write_frame(&pool, &[7u8; 30]).unwrap();
        buffers.pop();
        let err = read_frame(&buffers).unwrap_err();
        assert!(matches!(err, BufferError::Truncated { expected: 30, .. }));
        assert!(read_frame(&[]).is_err());
    }

    #[test]
    fn test_snapshots_through_frames() {
        let source = slice(SliceKind::Aggregation);
        {
            let w = source.begin_write().unwrap();
            for key in 0..50 {
                w.aggregate(&Record::new(10 + key % 10, key, 1)).unwrap();
            }
        }
        let snapshots = vec![source.snapshot()];
        let pool = FixedBufferPool::new(64, 64);
        let buffers = write_frame(&pool, &encode_slices(&snapshots).unwrap()).unwrap();
        let decoded = decode_slices(&read_frame(&buffers).unwrap()).unwrap();
        assert_eq!(decoded, snapshots);
    }
}
