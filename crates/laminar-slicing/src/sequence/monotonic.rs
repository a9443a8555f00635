//! Gap-aware, monotonic sequence-to-value map for a single origin.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{SequenceData, SequenceError, INITIAL_CHUNK_NUMBER, INITIAL_SEQUENCE_NUMBER};
use crate::OriginId;

/// Chunks received so far for one sequence number.
#[derive(Debug)]
struct PendingSequence<T> {
    chunks: BTreeMap<u64, T>,
    last_chunk: Option<u64>,
}

impl<T> PendingSequence<T> {
    fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            last_chunk: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.last_chunk.is_some_and(|last| {
            self.chunks.len() as u64 == last - INITIAL_CHUNK_NUMBER + 1
        })
    }
}

#[derive(Debug)]
struct SequenceState<T> {
    /// Lowest sequence number not yet released.
    next: u64,
    pending: BTreeMap<u64, PendingSequence<T>>,
}

/// Point-in-time copy of a [`MonotonicSequence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSnapshot<T> {
    /// Lowest sequence number not yet released.
    pub next_sequence: u64,
    /// Buffered entries that were not yet released, in order.
    pub pending: Vec<(SequenceData, T)>,
}

/// Releases values of one origin in `(sequence, chunk)` order.
///
/// Values are buffered until their sequence number is complete (its last
/// chunk and every chunk before it arrived) and every smaller sequence
/// number has been released. Re-inserting a `(sequence, chunk)` pair that is
/// pending or already released is a no-op.
///
/// One mutex guards one origin, so origins never contend with each other.
/// The last released position is mirrored in an atomic for lock-free reads.
///
/// # Example
///
/// ```rust
/// use laminar_slicing::sequence::{MonotonicSequence, SequenceData};
/// use laminar_slicing::OriginId;
///
/// let seq = MonotonicSequence::new(OriginId(1), 16);
/// assert!(seq.insert(SequenceData::new(2, 0, true), 'b')?.is_empty());
///
/// let released = seq.insert(SequenceData::new(1, 0, true), 'a')?;
/// let values: Vec<char> = released.into_iter().map(|(_, v)| v).collect();
/// assert_eq!(values, vec!['a', 'b']);
/// assert_eq!(seq.next_expected(), 3);
/// # Ok::<(), laminar_slicing::sequence::SequenceError>(())
/// ```
#[derive(Debug)]
pub struct MonotonicSequence<T> {
    origin: OriginId,
    max_pending: usize,
    state: Mutex<SequenceState<T>>,
    next: AtomicU64,
}

impl<T> MonotonicSequence<T> {
    /// Creates an empty sequence that buffers at most `max_pending` sequence numbers.
    #[must_use]
    pub fn new(origin: OriginId, max_pending: usize) -> Self {
        Self::starting_at(origin, max_pending, INITIAL_SEQUENCE_NUMBER)
    }

    /// Creates an empty sequence whose next releasable sequence number is `next`.
    pub(crate) fn starting_at(origin: OriginId, max_pending: usize, next: u64) -> Self {
        Self {
            origin,
            max_pending,
            state: Mutex::new(SequenceState {
                next,
                pending: BTreeMap::new(),
            }),
            next: AtomicU64::new(next),
        }
    }

    /// The origin this sequence belongs to.
    #[must_use]
    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Lowest sequence number not yet released.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Number of sequence numbers waiting for release.
    #[must_use]
    pub fn pending_sequences(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Inserts a value and returns every value that became releasable, in order.
    ///
    /// # Errors
    ///
    /// - [`SequenceError::InvalidSequenceNumber`] for sequence numbers below the first one
    /// - [`SequenceError::ChunkAfterLast`] / [`SequenceError::ConflictingLastChunk`]
    ///   if the chunk contradicts the chunk already marked as last
    /// - [`SequenceError::BacklogExceeded`] if a new sequence number would exceed
    ///   the pending limit
    pub fn insert(
        &self,
        data: SequenceData,
        value: T,
    ) -> Result<Vec<(SequenceData, T)>, SequenceError> {
        let sequence = data.sequence_number;
        if sequence < INITIAL_SEQUENCE_NUMBER {
            return Err(SequenceError::InvalidSequenceNumber {
                origin: self.origin,
                sequence,
            });
        }

        let mut guard = self.state.lock();
        let SequenceState { next, pending } = &mut *guard;

        if sequence < *next {
            // Already released; at-least-once redelivery.
            return Ok(Vec::new());
        }

        let pending_count = pending.len();
        let entry = match pending.entry(sequence) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(v) => {
                // The head of the stream is always admitted so a full backlog can drain.
                if pending_count >= self.max_pending && sequence != *next {
                    return Err(SequenceError::BacklogExceeded {
                        origin: self.origin,
                        pending: pending_count,
                        limit: self.max_pending,
                    });
                }
                v.insert(PendingSequence::new())
            }
        };

        if let Some(last) = entry.last_chunk {
            if data.chunk_number > last {
                return Err(SequenceError::ChunkAfterLast {
                    origin: self.origin,
                    sequence,
                    chunk: data.chunk_number,
                    last,
                });
            }
            if data.last_chunk && data.chunk_number != last {
                return Err(SequenceError::ConflictingLastChunk {
                    origin: self.origin,
                    sequence,
                    existing: last,
                    new: data.chunk_number,
                });
            }
        } else if data.last_chunk {
            if let Some((&highest, _)) = entry.chunks.last_key_value() {
                if highest > data.chunk_number {
                    return Err(SequenceError::ChunkAfterLast {
                        origin: self.origin,
                        sequence,
                        chunk: highest,
                        last: data.chunk_number,
                    });
                }
            }
            entry.last_chunk = Some(data.chunk_number);
        }
        entry.chunks.entry(data.chunk_number).or_insert(value);

        let mut released = Vec::new();
        while let Some(first) = pending.first_entry() {
            if *first.key() != *next || !first.get().is_complete() {
                break;
            }
            let (sequence_number, complete) = first.remove_entry();
            let last = complete.last_chunk.unwrap_or(INITIAL_CHUNK_NUMBER);
            released.extend(complete.chunks.into_iter().map(|(chunk, value)| {
                (
                    SequenceData::new(sequence_number, chunk, chunk == last),
                    value,
                )
            }));
            *next += 1;
        }
        self.next.store(*next, Ordering::Release);

        Ok(released)
    }

    /// Drops everything still pending and returns how many chunks were discarded.
    pub fn discard_pending(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.pending.values().map(|p| p.chunks.len()).sum();
        state.pending.clear();
        discarded
    }
}

impl<T: Clone> MonotonicSequence<T> {
    /// Copies the release position and all pending entries.
    #[must_use]
    pub fn snapshot(&self) -> SequenceSnapshot<T> {
        let state = self.state.lock();
        let pending = state
            .pending
            .iter()
            .flat_map(|(&sequence, p)| {
                p.chunks.iter().map(move |(&chunk, value)| {
                    (
                        SequenceData::new(sequence, chunk, p.last_chunk == Some(chunk)),
                        value.clone(),
                    )
                })
            })
            .collect();
        SequenceSnapshot {
            next_sequence: state.next,
            pending,
        }
    }

    /// Rebuilds a sequence from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while re-inserting pending entries.
    pub fn from_snapshot(
        origin: OriginId,
        max_pending: usize,
        snapshot: SequenceSnapshot<T>,
    ) -> Result<Self, SequenceError> {
        let sequence = Self::starting_at(
            origin,
            max_pending,
            snapshot.next_sequence.max(INITIAL_SEQUENCE_NUMBER),
        );
        for (data, value) in snapshot.pending {
            // A consistent snapshot never holds a releasable entry.
            sequence.insert(data, value)?;
        }
        Ok(sequence)
    }
}
