//! Multi-origin payload sequencer.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use super::{MonotonicSequence, SequenceData, SequenceError};
use crate::OriginId;

/// Payloads released by one [`Sequencer::submit`] call, in sequence order.
///
/// Finite and single-pass; dropping it discards nothing from the sequencer,
/// the payloads are already handed over.
#[derive(Debug)]
pub struct Released<T> {
    inner: std::vec::IntoIter<(SequenceData, T)>,
}

impl<T> Released<T> {
    fn new(entries: Vec<(SequenceData, T)>) -> Self {
        Self {
            inner: entries.into_iter(),
        }
    }

    /// Returns `true` if nothing (more) is released.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl<T> Iterator for Released<T> {
    type Item = (SequenceData, T);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> ExactSizeIterator for Released<T> {}

/// Restores per-origin total order over out-of-order, chunked submissions.
///
/// Origins are registered on first use. Each origin owns its own
/// [`MonotonicSequence`], so a gap on one origin never stalls another. The
/// origin table itself is only write-locked when an origin is added or removed.
#[derive(Debug)]
pub struct Sequencer<T> {
    origins: RwLock<FxHashMap<OriginId, Arc<MonotonicSequence<T>>>>,
    max_pending: usize,
}

impl<T> Sequencer<T> {
    /// Creates a sequencer allowing `max_pending` buffered sequence numbers per origin.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            origins: RwLock::new(FxHashMap::default()),
            max_pending,
        }
    }

    /// Submits one payload and returns every payload of `origin` that became releasable.
    ///
    /// # Errors
    ///
    /// Propagates [`SequenceError`] from the origin's sequence; nothing is
    /// buffered when an error is returned.
    pub fn submit(
        &self,
        origin: OriginId,
        data: SequenceData,
        payload: T,
    ) -> Result<Released<T>, SequenceError> {
        let sequence = self.sequence(origin);
        let released = sequence.insert(data, payload)?;
        if released.is_empty() {
            tracing::trace!(%origin, sequence = data.sequence_number, "buffered out-of-order submission");
        }
        Ok(Released::new(released))
    }

    /// Lowest sequence number not yet released for `origin`.
    #[must_use]
    pub fn next_expected(&self, origin: OriginId) -> Option<u64> {
        self.origins.read().get(&origin).map(|s| s.next_expected())
    }

    /// Number of sequence numbers of `origin` waiting for a gap to close.
    #[must_use]
    pub fn pending(&self, origin: OriginId) -> usize {
        self.origins
            .read()
            .get(&origin)
            .map_or(0, |s| s.pending_sequences())
    }

    /// Known origins, in no particular order.
    #[must_use]
    pub fn origins(&self) -> Vec<OriginId> {
        self.origins.read().keys().copied().collect()
    }

    /// Forgets a terminated origin and returns how many buffered chunks were dropped.
    pub fn remove_origin(&self, origin: OriginId) -> usize {
        let removed = self.origins.write().remove(&origin);
        let discarded = removed.map_or(0, |s| s.discard_pending());
        if discarded > 0 {
            tracing::warn!(%origin, discarded, "removed origin with buffered chunks");
        }
        discarded
    }

    /// Restarts `origin` at `next_sequence`, as after restoring a checkpoint,
    /// and returns how many buffered chunks were dropped.
    pub fn reset_origin(&self, origin: OriginId, next_sequence: u64) -> usize {
        let fresh = Arc::new(MonotonicSequence::starting_at(
            origin,
            self.max_pending,
            next_sequence,
        ));
        let previous = self.origins.write().insert(origin, fresh);
        let discarded = previous.map_or(0, |s| s.discard_pending());
        tracing::debug!(%origin, next_sequence, discarded, "reset origin sequence");
        discarded
    }

    fn sequence(&self, origin: OriginId) -> Arc<MonotonicSequence<T>> {
        if let Some(sequence) = self.origins.read().get(&origin) {
            return Arc::clone(sequence);
        }
        let mut origins = self.origins.write();
        Arc::clone(
            origins
                .entry(origin)
                .or_insert_with(|| Arc::new(MonotonicSequence::new(origin, self.max_pending))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_all(
        sequencer: &Sequencer<&'static str>,
        origin: OriginId,
        data: SequenceData,
        payload: &'static str,
    ) -> Vec<&'static str> {
        sequencer
            .submit(origin, data, payload)
            .unwrap()
            .map(|(_, p)| p)
            .collect()
    }

    #[test]
    fn test_chunked_sequence_waits_for_predecessor() {
        let sequencer = Sequencer::new(16);
        let o1 = OriginId(1);
        for seq in 1..=3 {
            assert_eq!(submit_all(&sequencer, o1, SequenceData::single(seq), "early").len(), 1);
        }

        assert!(submit_all(&sequencer, o1, SequenceData::new(5, 0, false), "5/0").is_empty());
        assert!(submit_all(&sequencer, o1, SequenceData::new(5, 1, true), "5/1").is_empty());
        let released = submit_all(&sequencer, o1, SequenceData::new(4, 0, true), "4/0");
        assert_eq!(released, vec!["4/0", "5/0", "5/1"]);
        assert_eq!(sequencer.next_expected(o1), Some(6));
    }

    #[test]
    fn test_origins_are_independent() {
        let sequencer = Sequencer::new(16);
        let (o1, o2) = (OriginId(1), OriginId(2));

        assert!(submit_all(&sequencer, o1, SequenceData::single(2), "o1-2").is_empty());
        assert_eq!(submit_all(&sequencer, o2, SequenceData::single(1), "o2-1"), vec!["o2-1"]);
        assert_eq!(sequencer.pending(o1), 1);
        assert_eq!(sequencer.pending(o2), 0);

        let mut origins = sequencer.origins();
        origins.sort();
        assert_eq!(origins, vec![o1, o2]);
    }

    #[test]
    fn test_released_is_exact_size() {
        let sequencer = Sequencer::new(16);
        let o = OriginId(1);
        sequencer.submit(o, SequenceData::single(2), 2).unwrap();
        sequencer.submit(o, SequenceData::single(3), 3).unwrap();
        let released = sequencer.submit(o, SequenceData::single(1), 1).unwrap();
        assert_eq!(released.len(), 3);
        assert!(!released.is_empty());
    }

    #[test]
    fn test_remove_origin_discards_pending() {
        let sequencer = Sequencer::new(16);
        let o = OriginId(1);
        sequencer.submit(o, SequenceData::single(3), ()).unwrap();
        sequencer.submit(o, SequenceData::single(4), ()).unwrap();

        assert_eq!(sequencer.remove_origin(o), 2);
        assert_eq!(sequencer.next_expected(o), None);
        assert_eq!(sequencer.remove_origin(o), 0);
    }

    #[test]
    fn test_reset_origin_moves_release_position() {
        let sequencer = Sequencer::new(16);
        let o = OriginId(1);
        sequencer.submit(o, SequenceData::single(2), "stale").unwrap();

        assert_eq!(sequencer.reset_origin(o, 5), 1);
        assert_eq!(sequencer.next_expected(o), Some(5));
        assert!(submit_all(&sequencer, o, SequenceData::single(4), "old").is_empty());
        assert_eq!(submit_all(&sequencer, o, SequenceData::single(5), "e"), vec!["e"]);

        // Unknown origins start at the given position too.
        sequencer.reset_origin(OriginId(2), 3);
        assert_eq!(sequencer.next_expected(OriginId(2)), Some(3));
    }

    #[test]
    fn test_error_leaves_state_untouched() {
        let sequencer = Sequencer::new(1);
        let o = OriginId(1);
        sequencer.submit(o, SequenceData::single(5), ()).unwrap();
        let err = sequencer.submit(o, SequenceData::single(6), ()).unwrap_err();
        assert!(matches!(err, SequenceError::BacklogExceeded { .. }));
        assert_eq!(sequencer.pending(o), 1);
    }
}
