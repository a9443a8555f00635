//! Watermark-driven slice triggering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::WindowMetaData;
use crate::slice::{Slice, SliceAssigner, SliceStore, TriggerAttempt};
use crate::time::Watermark;

/// Decides which slices a watermark advance closes.
///
/// Remembers the highest watermark it was given; a lower watermark passed
/// later is treated as the remembered one. Each slice is returned by exactly
/// one call, even when several threads advance the watermark concurrently.
#[derive(Debug)]
pub struct TriggerChecker {
    assigner: SliceAssigner,
    last_watermark: AtomicU64,
}

impl TriggerChecker {
    /// Creates a checker for slices cut by `assigner`.
    #[must_use]
    pub fn new(assigner: SliceAssigner) -> Self {
        Self {
            assigner,
            last_watermark: AtomicU64::new(0),
        }
    }

    /// Highest watermark seen so far.
    #[must_use]
    pub fn last_watermark(&self) -> Watermark {
        Watermark(self.last_watermark.load(Ordering::SeqCst))
    }

    /// Triggers every open slice of `store` ending at or before `watermark`.
    ///
    /// Returned slices are in `Triggering` state, ordered by ascending end,
    /// and owned by the caller, who must hand them to the probe. Slices with
    /// a writer in flight stay open and are retried on the next call.
    pub fn update_and_get_triggered_slices(
        &self,
        store: &SliceStore,
        watermark: Watermark,
    ) -> Vec<(Arc<Slice>, WindowMetaData)> {
        let previous = self.last_watermark.fetch_max(watermark.0, Ordering::SeqCst);
        let watermark = Watermark(previous.max(watermark.0));

        let mut triggered = Vec::new();
        for slice in store.closed_by(watermark) {
            match slice.try_trigger() {
                TriggerAttempt::Triggered => {
                    tracing::debug!(
                        slice_start = slice.start(),
                        slice_end = slice.end(),
                        %watermark,
                        "triggered slice"
                    );
                    let meta = self.metadata(&slice, watermark, false);
                    triggered.push((slice, meta));
                }
                TriggerAttempt::WritersInFlight => {
                    tracing::warn!(
                        slice_start = slice.start(),
                        slice_end = slice.end(),
                        %watermark,
                        "trigger deferred, writer in flight"
                    );
                }
                TriggerAttempt::AlreadyTriggered => {}
            }
        }
        triggered
    }

    /// Metadata for handing `slice` to the probe at `watermark`.
    #[must_use]
    pub fn metadata(&self, slice: &Slice, watermark: Watermark, forced: bool) -> WindowMetaData {
        WindowMetaData {
            slice_start: slice.start(),
            slice_end: slice.end(),
            watermark,
            windows: self.assigner.windows_containing(slice.start(), slice.end()),
            completed_window: self.assigner.window_ending_at(slice.end()),
            forced,
            empty: slice.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Record;
    use crate::config::{SliceKind, WindowSpec};
    use crate::slice::{SliceLifecycle, WindowId};

    fn setup(spec: WindowSpec) -> (SliceStore, TriggerChecker) {
        let assigner = SliceAssigner::new(spec);
        (
            SliceStore::new(assigner, SliceKind::Aggregation, 2),
            TriggerChecker::new(assigner),
        )
    }

    // ==================== Trigger Tests ====================

    #[test]
    fn test_triggers_in_end_order_once() {
        let (store, checker) = setup(WindowSpec::tumbling(10));
        for ts in [25, 5, 15] {
            store.get_or_create_slice(ts).unwrap();
        }

        let ends: Vec<_> = checker
            .update_and_get_triggered_slices(&store, Watermark::new(20))
            .iter()
            .map(|(s, _)| s.end())
            .collect();
        assert_eq!(ends, vec![10, 20]);

        // Same watermark again: nothing new.
        assert!(checker
            .update_and_get_triggered_slices(&store, Watermark::new(20))
            .is_empty());
        assert_eq!(
            store.get_slice(0).map(|s| s.lifecycle()),
            Some(SliceLifecycle::Triggering)
        );
    }

    #[test]
    fn test_lower_watermark_is_ignored() {
        let (store, checker) = setup(WindowSpec::tumbling(10));
        checker.update_and_get_triggered_slices(&store, Watermark::new(30));
        store.get_or_create_slice(15).unwrap();

        let triggered = checker.update_and_get_triggered_slices(&store, Watermark::new(5));
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].1.watermark, Watermark::new(30));
        assert_eq!(checker.last_watermark(), Watermark::new(30));
    }

    #[test]
    fn test_writer_in_flight_defers_trigger() {
        let (store, checker) = setup(WindowSpec::tumbling(10));
        let slice = store.get_or_create_slice(5).unwrap();
        let guard = slice.begin_write().unwrap();
        guard.aggregate(&Record::new(5, 1, 1)).unwrap();

        assert!(checker
            .update_and_get_triggered_slices(&store, Watermark::new(10))
            .is_empty());
        drop(guard);

        let triggered = checker.update_and_get_triggered_slices(&store, Watermark::new(10));
        assert_eq!(triggered.len(), 1);
        assert!(!triggered[0].1.empty);
    }

    #[test]
    fn test_sliding_metadata() {
        let (store, checker) = setup(WindowSpec::sliding(10, 4));
        store.get_or_create_slice(9).unwrap();
        store.get_or_create_slice(10).unwrap();

        let triggered = checker.update_and_get_triggered_slices(&store, Watermark::new(12));
        let metas: Vec<_> = triggered.iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(metas.len(), 2);

        assert_eq!(metas[0].slice_end, 10);
        assert_eq!(metas[0].completed_window, Some(WindowId::new(0, 10)));
        assert_eq!(metas[0].windows.len(), 3);
        assert!(metas[0].empty);

        assert_eq!(metas[1].slice_end, 12);
        assert_eq!(metas[1].completed_window, None);
        assert!(!metas[1].forced);
    }

    #[test]
    fn test_concurrent_checkers_trigger_each_slice_once() {
        let (store, checker) = setup(WindowSpec::tumbling(10));
        for ts in (0..1000).step_by(10) {
            store.get_or_create_slice(ts).unwrap();
        }
        let store = Arc::new(store);
        let checker = Arc::new(checker);

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let store = Arc::clone(&store);
                let checker = Arc::clone(&checker);
                std::thread::spawn(move || {
                    let mut count = 0;
                    for wm in (0..=1000).step_by(7) {
                        count += checker
                            .update_and_get_triggered_slices(&store, Watermark::new(wm + t))
                            .len();
                    }
                    count += checker
                        .update_and_get_triggered_slices(&store, Watermark::new(1000))
                        .len();
                    count
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}
