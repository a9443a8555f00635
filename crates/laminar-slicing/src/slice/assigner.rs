//! Deterministic slice boundaries.
//!
//! Time is cut at every multiple of `slide` and at every window end
//! `k * slide + size`. Each resulting slice lies inside every window that
//! overlaps it, so a window's result is the combination of the slices between
//! its start and end. For tumbling windows (`size == slide`) a slice is a window.

use smallvec::SmallVec;

use crate::config::WindowSpec;
use crate::Timestamp;

/// Identifies a window by its `[start, end)` bounds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct WindowId {
    /// Window start (inclusive).
    pub start: Timestamp,
    /// Window end (exclusive).
    pub end: Timestamp,
}

impl WindowId {
    /// Creates a window id.
    #[must_use]
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }
}

/// Windows overlapping one slice; at most `size / slide` rounded up.
pub type WindowIdVec = SmallVec<[WindowId; 4]>;

/// Maps timestamps to slice bounds for one window specification.
///
/// # Example
///
/// ```rust
/// use laminar_slicing::config::WindowSpec;
/// use laminar_slicing::slice::SliceAssigner;
///
/// // Windows of 10, every 4: [0,10) [4,14) [8,18) ...
/// let assigner = SliceAssigner::new(WindowSpec::sliding(10, 4));
/// assert_eq!(assigner.slice_bounds(9), (8, 10));
/// assert_eq!(assigner.slice_bounds(11), (10, 12));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size: u64,
    slide: u64,
}

impl SliceAssigner {
    /// Creates an assigner. `spec` must be valid (positive size and slide).
    #[must_use]
    pub fn new(spec: WindowSpec) -> Self {
        Self {
            size: spec.size.max(1),
            slide: spec.slide.max(1),
        }
    }

    /// Window size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Window slide.
    #[must_use]
    pub fn slide(&self) -> u64 {
        self.slide
    }

    /// Start of the slice containing `ts`.
    #[must_use]
    pub fn slice_start(&self, ts: Timestamp) -> Timestamp {
        let previous_slide = ts - ts % self.slide;
        let previous_window_end = if ts < self.size {
            previous_slide
        } else {
            ts - (ts - self.size) % self.slide
        };
        previous_slide.max(previous_window_end)
    }

    /// End of the slice containing `ts`.
    #[must_use]
    pub fn slice_end(&self, ts: Timestamp) -> Timestamp {
        let next_slide = (ts - ts % self.slide).saturating_add(self.slide);
        let next_window_end = if ts < self.size {
            self.size
        } else {
            (ts - (ts - self.size) % self.slide).saturating_add(self.slide)
        };
        next_slide.min(next_window_end)
    }

    /// `[start, end)` of the slice containing `ts`.
    #[must_use]
    pub fn slice_bounds(&self, ts: Timestamp) -> (Timestamp, Timestamp) {
        (self.slice_start(ts), self.slice_end(ts))
    }

    /// Every window that contains the slice `[start, end)`, ordered by start.
    #[must_use]
    pub fn windows_containing(&self, start: Timestamp, end: Timestamp) -> WindowIdVec {
        let first = if end > self.size {
            (end - self.size).div_ceil(self.slide) * self.slide
        } else {
            0
        };
        let last = start - start % self.slide;
        let mut windows = WindowIdVec::new();
        let mut window_start = first;
        while window_start <= last {
            windows.push(WindowId::new(
                window_start,
                window_start.saturating_add(self.size),
            ));
            window_start += self.slide;
        }
        windows
    }

    /// The window completed by a slice ending at `end`, if `end` is a window end.
    #[must_use]
    pub fn window_ending_at(&self, end: Timestamp) -> Option<WindowId> {
        (end >= self.size && (end - self.size) % self.slide == 0)
            .then(|| WindowId::new(end - self.size, end))
    }

    /// End of the last window containing the slice starting at `start`.
    ///
    /// Once the watermark passes this point no window needs the slice anymore.
    #[must_use]
    pub fn retention_end(&self, start: Timestamp) -> Timestamp {
        (start - start % self.slide).saturating_add(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Tumbling Tests ====================

    #[test]
    fn test_tumbling_slices_are_windows() {
        let assigner = SliceAssigner::new(WindowSpec::tumbling(10));
        assert_eq!(assigner.slice_bounds(0), (0, 10));
        assert_eq!(assigner.slice_bounds(9), (0, 10));
        assert_eq!(assigner.slice_bounds(10), (10, 20));
        assert_eq!(assigner.slice_bounds(1234), (1230, 1240));

        assert_eq!(assigner.window_ending_at(20), Some(WindowId::new(10, 20)));
        assert_eq!(assigner.windows_containing(10, 20).as_slice(), &[WindowId::new(10, 20)]);
        assert_eq!(assigner.retention_end(10), 20);
    }

    // ==================== Sliding Tests ====================

    #[test]
    fn test_sliding_slice_boundaries() {
        let assigner = SliceAssigner::new(WindowSpec::sliding(10, 4));
        let expected = [
            (0, (0, 4)),
            (3, (0, 4)),
            (4, (4, 8)),
            (8, (8, 10)),
            (9, (8, 10)),
            (10, (10, 12)),
            (11, (10, 12)),
            (12, (12, 14)),
            (13, (12, 14)),
            (14, (14, 16)),
            (16, (16, 18)),
            (18, (18, 20)),
            (20, (20, 22)),
        ];
        for (ts, bounds) in expected {
            assert_eq!(assigner.slice_bounds(ts), bounds, "ts={ts}");
        }
    }

    #[test]
    fn test_slices_partition_time() {
        let assigner = SliceAssigner::new(WindowSpec::sliding(30, 7));
        let mut ts = 0;
        while ts < 500 {
            let (start, end) = assigner.slice_bounds(ts);
            assert_eq!(start, ts, "slices must be contiguous");
            assert!(end > start);
            for t in start..end {
                assert_eq!(assigner.slice_bounds(t), (start, end));
            }
            ts = end;
        }
    }

    #[test]
    fn test_windows_containing_slice() {
        let assigner = SliceAssigner::new(WindowSpec::sliding(10, 4));
        // [8,10) is covered by [0,10), [4,14) and [8,18).
        assert_eq!(
            assigner.windows_containing(8, 10).as_slice(),
            &[
                WindowId::new(0, 10),
                WindowId::new(4, 14),
                WindowId::new(8, 18),
            ]
        );
        // [10,12) is no longer part of [0,10).
        assert_eq!(
            assigner.windows_containing(10, 12).as_slice(),
            &[WindowId::new(4, 14), WindowId::new(8, 18)]
        );
    }

    #[test]
    fn test_window_ending_at() {
        let assigner = SliceAssigner::new(WindowSpec::sliding(10, 4));
        assert_eq!(assigner.window_ending_at(4), None);
        assert_eq!(assigner.window_ending_at(10), Some(WindowId::new(0, 10)));
        assert_eq!(assigner.window_ending_at(12), None);
        assert_eq!(assigner.window_ending_at(14), Some(WindowId::new(4, 14)));
    }

    #[test]
    fn test_retention_covers_every_containing_window() {
        let assigner = SliceAssigner::new(WindowSpec::sliding(10, 4));
        for ts in 0..100 {
            let (start, end) = assigner.slice_bounds(ts);
            let last = assigner.windows_containing(start, end).last().copied();
            assert_eq!(last.map(|w| w.end), Some(assigner.retention_end(start)));
        }
    }
}
