//! # Operator Module
//!
//! The window operator ties sequencing, watermarks and slices together and
//! hands closed slices to a downstream [`SliceProbe`].
//!
//! ## Flow
//!
//! ```text
//! RecordBuffer ──▶ Sequencer ──▶ SliceStore (via per-worker SliceCache)
//!                      │
//!                      └──▶ MultiOriginWatermarkProcessor ──▶ TriggerChecker ──▶ SliceProbe
//! ```
//!
//! Records are written before the buffer's watermark is applied, so a slice
//! is never triggered ahead of the records the same buffer carries for it.

mod trigger;
mod window;

pub use trigger::TriggerChecker;
pub use window::{LateDataMetrics, WindowOperator};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::slice::{Slice, SliceSnapshot, TupleCounts, WindowId, WindowIdVec};
use crate::time::Watermark;
use crate::{ErrorKind, Timestamp};

/// Describes why and when a slice is handed to the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMetaData {
    /// Slice start (inclusive).
    pub slice_start: Timestamp,
    /// Slice end (exclusive).
    pub slice_end: Timestamp,
    /// Global watermark at trigger time.
    pub watermark: Watermark,
    /// Every window the slice contributes to.
    pub windows: WindowIdVec,
    /// The window that ends with this slice, if any. All of its slices have
    /// now been emitted.
    pub completed_window: Option<WindowId>,
    /// `true` when emitted by termination rather than by the watermark.
    pub forced: bool,
    /// `true` if the slice holds no records (for example a pre-warmed slice).
    pub empty: bool,
}

/// Error reported by a probe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProbeError {
    message: String,
}

impl ProbeError {
    /// Creates a probe error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Downstream consumer of triggered slices: aggregation finalization or join probe.
///
/// Called from whichever thread advanced the watermark. Returning `Ok` is the
/// acknowledgment that lets the operator mark the slice flushed.
pub trait SliceProbe: Send + Sync {
    /// Consumes one triggered slice.
    ///
    /// # Errors
    ///
    /// Any [`ProbeError`] is surfaced to the caller of the operator method
    /// that triggered the slice.
    fn emit(&self, slice: &Arc<Slice>, meta: &WindowMetaData) -> Result<(), ProbeError>;
}

impl<P: SliceProbe + ?Sized> SliceProbe for Arc<P> {
    fn emit(&self, slice: &Arc<Slice>, meta: &WindowMetaData) -> Result<(), ProbeError> {
        (**self).emit(slice, meta)
    }
}

/// One slice as seen by [`CollectingProbe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedSlice {
    /// Trigger metadata.
    pub meta: WindowMetaData,
    /// Record or tuple counts at emission.
    pub counts: TupleCounts,
    /// Content at emission.
    pub snapshot: SliceSnapshot,
}

/// A probe that records every emitted slice. Useful for tests and tooling.
#[derive(Debug, Default)]
pub struct CollectingProbe {
    emitted: Mutex<Vec<EmittedSlice>>,
}

impl CollectingProbe {
    /// Every slice emitted so far, in emission order.
    #[must_use]
    pub fn emitted(&self) -> Vec<EmittedSlice> {
        self.emitted.lock().clone()
    }

    /// Takes the emitted slices, leaving the probe empty.
    pub fn drain(&self) -> Vec<EmittedSlice> {
        std::mem::take(&mut *self.emitted.lock())
    }
}

impl SliceProbe for CollectingProbe {
    fn emit(&self, slice: &Arc<Slice>, meta: &WindowMetaData) -> Result<(), ProbeError> {
        self.emitted.lock().push(EmittedSlice {
            meta: meta.clone(),
            counts: slice.tuple_counts(),
            snapshot: slice.snapshot(),
        });
        Ok(())
    }
}

/// How the operator is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// Emit every remaining slice; a writer still in flight is an error.
    Graceful,
    /// Emit what can be emitted and report every failure.
    Failure,
    /// Drop all state without emitting.
    HardStop,
}

/// Window operator errors.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// The probe rejected a slice.
    #[error("probe failed for slice [{start}, {end}): {source}")]
    Probe {
        /// Slice start.
        start: Timestamp,
        /// Slice end.
        end: Timestamp,
        /// Probe error.
        #[source]
        source: ProbeError,
    },

    /// Termination completed, but not cleanly.
    #[error("termination finished with {} failure(s)", failures.len())]
    Termination {
        /// Every failure observed while flushing.
        failures: Vec<crate::Error>,
    },

    /// The operator was already terminated.
    #[error("operator is terminated")]
    Terminated,
}

impl OperatorError {
    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Probe { .. } => ErrorKind::Probe,
            Self::Termination { .. } => ErrorKind::Termination,
            Self::Terminated => ErrorKind::OrderingViolation,
        }
    }

    /// The `[start, end)` interval involved, when known.
    #[must_use]
    pub fn slice_interval(&self) -> Option<(Timestamp, Timestamp)> {
        match self {
            Self::Probe { start, end, .. } => Some((*start, *end)),
            Self::Termination { .. } | Self::Terminated => None,
        }
    }
}
