//! # Time Module
//!
//! Watermarks and watermark prediction.
//!
//! ## Concepts
//!
//! - **Origin watermark**: no future record from the origin carries a smaller
//!   timestamp; advances only through the origin's in-order sequence prefix
//! - **Global watermark**: minimum over all active origins; never observed to
//!   move backwards
//! - **Prediction**: a statistical estimate of a future watermark, used only to
//!   schedule speculative work
//!
//! ## Multi-Origin Watermark Tracking
//!
//! ```rust
//! use laminar_slicing::sequence::SequenceData;
//! use laminar_slicing::time::{MultiOriginWatermarkProcessor, Watermark};
//! use laminar_slicing::OriginId;
//!
//! let processor = MultiOriginWatermarkProcessor::new(1024);
//! processor.create_origin(OriginId(1));
//! processor.create_origin(OriginId(2));
//!
//! processor.update_watermark(50, SequenceData::single(1), OriginId(1))?;
//! let global = processor.update_watermark(30, SequenceData::single(1), OriginId(2))?;
//! assert_eq!(global, Watermark::new(30));
//! # Ok::<(), laminar_slicing::time::TimeError>(())
//! ```

mod predictor;
mod watermark;

pub use predictor::{
    build_predictor, min_estimated_watermark, KalmanPredictor, RegressionPredictor,
    RlsPredictor, SharedPredictor, WatermarkPredictor, WatermarkSample,
};
pub use watermark::{
    MultiOriginWatermarkProcessor, OriginCheckpoint, PendingWatermark, WatermarkCheckpoint,
};

use std::fmt;

use crate::sequence::SequenceError;
use crate::{ErrorKind, OriginId, Timestamp};

/// A watermark indicating event time progress.
///
/// Records with a timestamp strictly below the watermark are late.
///
/// # Example
///
/// ```rust
/// use laminar_slicing::time::Watermark;
///
/// let watermark = Watermark::new(1000);
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark(pub Timestamp);

impl Watermark {
    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    /// Checks if a record is late relative to this watermark.
    #[inline]
    #[must_use]
    pub fn is_late(&self, timestamp: Timestamp) -> bool {
        timestamp < self.0
    }

    /// Returns `true` if a slice ending at `slice_end` is closed by this watermark.
    #[inline]
    #[must_use]
    pub fn closes(&self, slice_end: Timestamp) -> bool {
        slice_end <= self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wm({})", self.0)
    }
}

/// Time-related errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    /// Watermark regression (going backwards)
    #[error("Watermark regression on {origin}: current={current}, new={new}")]
    WatermarkRegression {
        /// Origin reporting the regression.
        origin: OriginId,
        /// Current watermark value
        current: Timestamp,
        /// Attempted new watermark value
        new: Timestamp,
    },

    /// The origin was never created.
    #[error("Unknown origin: {0}")]
    UnknownOrigin(OriginId),

    /// The origin was removed and accepts no further updates.
    #[error("Origin removed: {0}")]
    OriginRemoved(OriginId),

    /// Sequencing of the update failed.
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    /// A checkpoint could not be encoded or decoded.
    #[error("Checkpoint serialization failed: {0}")]
    Serialization(String),
}

impl TimeError {
    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WatermarkRegression { .. } | Self::UnknownOrigin(_) | Self::OriginRemoved(_) => {
                ErrorKind::OrderingViolation
            }
            Self::Sequence(e) => e.kind(),
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }
}
