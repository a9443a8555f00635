//! # `LaminarDB` Slicing
//!
//! Time-sliced window state for `LaminarDB` aggregation and stream-join operators.
//!
//! This crate turns an unbounded, out-of-order, multi-source stream of record
//! buffers into time-bucketed operator state and decides when each bucket's
//! result becomes observable:
//!
//! - **Sequencing**: per-origin reassembly of out-of-order, chunked buffers
//! - **Watermarks**: one monotonic watermark per origin, combined into a global minimum
//! - **Slices**: the state of one `[start, end)` bucket, shared by all worker threads
//! - **Slice cache**: bounded FIFO/LRU/second-chance front cache over the slice store
//! - **Prediction**: Kalman / RLS / regression watermark estimates for pre-warming
//! - **Triggering**: exactly-once hand-off of closed slices to a probe
//!
//! ## Design Principles
//!
//! 1. **No store-wide lock on the write path** - slices carry their own synchronization
//! 2. **Monotonic time** - observed watermarks never move backwards
//! 3. **Fail fast on broken contracts** - ordering violations are errors, not warnings
//! 4. **State is per operator instance** - no process-wide registries
//!
//! ## Example
//!
//! ```rust
//! use laminar_slicing::buffer::{Record, RecordBuffer};
//! use laminar_slicing::config::WindowOperatorConfig;
//! use laminar_slicing::operator::{CollectingProbe, WindowOperator};
//! use laminar_slicing::sequence::SequenceData;
//! use laminar_slicing::OriginId;
//!
//! let config = WindowOperatorConfig::builder().tumbling(10).build()?;
//! let operator = WindowOperator::new(config, CollectingProbe::default());
//! operator.create_origin(OriginId(1));
//!
//! let buffer = RecordBuffer::new(OriginId(1), SequenceData::single(1), 12)
//!     .with_records(vec![Record::new(3, 7, 1), Record::new(8, 7, 2)]);
//! operator.process(0, &buffer)?;
//!
//! // The global watermark passed 10, so slice [0, 10) was emitted.
//! assert_eq!(operator.probe().emitted().len(), 1);
//! # Ok::<(), laminar_slicing::Error>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod config;
pub mod operator;
pub mod sequence;
pub mod slice;
pub mod time;

use std::fmt;

/// Logical time: event time or ingestion time, also used as watermark value.
pub type Timestamp = u64;

/// Identifies one logical data source feeding an operator.
///
/// Stable for the lifetime of a running query.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct OriginId(pub u64);

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin-{}", self.0)
    }
}

/// Result type for laminar-slicing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of every error surfaced by this crate.
///
/// The embedding engine uses the kind to decide between failing the query
/// and applying admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An upstream contract was broken (regressing watermark, early removal, ...).
    OrderingViolation,
    /// A bounded resource ran out; the caller may back off and retry.
    ResourceExhausted,
    /// The operator was configured with invalid parameters.
    Configuration,
    /// Migrated or checkpointed state could not be encoded or decoded.
    Serialization,
    /// The downstream probe rejected a slice.
    Probe,
    /// One or more failures occurred while terminating the operator.
    Termination,
}

/// Error types for laminar-slicing
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sequencing errors
    #[error("Sequence error: {0}")]
    Sequence(#[from] sequence::SequenceError),

    /// Watermark errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),

    /// Slice store errors
    #[error("Slice error: {0}")]
    Slice(#[from] slice::SliceError),

    /// Buffer provider errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] buffer::BufferError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),
}

impl Error {
    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sequence(e) => e.kind(),
            Self::Time(e) => e.kind(),
            Self::Slice(e) => e.kind(),
            Self::Buffer(e) => e.kind(),
            Self::Config(_) => ErrorKind::Configuration,
            Self::Operator(e) => e.kind(),
        }
    }

    /// Returns the `[start, end)` interval of the slice involved, when known.
    #[must_use]
    pub fn slice_interval(&self) -> Option<(Timestamp, Timestamp)> {
        match self {
            Self::Slice(e) => e.slice_interval(),
            Self::Operator(e) => e.slice_interval(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let err: Error = buffer::BufferError::Exhausted { capacity: 4 }.into();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err: Error = slice::SliceError::WritersInFlight {
            start: 0,
            end: 10,
            writers: 1,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::OrderingViolation);
        assert_eq!(err.slice_interval(), Some((0, 10)));

        let err: Error = config::ConfigError::invalid("window.size", "must be positive").into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.slice_interval(), None);
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(OriginId(7).to_string(), "origin-7");
    }
}
