//! # Sequence Module
//!
//! Per-origin reassembly of out-of-order, chunked delivery.
//!
//! ## Concepts
//!
//! - **Sequence number**: position of a logical buffer in its origin's stream,
//!   starting at [`INITIAL_SEQUENCE_NUMBER`]
//! - **Chunk**: a logical buffer may be split into several chunks sharing one
//!   sequence number, numbered from [`INITIAL_CHUNK_NUMBER`]; the chunk with
//!   `last_chunk` set closes the sequence number
//! - **Release**: a sequence number is released once it is complete and every
//!   smaller sequence number has been released
//!
//! [`MonotonicSequence`] implements this for one origin and any value type;
//! [`Sequencer`] keeps one per origin for payloads, and the watermark processor
//! keeps one per origin for timestamps.
//!
//! ```rust
//! use laminar_slicing::sequence::{SequenceData, Sequencer};
//! use laminar_slicing::OriginId;
//!
//! let sequencer = Sequencer::new(1024);
//! let origin = OriginId(1);
//!
//! // Sequence 2 arrives first and is held back.
//! let released = sequencer.submit(origin, SequenceData::single(2), "b")?;
//! assert!(released.is_empty());
//!
//! // Sequence 1 releases both, in order.
//! let payloads: Vec<_> = sequencer
//!     .submit(origin, SequenceData::single(1), "a")?
//!     .map(|(_, payload)| payload)
//!     .collect();
//! assert_eq!(payloads, vec!["a", "b"]);
//! # Ok::<(), laminar_slicing::sequence::SequenceError>(())
//! ```

mod monotonic;
mod sequencer;

pub use monotonic::{MonotonicSequence, SequenceSnapshot};
pub use sequencer::{Released, Sequencer};

use crate::{ErrorKind, OriginId};

/// First sequence number of every origin.
pub const INITIAL_SEQUENCE_NUMBER: u64 = 1;

/// First chunk number of every sequence number.
pub const INITIAL_CHUNK_NUMBER: u64 = 0;

/// Position of one buffer (or chunk) in its origin's stream.
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
pub struct SequenceData {
    /// Sequence number.
    pub sequence_number: u64,
    /// Chunk number within the sequence number.
    pub chunk_number: u64,
    /// Whether this is the final chunk of the sequence number.
    pub last_chunk: bool,
}

impl SequenceData {
    /// Creates a sequence position.
    #[must_use]
    pub fn new(sequence_number: u64, chunk_number: u64, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// A sequence number delivered as a single chunk.
    #[must_use]
    pub fn single(sequence_number: u64) -> Self {
        Self::new(sequence_number, INITIAL_CHUNK_NUMBER, true)
    }
}

/// Sequencing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    /// Sequence numbers start at [`INITIAL_SEQUENCE_NUMBER`].
    #[error("{origin}: invalid sequence number {sequence}")]
    InvalidSequenceNumber {
        /// Origin.
        origin: OriginId,
        /// Offending sequence number.
        sequence: u64,
    },

    /// A chunk arrived beyond the chunk marked as last.
    #[error("{origin}: chunk {chunk} of sequence {sequence} is beyond last chunk {last}")]
    ChunkAfterLast {
        /// Origin.
        origin: OriginId,
        /// Sequence number.
        sequence: u64,
        /// Offending chunk.
        chunk: u64,
        /// Chunk previously marked as last.
        last: u64,
    },

    /// Two different chunks were marked as last.
    #[error("{origin}: sequence {sequence} closed by chunk {existing}, then again by chunk {new}")]
    ConflictingLastChunk {
        /// Origin.
        origin: OriginId,
        /// Sequence number.
        sequence: u64,
        /// First last chunk.
        existing: u64,
        /// Second last chunk.
        new: u64,
    },

    /// Too many sequence numbers are waiting for a gap to close.
    #[error("{origin}: {pending} sequence numbers pending, limit is {limit}")]
    BacklogExceeded {
        /// Origin.
        origin: OriginId,
        /// Pending sequence numbers.
        pending: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl SequenceError {
    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BacklogExceeded { .. } => ErrorKind::ResourceExhausted,
            Self::InvalidSequenceNumber { .. }
            | Self::ChunkAfterLast { .. }
            | Self::ConflictingLastChunk { .. } => ErrorKind::OrderingViolation,
        }
    }

    /// The origin the error belongs to.
    #[must_use]
    pub fn origin(&self) -> OriginId {
        match self {
            Self::InvalidSequenceNumber { origin, .. }
            | Self::ChunkAfterLast { origin, .. }
            | Self::ConflictingLastChunk { origin, .. }
            | Self::BacklogExceeded { origin, .. } => *origin,
        }
    }
}
