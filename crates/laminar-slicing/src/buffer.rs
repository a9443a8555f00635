//! Buffers: the input record buffers and the fixed-size memory provider.
//!
//! Operators never allocate raw memory for migrated state themselves; they
//! request fixed-size [`Buffer`]s from a [`BufferProvider`] and hand them back
//! with [`BufferProvider::release`]. [`FixedBufferPool`] is the bounded,
//! thread-safe provider used by default and in tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::sequence::SequenceData;
use crate::{ErrorKind, OriginId, Timestamp};

/// A fixed-capacity byte buffer handed out by a [`BufferProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: BytesMut,
    capacity: usize,
}

impl Buffer {
    /// Creates an empty buffer that accepts at most `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of bytes this buffer holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes still free.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Appends as much of `bytes` as fits and returns how many bytes were written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// The written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Discards the content, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Source of fixed-size buffers, supplied by the embedding engine.
pub trait BufferProvider: Send + Sync {
    /// Hands out an empty buffer of [`buffer_size`](Self::buffer_size) bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Exhausted`] when no buffer is available.
    fn get_buffer(&self) -> Result<Buffer, BufferError>;

    /// Returns a buffer to the provider.
    fn release(&self, buffer: Buffer);

    /// Size of every buffer handed out.
    fn buffer_size(&self) -> usize;
}

/// A bounded pool of equally sized buffers.
///
/// All buffers are allocated up front; [`get_buffer`](BufferProvider::get_buffer)
/// and [`release`](BufferProvider::release) only move them between the free
/// list and the caller.
///
/// # Example
///
/// ```rust
/// use laminar_slicing::buffer::{BufferProvider, FixedBufferPool};
///
/// let pool = FixedBufferPool::new(64, 2);
/// let mut buf = pool.get_buffer()?;
/// assert_eq!(buf.write(b"hello"), 5);
/// assert_eq!(pool.available(), 1);
///
/// pool.release(buf);
/// assert_eq!(pool.available(), 2);
/// # Ok::<(), laminar_slicing::buffer::BufferError>(())
/// ```
#[derive(Debug)]
pub struct FixedBufferPool {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Buffer>>,
    in_use: AtomicUsize,
}

impl FixedBufferPool {
    /// Creates a pool of `count` buffers of `buffer_size` bytes each.
    #[must_use]
    pub fn new(buffer_size: usize, count: usize) -> Self {
        let free = (0..count).map(|_| Buffer::with_capacity(buffer_size)).collect();
        Self {
            buffer_size,
            capacity: count,
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Number of buffers ready to be handed out.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of buffers currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Total number of buffers owned by the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl BufferProvider for FixedBufferPool {
    fn get_buffer(&self) -> Result<Buffer, BufferError> {
        let buffer = self.free.lock().pop().ok_or(BufferError::Exhausted {
            capacity: self.capacity,
        })?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    fn release(&self, mut buffer: Buffer) {
        if buffer.capacity() != self.buffer_size {
            tracing::warn!(
                expected = self.buffer_size,
                actual = buffer.capacity(),
                "dropping foreign buffer released to pool"
            );
            return;
        }
        buffer.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buffer);
            self.in_use.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// One input record.
///
/// Aggregation operators use `key` and `value`; join operators carry the
/// tuple bytes in `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Event or ingestion time.
    pub timestamp: Timestamp,
    /// Grouping or join key.
    pub key: u64,
    /// Value folded into partial aggregates.
    pub value: i64,
    /// Opaque tuple bytes.
    pub payload: Bytes,
}

impl Record {
    /// Creates a record without payload.
    #[must_use]
    pub fn new(timestamp: Timestamp, key: u64, value: i64) -> Self {
        Self {
            timestamp,
            key,
            value,
            payload: Bytes::new(),
        }
    }

    /// Attaches tuple bytes.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// A buffer of records as delivered by the network or source layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBuffer {
    /// Producing origin.
    pub origin: OriginId,
    /// Position in the origin's stream.
    pub sequence: SequenceData,
    /// Origin watermark after this buffer.
    pub watermark: Timestamp,
    /// Wall-clock time the buffer was created at the source.
    pub ingestion_time: u64,
    /// Records.
    pub records: Vec<Record>,
}

impl RecordBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(origin: OriginId, sequence: SequenceData, watermark: Timestamp) -> Self {
        Self {
            origin,
            sequence,
            watermark,
            ingestion_time: 0,
            records: Vec::new(),
        }
    }

    /// Sets the records.
    #[must_use]
    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.records = records;
        self
    }

    /// Sets the ingestion time.
    #[must_use]
    pub fn with_ingestion_time(mut self, ingestion_time: u64) -> Self {
        self.ingestion_time = ingestion_time;
        self
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if the buffer carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Buffer provider errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Every buffer is in use.
    #[error("buffer provider exhausted ({capacity} buffers in use)")]
    Exhausted {
        /// Pool capacity.
        capacity: usize,
    },

    /// The provider's buffers are too small to hold a frame header.
    #[error("buffer size {size} is below the minimum of {min} bytes")]
    TooSmall {
        /// Provider buffer size.
        size: usize,
        /// Minimum required.
        min: usize,
    },

    /// Fewer bytes were found than the frame header announced.
    #[error("truncated buffer chain: expected {expected} bytes, found {actual}")]
    Truncated {
        /// Announced length.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
}

impl BufferError {
    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Exhausted { .. } => ErrorKind::ResourceExhausted,
            Self::TooSmall { .. } => ErrorKind::Configuration,
            Self::Truncated { .. } => ErrorKind::Serialization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Buffer Tests ====================

    #[test]
    fn test_buffer_write_respects_capacity() {
        let mut buf = Buffer::with_capacity(4);
        assert!(buf.is_empty());
        assert_eq!(buf.write(b"abcdef"), 4);
        assert_eq!(buf.as_slice(), b"abcd");
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.write(b"x"), 0);

        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 4);
    }

    // ==================== Pool Tests ====================

    #[test]
    fn test_pool_exhaustion() {
        let pool = FixedBufferPool::new(16, 2);
        let a = pool.get_buffer().unwrap();
        let b = pool.get_buffer().unwrap();
        assert_eq!(pool.in_use(), 2);

        let err = pool.get_buffer().unwrap_err();
        assert_eq!(err, BufferError::Exhausted { capacity: 2 });
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pool_clears_released_buffers() {
        let pool = FixedBufferPool::new(8, 1);
        let mut buf = pool.get_buffer().unwrap();
        buf.write(b"data");
        pool.release(buf);

        let buf = pool.get_buffer().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pool_rejects_foreign_buffer() {
        let pool = FixedBufferPool::new(8, 1);
        pool.release(Buffer::with_capacity(32));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.capacity(), 1);
    }

    // ==================== Record Tests ====================

    #[test]
    fn test_record_buffer_builders() {
        let buffer = RecordBuffer::new(OriginId(3), SequenceData::single(1), 50)
            .with_ingestion_time(1_000)
            .with_records(vec![
                Record::new(10, 1, 5),
                Record::new(20, 2, 6).with_payload(&b"tuple"[..]),
            ]);

        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.ingestion_time, 1_000);
        assert_eq!(buffer.records[1].payload, Bytes::from_static(b"tuple"));
    }
}
