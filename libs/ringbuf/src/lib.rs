//! Fixed-capacity ring buffer for staging in-flight bytes.
//!
//! The buffer only ever exposes the largest *contiguous* writable or
//! readable span, so every transfer maps onto a single `read(2)` or
//! `write(2)` against a flat region. Filling or draining across the
//! physical end of the storage takes two calls.
//!
//! ```text
//!  wrapped = false              wrapped = true
//!  tail      head               head      tail
//!  v         v                  v         v
//!  +----------------------+     +----------------------+
//!  |  :::::::::           |     |::::      ::::::::::::|
//!  +----------------------+     +----------------------+
//!  free  = cap - head           free  = tail - head
//!  ready = head - tail          ready = cap - tail
//! ```

use std::collections::TryReserveError;

use thiserror::Error;

/// Ring buffer construction errors.
#[derive(Debug, Error)]
pub enum RingBufferError {
    /// A buffer must hold at least one byte.
    #[error("ring buffer capacity must be greater than zero")]
    ZeroCapacity,

    /// The backing storage could not be allocated.
    #[error("failed to allocate {capacity} bytes: {source}")]
    Allocation {
        capacity: usize,
        #[source]
        source: TryReserveError,
    },
}

/// Byte staging area with contiguous-span accounting.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    head: usize,
    tail: usize,
    /// Head has wrapped past the end and now sits behind tail.
    wrapped: bool,
}

impl RingBuffer {
    /// Allocate a buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 {
            return Err(RingBufferError::ZeroCapacity);
        }

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|source| RingBufferError::Allocation { capacity, source })?;
        storage.resize(capacity, 0);

        Ok(Self {
            storage: storage.into_boxed_slice(),
            head: 0,
            tail: 0,
            wrapped: false,
        })
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Length of the contiguous writable run starting at head.
    pub fn free(&self) -> usize {
        if self.wrapped {
            self.tail - self.head
        } else {
            self.capacity() - self.head
        }
    }

    /// Length of the contiguous readable run starting at tail.
    pub fn ready(&self) -> usize {
        if self.wrapped {
            self.capacity() - self.tail
        } else {
            self.head - self.tail
        }
    }

    /// True when no bytes are waiting to be consumed.
    pub fn is_empty(&self) -> bool {
        self.ready() == 0
    }

    /// The contiguous writable region, `free()` bytes long.
    pub fn free_span_mut(&mut self) -> &mut [u8] {
        let end = self.head + self.free();
        &mut self.storage[self.head..end]
    }

    /// The contiguous readable region, `ready()` bytes long.
    pub fn ready_span(&self) -> &[u8] {
        let end = self.tail + self.ready();
        &self.storage[self.tail..end]
    }

    /// Mark `n` freshly written bytes as ready.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.free()`. The buffer is left untouched.
    pub fn advance_head(&mut self, n: usize) {
        assert!(
            n <= self.free(),
            "advance_head({n}) exceeds contiguous free span of {} bytes",
            self.free()
        );

        self.head += n;
        if self.head == self.capacity() {
            self.head = 0;
            self.wrapped = true;
        }
    }

    /// Release `n` consumed bytes back to the free space.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.ready()`. The buffer is left untouched.
    pub fn advance_tail(&mut self, n: usize) {
        assert!(
            n <= self.ready(),
            "advance_tail({n}) exceeds contiguous ready span of {} bytes",
            self.ready()
        );

        self.tail += n;
        if self.tail == self.capacity() {
            self.tail = 0;
            self.wrapped = false;
        }
    }
}
