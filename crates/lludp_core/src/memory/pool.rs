//! # Buffer Pool
//!
//! Fixed-size block pool for packet buffers that are frequently acquired and
//! released.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capacity of every pooled buffer: the hard UDP frame ceiling.
pub const BUFFER_SIZE: usize = 1500;

/// An MTU-sized byte buffer obtained from a [`BufferPool`].
///
/// The buffer tracks how many of its bytes are in use. It cannot grow past
/// [`BUFFER_SIZE`].
pub struct PacketBuffer {
    /// Backing storage.
    data: Box<[u8; BUFFER_SIZE]>,
    /// Number of bytes written.
    len: usize,
}

impl PacketBuffer {
    fn from_storage(data: Box<[u8; BUFFER_SIZE]>) -> Self {
        Self { data, len: 0 }
    }

    /// Returns the number of bytes written.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes have been written.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of bytes that can still be appended.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        BUFFER_SIZE - self.len
    }

    /// Returns the written bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Returns the written bytes mutably (for in-place flag patches).
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Resets the written length to zero.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends bytes.
    ///
    /// Returns false, leaving the buffer untouched, if they do not fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Appends a single byte. Returns false if the buffer is full.
    #[inline]
    pub fn push(&mut self, byte: u8) -> bool {
        self.extend_from_slice(&[byte])
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer").field("len", &self.len).finish()
    }
}

/// A bounded pool of packet buffers.
///
/// All buffers are allocated upfront. Acquiring from an empty pool returns
/// `None`; callers treat that as backpressure and retry later.
///
/// Buffers come back only through [`release`](Self::release). A
/// [`PacketBuffer`] that is dropped instead frees its storage and stays
/// counted in [`in_use`](Self::in_use).
///
/// # Thread Safety
///
/// The free list sits behind a `parking_lot::Mutex`, so one pool can be shared
/// by every circuit of a server through an `Arc`.
///
/// # Example
///
/// ```rust,ignore
/// let pool = BufferPool::new(4096);
///
/// // Acquire - O(1), no heap allocation
/// let Some(mut buffer) = pool.try_acquire() else {
///     return; // backpressure: keep the message queued
/// };
/// buffer.extend_from_slice(&encoded);
///
/// // Release - O(1), storage goes back on the free list
/// pool.release(buffer);
/// ```
pub struct BufferPool {
    /// Free list of idle buffers.
    free_list: Mutex<Vec<Box<[u8; BUFFER_SIZE]>>>,
    /// Buffers currently handed out.
    in_use: AtomicUsize,
    /// Total capacity.
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool holding `capacity` buffers, all pre-allocated.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than zero");

        let free_list = (0..capacity).map(|_| Box::new([0u8; BUFFER_SIZE])).collect();

        Self {
            free_list: Mutex::new(free_list),
            in_use: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Returns the total capacity.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffers currently handed out.
    #[inline]
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Returns the number of idle buffers.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Takes an empty buffer from the pool.
    ///
    /// Returns `None` if every buffer is in use.
    pub fn try_acquire(&self) -> Option<PacketBuffer> {
        let storage = self.free_list.lock().pop()?;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(PacketBuffer::from_storage(storage))
    }

    /// Returns a buffer to the pool.
    pub fn release(&self, buffer: PacketBuffer) {
        let mut free_list = self.free_list.lock();
        if free_list.len() < self.capacity {
            free_list.push(buffer.data);
        }
        drop(free_list);
        // Saturating: releasing a foreign buffer must not wrap the counter.
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}
