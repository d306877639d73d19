//! Fixed-capacity byte FIFO shared between one producer and one consumer.
//!
//! One slot is always left unused so that `head == tail` means empty and
//! `head + 1 == tail` (modulo `N`) means full. A buffer of `N` slots therefore
//! holds at most `N - 1` bytes.
//!
//! Every index has a single writer: the producer owns `head`, the consumer
//! owns `tail`. The opposite index is only loaded for a comparison, so the
//! indices are plain atomics with release stores and acquire loads and no
//! lock is taken. This is what lets an interrupt handler and the main loop
//! share a buffer.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_CELL: AtomicU8 = AtomicU8::new(0);

pub struct RingBuffer<const N: usize> {
    cells: [AtomicU8; N],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<const N: usize> RingBuffer<N> {
    const VALID: () = assert!(N >= 2, "ring buffer needs at least two slots");

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        Self {
            cells: [EMPTY_CELL; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    #[inline]
    const fn advance(idx: usize) -> usize {
        let next = idx + 1;
        if next == N {
            0
        } else {
            next
        }
    }

    /// Enqueue one byte. Returns `false` without touching the buffer when full.
    pub fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = Self::advance(head);
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        self.cells[head].store(byte, Ordering::Relaxed);
        self.head.store(next, Ordering::Release);
        true
    }

    /// Dequeue the oldest byte, `None` when empty.
    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let byte = self.cells[tail].load(Ordering::Relaxed);
        self.tail.store(Self::advance(tail), Ordering::Release);
        Some(byte)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        Self::advance(self.head.load(Ordering::Acquire)) == self.tail.load(Ordering::Acquire)
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + N - tail) % N
    }

    /// Usable capacity, one less than the slot count.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Drop everything, unread bytes included.
    ///
    /// Writes both indices, so the other side must not be running concurrently.
    pub fn reset(&self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
