//! Clock-domain-crossing queue.
//!
//! A single-producer single-consumer ring buffer whose read and write
//! positions are published gray-coded, the same way a dual-clock FIFO
//! passes its pointers through synchronizers. Each side keeps its own
//! position as a plain binary counter and only ever observes the other
//! side's published pointer.
//!
//! ```text
//!   producer domain                         consumer domain
//!  ┌──────────────┐   slots[pos & mask]   ┌──────────────┐
//!  │ write (bin)  │ ───────────────────▶  │ read (bin)   │
//!  │              │                       │              │
//!  │ write_gray ──┼──── Release/Acquire ─▶│ cached write │
//!  │ cached read ◀┼──── Acquire/Release ──┼── read_gray  │
//!  └──────────────┘                       └──────────────┘
//! ```
//!
//! The producer fills a slot and then publishes its pointer with a
//! `Release` store; the consumer samples that pointer with `Acquire`
//! before touching the slot, so a word is never observed half-written.
//! A stale sample only makes the queue look fuller (producer side) or
//! emptier (consumer side) than it is.
//!
//! Full and empty are distinguished by the counter difference:
//! `write - read == depth` is full, `write == read` is empty.

pub mod width;

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Reference queue depth.
pub const DEFAULT_DEPTH: usize = 512;

/// Queue construction error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CdcError {
    #[error("Queue depth {0} is not a power of two >= 2")]
    InvalidDepth(usize),
}

/// Binary to gray code.
#[inline]
pub fn to_gray(n: usize) -> usize {
    n ^ (n >> 1)
}

/// Gray code to binary.
#[inline]
pub fn from_gray(g: usize) -> usize {
    let mut n = g;
    let mut shift = 1;
    while shift < usize::BITS {
        n ^= n >> shift;
        shift <<= 1;
    }
    n
}

struct Shared<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    write_gray: AtomicUsize,
    read_gray: AtomicUsize,
}

// SAFETY: a slot is written only by the producer while it is outside the
// published [read, write) window, and read only by the consumer while it is
// inside. The Release/Acquire pointer handoff orders those accesses.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn observe_write(&self) -> usize {
        from_gray(self.write_gray.load(Ordering::Acquire))
    }

    fn observe_read(&self) -> usize {
        from_gray(self.read_gray.load(Ordering::Acquire))
    }
}

/// Constructor for a queue pair.
pub struct CdcQueue;

impl CdcQueue {
    /// Create a queue of the reference depth.
    pub fn new<T: Copy + Send>() -> (CdcProducer<T>, CdcConsumer<T>) {
        Self::build(DEFAULT_DEPTH)
    }

    /// Create a queue of `depth` entries.
    pub fn with_depth<T: Copy + Send>(
        depth: usize,
    ) -> Result<(CdcProducer<T>, CdcConsumer<T>), CdcError> {
        if depth < 2 || !depth.is_power_of_two() {
            return Err(CdcError::InvalidDepth(depth));
        }
        Ok(Self::build(depth))
    }

    fn build<T: Copy + Send>(depth: usize) -> (CdcProducer<T>, CdcConsumer<T>) {
        let slots = (0..depth)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let shared = Arc::new(Shared {
            slots,
            mask: depth - 1,
            write_gray: AtomicUsize::new(0),
            read_gray: AtomicUsize::new(0),
        });

        let producer = CdcProducer {
            shared: Arc::clone(&shared),
            write: 0,
            cached_read: 0,
        };
        let consumer = CdcConsumer {
            shared,
            read: 0,
            cached_write: 0,
        };
        (producer, consumer)
    }
}

/// Write side of a CDC queue.
pub struct CdcProducer<T> {
    shared: Arc<Shared<T>>,
    write: usize,
    cached_read: usize,
}

impl<T: Copy> CdcProducer<T> {
    /// Enqueue a word. Returns it back if the queue is full.
    pub fn enqueue(&mut self, value: T) -> Result<(), T> {
        if self.write.wrapping_sub(self.cached_read) >= self.capacity() {
            self.cached_read = self.shared.observe_read();
            if self.write.wrapping_sub(self.cached_read) >= self.capacity() {
                return Err(value);
            }
        }

        let slot = &self.shared.slots[self.write & self.shared.mask];
        // SAFETY: the slot is outside the consumer's visible window until
        // the pointer below is published.
        unsafe {
            (*slot.get()).write(value);
        }
        self.write = self.write.wrapping_add(1);
        self.shared.write_gray.store(to_gray(self.write), Ordering::Release);
        Ok(())
    }

    /// Whether an enqueue would currently fail.
    pub fn is_full(&self) -> bool {
        self.write.wrapping_sub(self.shared.observe_read()) >= self.capacity()
    }

    /// Number of entries as seen from the write side.
    pub fn len(&self) -> usize {
        self.write.wrapping_sub(self.shared.observe_read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }
}

/// Read side of a CDC queue.
pub struct CdcConsumer<T> {
    shared: Arc<Shared<T>>,
    read: usize,
    cached_write: usize,
}

impl<T: Copy> CdcConsumer<T> {
    fn available(&mut self) -> bool {
        if self.read == self.cached_write {
            self.cached_write = self.shared.observe_write();
        }
        self.read != self.cached_write
    }

    /// Look at the head entry without removing it.
    pub fn peek(&mut self) -> Option<T> {
        if !self.available() {
            return None;
        }
        let slot = &self.shared.slots[self.read & self.shared.mask];
        // SAFETY: the slot is inside the published window, so the producer
        // initialised it and will not touch it until `read` moves past it.
        Some(unsafe { (*slot.get()).assume_init() })
    }

    /// Remove and return the head entry.
    pub fn dequeue(&mut self) -> Option<T> {
        let value = self.peek()?;
        self.read = self.read.wrapping_add(1);
        self.shared.read_gray.store(to_gray(self.read), Ordering::Release);
        Some(value)
    }

    /// Discard every entry currently visible. Returns the number dropped.
    pub fn drain(&mut self) -> usize {
        self.cached_write = self.shared.observe_write();
        let dropped = self.cached_write.wrapping_sub(self.read);
        self.read = self.cached_write;
        self.shared.read_gray.store(to_gray(self.read), Ordering::Release);
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.shared.observe_write()
    }

    /// Number of entries as seen from the read side.
    pub fn len(&self) -> usize {
        self.shared.observe_write().wrapping_sub(self.read)
    }

    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }
}

impl<T> fmt::Debug for CdcProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdcProducer")
            .field("depth", &(self.shared.mask + 1))
            .field("write", &self.write)
            .finish()
    }
}

impl<T> fmt::Debug for CdcConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdcConsumer")
            .field("depth", &(self.shared.mask + 1))
            .field("read", &self.read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_gray_code_single_bit_steps() {
        for n in 0..1024usize {
            let diff = to_gray(n) ^ to_gray(n + 1);
            assert_eq!(diff.count_ones(), 1, "step {}", n);
            assert_eq!(from_gray(to_gray(n)), n);
        }
        assert_eq!(from_gray(to_gray(usize::MAX)), usize::MAX);
    }

    #[test]
    fn test_invalid_depth() {
        assert_eq!(
            CdcQueue::with_depth::<u32>(0).unwrap_err(),
            CdcError::InvalidDepth(0)
        );
        assert!(CdcQueue::with_depth::<u32>(1).is_err());
        assert!(CdcQueue::with_depth::<u32>(12).is_err());
        assert!(CdcQueue::with_depth::<u32>(2).is_ok());
    }

    #[test]
    fn test_default_depth() {
        let (tx, rx) = CdcQueue::new::<u32>();
        assert_eq!(tx.capacity(), 512);
        assert_eq!(rx.capacity(), 512);
    }

    #[test]
    fn test_full_and_empty() {
        let (mut tx, mut rx) = CdcQueue::with_depth::<u32>(4).unwrap();
        assert!(rx.is_empty());
        assert_eq!(rx.dequeue(), None);

        for i in 0..4 {
            assert_eq!(tx.enqueue(i), Ok(()));
        }
        assert!(tx.is_full());
        assert_eq!(tx.enqueue(99), Err(99));

        assert_eq!(rx.dequeue(), Some(0));
        assert!(!tx.is_full());
        assert_eq!(tx.enqueue(4), Ok(()));

        let drained: Vec<u32> = std::iter::from_fn(|| rx.dequeue()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut tx, mut rx) = CdcQueue::with_depth::<u32>(2).unwrap();
        tx.enqueue(7).unwrap();
        assert_eq!(rx.peek(), Some(7));
        assert_eq!(rx.peek(), Some(7));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.dequeue(), Some(7));
        assert_eq!(rx.peek(), None);
    }

    #[test]
    fn test_drain_discards_everything() {
        let (mut tx, mut rx) = CdcQueue::with_depth::<u32>(8).unwrap();
        for i in 0..5 {
            tx.enqueue(i).unwrap();
        }
        assert_eq!(rx.drain(), 5);
        assert!(rx.is_empty());
        assert!(tx.is_empty());

        tx.enqueue(42).unwrap();
        assert_eq!(rx.dequeue(), Some(42));
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut tx, mut rx) = CdcQueue::with_depth::<u32>(4).unwrap();
        let mut expected = 0;
        for i in 0..100 {
            tx.enqueue(i).unwrap();
            if i % 3 == 2 {
                while let Some(v) = rx.dequeue() {
                    assert_eq!(v, expected);
                    expected += 1;
                }
            }
        }
        while let Some(v) = rx.dequeue() {
            assert_eq!(v, expected);
            expected += 1;
        }
        assert_eq!(expected, 100);
    }

    #[test]
    fn test_cross_thread_fifo_order() {
        const COUNT: u64 = 200_000;
        let (mut tx, mut rx) = CdcQueue::with_depth::<(u64, u64)>(16).unwrap();

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                // Both halves must always arrive together
                let mut word = (i, !i);
                loop {
                    match tx.enqueue(word) {
                        Ok(()) => break,
                        Err(back) => {
                            word = back;
                            thread::yield_now();
                        }
                    }
                }
            }
        });

        let mut next = 0;
        while next < COUNT {
            match rx.dequeue() {
                Some((lo, hi)) => {
                    assert_eq!(lo, next);
                    assert_eq!(hi, !next);
                    next += 1;
                }
                None => thread::yield_now(),
            }
        }

        producer.join().unwrap();
        assert!(rx.is_empty());
    }
}
