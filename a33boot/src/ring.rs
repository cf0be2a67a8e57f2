//! Lock-free single-producer/single-consumer byte ring.
//!
//! On the target this ring sits between the UART receive interrupt
//! (producer) and the bootloader main loop (consumer): the producer
//! writes the slot and then the tail index, the consumer reads the slot
//! and then advances the head index, so neither side needs a lock.
//!
//! The transport has no backpressure, so a full ring would have to drop
//! or overwrite bytes and silently corrupt a frame. The ring therefore
//! refuses capacities that cannot hold at least one maximum-size frame;
//! with frame-per-reply flow at the protocol level that is enough to
//! make overflow unreachable.

#![allow(unsafe_code)]

use {
    crate::protocol::frame::MAX_FRAME_LEN,
    std::{
        cell::UnsafeCell,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    },
};

struct Inner<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Safety: every slot is written by exactly one side at a time. The
// producer only touches slots in tail..head-1 (its free region) before
// publishing them with a release store of tail; the consumer only reads
// slots head..tail after an acquire load of tail.
unsafe impl<const N: usize> Sync for Inner<N> {}

impl<const N: usize> Inner<N> {
    // One slot stays unused to distinguish full from empty, so the
    // usable capacity is N - 1 and must still exceed a whole frame.
    const CAPACITY_OK: () = assert!(N > MAX_FRAME_LEN + 1, "ring smaller than one frame");
}

/// Writing half of the ring. On the target this is owned by the UART
/// receive interrupt handler.
pub struct Producer<const N: usize> {
    inner: Arc<Inner<N>>,
}

/// Reading half of the ring, owned by the foreground loop.
pub struct Consumer<const N: usize> {
    inner: Arc<Inner<N>>,
}

// Safety: each half only mutates its own index; the shared buffer is
// coordinated through the head/tail protocol described on `Inner`.
unsafe impl<const N: usize> Send for Producer<N> {}
unsafe impl<const N: usize> Send for Consumer<N> {}

/// Create a ring of `N` slots and split it into its two halves.
#[allow(clippy::let_unit_value)] // forces the compile-time capacity check
pub fn channel<const N: usize>() -> (Producer<N>, Consumer<N>) {
    let () = Inner::<N>::CAPACITY_OK;

    let inner = Arc::new(Inner {
        buf: UnsafeCell::new([0u8; N]),
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer {
            inner: Arc::clone(&inner),
        },
        Consumer { inner },
    )
}

impl<const N: usize> Producer<N> {
    /// Append one byte. Returns `Err(byte)` when the ring is full; the
    /// byte is dropped rather than overwriting unread data.
    pub fn push(&mut self, byte: u8) -> Result<(), u8> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % N;
        if next == self.inner.head.load(Ordering::Acquire) {
            return Err(byte);
        }
        // Safety: `tail` is exclusively ours until the store below.
        unsafe {
            (*self.inner.buf.get())[tail] = byte;
        }
        self.inner.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Number of free slots.
    pub fn free(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        (N - 1) - (tail + N - head) % N
    }
}

impl<const N: usize> Consumer<N> {
    /// Remove and return the oldest byte, if any.
    pub fn pop(&mut self) -> Option<u8> {
        let head = self.inner.head.load(Ordering::Relaxed);
        if head == self.inner.tail.load(Ordering::Acquire) {
            return None;
        }
        // Safety: the producer published this slot before moving tail
        // past it and will not touch it again until head advances.
        let byte = unsafe { (*self.inner.buf.get())[head] };
        self.inner.head.store((head + 1) % N, Ordering::Release);
        Some(byte)
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        (tail + N - head) % N
    }

    /// Whether the ring holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 2048;

    #[test]
    fn test_fifo_order() {
        let (mut tx, mut rx) = channel::<N>();
        for byte in 0..=255u8 {
            tx.push(byte).unwrap();
        }
        for byte in 0..=255u8 {
            assert_eq!(rx.pop(), Some(byte));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_full_ring_rejects_without_overwrite() {
        let (mut tx, mut rx) = channel::<N>();
        for i in 0..N - 1 {
            tx.push(i as u8).unwrap();
        }
        assert_eq!(tx.free(), 0);
        assert_eq!(tx.push(0xAB), Err(0xAB));

        // The first byte must still be the first one written.
        assert_eq!(rx.pop(), Some(0));
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = channel::<N>();
        // Cycle several capacities worth of data through the ring.
        for round in 0..5 {
            for i in 0..N / 2 {
                tx.push((round + i) as u8).unwrap();
            }
            for i in 0..N / 2 {
                assert_eq!(rx.pop(), Some((round + i) as u8));
            }
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_capacity_holds_a_full_frame() {
        let (mut tx, rx) = channel::<{ MAX_FRAME_LEN + 2 }>();
        for _ in 0..MAX_FRAME_LEN {
            tx.push(0).unwrap();
        }
        assert_eq!(rx.len(), MAX_FRAME_LEN);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let (mut tx, mut rx) = channel::<N>();
        let total = 100_000usize;

        let producer = std::thread::spawn(move || {
            let mut sent = 0usize;
            while sent < total {
                if tx.push((sent % 251) as u8).is_ok() {
                    sent += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0usize;
        while received < total {
            match rx.pop() {
                Some(byte) => {
                    assert_eq!(byte, (received % 251) as u8);
                    received += 1;
                },
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
