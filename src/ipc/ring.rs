//! Ring Transport
//!
//! Lock-free single-producer/single-consumer queue of message
//! descriptors. An endpoint binds exactly two processes, so each
//! direction has one producer and one consumer and the ring needs no
//! general-purpose locking: a push is a single tail-side slot write plus
//! an atomic head advance, a pop the mirror image.
//!
//! One slot is kept empty to distinguish full from empty. `Release`
//! ordering on the index stores makes the slot write visible before the
//! index advance; `Acquire` loads pair with them on the other side.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, Result};
use crate::ipc::message::MessageDescriptor;

/// SPSC descriptor ring over a shared buffer.
pub struct RingTransport {
    slots: Box<[UnsafeCell<MessageDescriptor>]>,
    /// Producer index: next slot to write.
    head: AtomicUsize,
    /// Consumer index: next slot to read.
    tail: AtomicUsize,
}

// Safety: the endpoint binding discipline guarantees a single producer
// and a single consumer per ring; slot cells are only written by the
// producer before the head advance and only read by the consumer before
// the tail advance.
unsafe impl Send for RingTransport {}
unsafe impl Sync for RingTransport {}

impl RingTransport {
    /// Create a ring with `capacity` slots (power of two).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MessageDescriptor::default()))
            .collect();
        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Usable capacity (one slot stays empty).
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Producer side: wait-free enqueue.
    pub fn push(&self, desc: MessageDescriptor) -> Result<()> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if (head + 1) & self.mask() == tail & self.mask() {
            return Err(KernelError::EndpointFull);
        }
        // Safety: sole producer; this slot is not visible to the consumer
        // until the head store below.
        unsafe {
            *self.slots[head & self.mask()].get() = desc;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side: wait-free dequeue.
    pub fn pop(&self) -> Option<MessageDescriptor> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        // Safety: sole consumer; the producer released this slot with the
        // head store observed above.
        let desc = unsafe { *self.slots[tail & self.mask()].get() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(desc)
    }

    pub fn len(&self) -> usize {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::Payload;

    fn desc(seq: u64) -> MessageDescriptor {
        MessageDescriptor {
            seq,
            payload: Payload::inline(&seq.to_le_bytes()).unwrap(),
        }
    }

    #[test]
    fn fifo_order_and_capacity() {
        let ring = RingTransport::new(8);
        assert_eq!(ring.capacity(), 7);

        for seq in 0..7 {
            ring.push(desc(seq)).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.push(desc(7)), Err(KernelError::EndpointFull));

        for seq in 0..7 {
            assert_eq!(ring.pop().unwrap().seq, seq);
        }
        assert!(ring.pop().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around_many_times() {
        let ring = RingTransport::new(4);
        let mut next_out = 0;
        for seq in 0..100 {
            ring.push(desc(seq)).unwrap();
            if seq % 2 == 1 {
                assert_eq!(ring.pop().unwrap().seq, next_out);
                assert_eq!(ring.pop().unwrap().seq, next_out + 1);
                next_out += 2;
            }
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_producer_consumer() {
        use std::sync::Arc;

        let ring = Arc::new(RingTransport::new(16));
        let producer_ring = Arc::clone(&ring);
        const N: u64 = 10_000;

        let producer = std::thread::spawn(move || {
            let mut seq = 0;
            while seq < N {
                if producer_ring.push(desc(seq)).is_ok() {
                    seq += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < N {
            match ring.pop() {
                Some(d) => {
                    assert_eq!(d.seq, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
