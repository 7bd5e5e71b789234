//! Bounded MPMC ring absorbing cross-thread frees.
//!
//! Each page carries one of these. Remote threads push freed user pointers;
//! the owning thread drains them while it already holds the page's stripe
//! lock, turning a contended cross-thread free into a cheap batched local
//! one. Slots carry a sequence counter so producers and consumers
//! coordinate without a lock: a push succeeds when the slot's sequence
//! equals the producer position, a pop when it equals the consumer position
//! plus one. Producers never block — a full ring reports failure and the
//! caller falls back to the locked free path.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot {
    sequence: AtomicUsize,
    value: UnsafeCell<usize>,
}

pub struct DeferredRing {
    buffer: Box<[Slot]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

// SAFETY: slot values are only read by the consumer that won the slot's
// sequence CAS handshake, after an Acquire load that pairs with the
// producer's Release store of the advanced sequence.
unsafe impl Send for DeferredRing {}
unsafe impl Sync for DeferredRing {}

impl DeferredRing {
    /// Create a ring with `capacity` slots. Capacity must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(0),
            })
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    /// Push a value. Returns false when the ring is full; the producer does
    /// not wait.
    pub fn push(&self, value: usize) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            if seq == pos {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS grants exclusive write
                        // access to this slot until the sequence advances.
                        unsafe { *slot.value.get() = value };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if (seq as isize).wrapping_sub(pos as isize) < 0 {
                // Slot still holds an unconsumed value from a lap ago.
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop the oldest value, or None when the ring is empty.
    pub fn pop(&self) -> Option<usize> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let expected = pos.wrapping_add(1);
            if seq == expected {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS grants exclusive read
                        // access; the Acquire load above saw the producer's
                        // Release, so the value write is visible.
                        let value = unsafe { *slot.value.get() };
                        slot.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if (seq as isize).wrapping_sub(expected as isize) < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate occupancy. Only a hint: producers and consumers race
    /// with this read.
    pub fn len(&self) -> usize {
        let enq = self.enqueue_pos.load(Ordering::Relaxed);
        let deq = self.dequeue_pos.load(Ordering::Relaxed);
        enq.wrapping_sub(deq)
    }
}
