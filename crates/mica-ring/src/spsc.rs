//! Single-producer single-consumer ring buffer.
//!
//! FastForward-style: each slot carries its own occupancy flag, so the
//! producer and consumer never touch each other's index. The producer
//! publishes a slot with a release store, the consumer observes it with an
//! acquire load and hands the slot back the same way.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::CachePadded;

struct Slot<T> {
    full: AtomicBool,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded SPSC FIFO. `put` must only be called from one thread at a
/// time, and `get` from one thread at a time; the two sides may be
/// different threads.
pub struct SpscRing<T> {
    // Producer-owned cursor.
    tail: CachePadded<AtomicUsize>,
    // Consumer-owned cursor.
    head: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Create a ring with the given capacity, which must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| Slot {
                full: AtomicBool::new(false),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            tail: CachePadded(AtomicUsize::new(0)),
            head: CachePadded(AtomicUsize::new(0)),
            mask: capacity - 1,
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Producer-side enqueue. Returns the value back if the ring is full.
    pub fn put(&self, value: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];
        if slot.full.load(Ordering::Acquire) {
            return Err(value);
        }
        // Safety: the occupancy flag is clear, so the consumer is done with
        // this slot and only this producer may write it.
        unsafe { (*slot.data.get()).write(value) };
        slot.full.store(true, Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }

    /// Consumer-side dequeue. Returns `None` if the ring is empty.
    pub fn get(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        if !slot.full.load(Ordering::Acquire) {
            return None;
        }
        // Safety: the occupancy flag is set, so the producer has published
        // this slot and only this consumer may read it.
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.full.store(false, Ordering::Release);
        self.head.0.store(head.wrapping_add(1), Ordering::Relaxed);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.0.load(Ordering::Relaxed);
        !self.slots[head & self.mask].full.load(Ordering::Acquire)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.get().is_some() {}
    }
}
