//! Multi-producer multi-consumer ring buffer.
//!
//! Every slot carries a generation counter (`lock`). A producer may fill
//! slot `i` of generation `g` only while `lock == g`; publishing stores
//! `g + 1`. A consumer may drain it only while `lock == g + 1`; handing the
//! slot to the next generation stores `g + 1 + mask`. Data written before
//! the `lock` publish is observed after the `lock` acquire.
//!
//! The `relaxed_*` operations use the same slot layout but skip the index
//! CAS; they are only sound while a single producer (or consumer) is active
//! at a time.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backoff::backoff;
use crate::CachePadded;

struct Slot<T> {
    lock: AtomicUsize,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded MPMC FIFO with per-slot generation counters.
pub struct MpmcRing<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Create a ring with the given capacity, which must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity)
            .map(|i| Slot {
                lock: AtomicUsize::new(i),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            mask: capacity - 1,
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Non-blocking enqueue. Returns the value back if the ring is full or
    /// the slot was lost to a faster producer.
    pub fn put(&self, value: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];
        if slot.lock.load(Ordering::Acquire) != tail {
            return Err(value);
        }
        if self
            .tail
            .0
            .compare_exchange(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // Safety: the CAS on `tail` grants this producer exclusive use of
        // the slot for generation `tail`.
        unsafe { (*slot.data.get()).write(value) };
        slot.lock.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Non-blocking dequeue.
    pub fn get(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        if slot.lock.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        if self
            .head
            .0
            .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // Safety: the CAS on `head` grants this consumer exclusive use of
        // the slot for generation `head`.
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.lock
            .store(head.wrapping_add(1).wrapping_add(self.mask), Ordering::Release);
        Some(value)
    }

    /// Blocking enqueue: claim an index with fetch-and-add, then busy-wait
    /// for the slot's generation with exponential backoff.
    pub fn enqueue(&self, value: T) {
        let tail = self.tail.0.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];
        let mut step = 0;
        while slot.lock.load(Ordering::Acquire) != tail {
            step = backoff(step);
        }
        unsafe { (*slot.data.get()).write(value) };
        slot.lock.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Blocking dequeue, mirror of [`enqueue`](Self::enqueue).
    pub fn dequeue(&self) -> T {
        let head = self.head.0.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        let mut step = 0;
        while slot.lock.load(Ordering::Acquire) != head.wrapping_add(1) {
            step = backoff(step);
        }
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.lock
            .store(head.wrapping_add(1).wrapping_add(self.mask), Ordering::Release);
        value
    }

    /// Relaxed enqueue: no CAS on `tail`. Only sound while this thread is
    /// the single active producer.
    pub fn relaxed_put(&self, value: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];
        if slot.lock.load(Ordering::Acquire) != tail {
            return Err(value);
        }
        self.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);
        unsafe { (*slot.data.get()).write(value) };
        slot.lock.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Relaxed dequeue: no CAS on `head`. Only sound while this thread is
    /// the single active consumer.
    pub fn relaxed_get(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        if slot.lock.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        self.head.0.store(head.wrapping_add(1), Ordering::Relaxed);
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.lock
            .store(head.wrapping_add(1).wrapping_add(self.mask), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        while self.get().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let ring = MpmcRing::new(4);
        assert!(ring.put(1).is_ok());
        assert!(ring.put(2).is_ok());
        assert_eq!(ring.get(), Some(1));
        assert_eq!(ring.get(), Some(2));
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn rejects_when_full() {
        let ring = MpmcRing::new(2);
        ring.put(1).unwrap();
        ring.put(2).unwrap();
        assert!(ring.put(3).is_err());
        assert_eq!(ring.get(), Some(1));
        assert!(ring.put(3).is_ok());
    }

    #[test]
    fn generations_survive_many_wraps() {
        let ring = MpmcRing::new(2);
        for i in 0..1000 {
            ring.enqueue(i);
            assert_eq!(ring.dequeue(), i);
        }
    }

    #[test]
    fn relaxed_mode_roundtrip() {
        let ring = MpmcRing::new(4);
        for i in 0..4 {
            ring.relaxed_put(i).unwrap();
        }
        assert!(ring.relaxed_put(9).is_err());
        for i in 0..4 {
            assert_eq!(ring.relaxed_get(), Some(i));
        }
        assert_eq!(ring.relaxed_get(), None);
    }

    #[test]
    fn drops_leftover_values() {
        let ring = MpmcRing::new(8);
        ring.put(String::from("a")).unwrap();
        ring.put(String::from("b")).unwrap();
        drop(ring);
    }
}
