//! Flat-combining executor.
//!
//! Serializes calls to a per-partition routine coming from many threads
//! without a blocking lock. A caller publishes its request cell into the
//! MPMC ring, then races for the combiner role. Whoever wins drains the
//! ring, applying the routine to each request up to the handoff bound and
//! marking each cell done; the losers spin on their own cell's done flag.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backoff::backoff;
use crate::MpmcRing;

/// One published request: the payload travels to whichever thread holds
/// the combiner role and the result travels back through the same cell.
pub struct CombineCell<T> {
    data: UnsafeCell<Option<T>>,
    done: AtomicBool,
}

// Safety: `data` is written by the publishing thread before the cell
// enters the ring, mutated only by the thread holding the combiner role,
// and read back by the publisher only after `done` is observed with
// acquire ordering.
unsafe impl<T: Send> Send for CombineCell<T> {}
unsafe impl<T: Send> Sync for CombineCell<T> {}

impl<T> CombineCell<T> {
    pub fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            data: UnsafeCell::new(Some(value)),
            done: AtomicBool::new(false),
        })
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the payload back out of a completed cell.
    ///
    /// Panics if the cell has not been executed yet.
    pub fn take(&self) -> T {
        assert!(self.is_done(), "combine cell taken before execution");
        // Safety: `done` was published with release ordering after the
        // combiner's last write, and the combiner dropped its clone.
        unsafe { (*self.data.get()).take() }.expect("combine cell taken twice")
    }
}

/// A flat combiner over request payloads of type `T`.
///
/// The ring size bounds how many requests can be in flight; the handoff
/// bound limits how many requests one combiner executes before releasing
/// the role (latency versus throughput).
pub struct Combiner<T> {
    ring: MpmcRing<Arc<CombineCell<T>>>,
    role: AtomicBool,
    handoff: usize,
}

impl<T: Send> Combiner<T> {
    pub fn new(size: usize, handoff: usize) -> Self {
        assert!(handoff > 0);
        Self {
            ring: MpmcRing::new(size),
            role: AtomicBool::new(false),
            handoff,
        }
    }

    /// Execute `cell` through the serialized routine. Returns once the
    /// cell is done; the result is retrieved with [`CombineCell::take`].
    ///
    /// All callers for one combiner must pass an equivalent routine (in
    /// Mica: the apply function of one partition). A combined routine is
    /// assumed total; there is no failure path.
    pub fn execute<F>(&self, cell: &Arc<CombineCell<T>>, mut routine: F)
    where
        F: FnMut(&mut T),
    {
        self.ring.enqueue(Arc::clone(cell));

        let mut step = 0;
        while !cell.is_done() {
            if self
                .role
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.combine(&mut routine);
                self.role.store(false, Ordering::Release);
            } else {
                step = backoff(step);
            }
        }
    }

    fn combine<F>(&self, routine: &mut F)
    where
        F: FnMut(&mut T),
    {
        let mut executed = 0;
        while executed < self.handoff {
            let Some(cell) = self.ring.get() else { break };
            // Safety: the role flag makes this thread the only one touching
            // published cells, and the publisher does not read until done.
            unsafe {
                if let Some(data) = (*cell.data.get()).as_mut() {
                    routine(data);
                }
            }
            cell.done.store(true, Ordering::Release);
            executed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    #[test]
    fn single_thread_executes_inline() {
        let combiner = Combiner::new(8, 4);
        let cell = CombineCell::new(41u64);
        combiner.execute(&cell, |v| *v += 1);
        assert_eq!(cell.take(), 42);
    }

    #[test]
    fn contended_requests_apply_exactly_once() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;

        let combiner = Arc::new(Combiner::new(64, 16));
        let total = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let combiner = Arc::clone(&combiner);
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    for i in 0..ROUNDS {
                        let cell = CombineCell::new(i as u64);
                        let total = Arc::clone(&total);
                        combiner.execute(&cell, move |v| {
                            total.fetch_add(1, Ordering::Relaxed);
                            *v *= 2;
                        });
                        assert_eq!(cell.take(), (i as u64) * 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), (THREADS * ROUNDS) as u64);
    }
}
