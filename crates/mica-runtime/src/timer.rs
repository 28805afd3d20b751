//! Timed waits.
//!
//! Deadlines are merged into a per-runtime heap; the dealer bounds its
//! blocking wait by the nearest deadline and wakes due tasks each tick.
//! Cancelled timers are discarded lazily when they surface at the top of
//! the heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::runtime::current;

pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    wakers: HashMap<u64, Waker>,
    next_id: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            wakers: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn register(&mut self, when: Instant, waker: Waker) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((when, id)));
        self.wakers.insert(id, waker);
        id
    }

    pub fn update(&mut self, id: u64, waker: &Waker) {
        if let Some(entry) = self.wakers.get_mut(&id) {
            *entry = waker.clone();
        }
    }

    pub fn cancel(&mut self, id: u64) {
        self.wakers.remove(&id);
    }

    /// Wake every timer whose deadline has passed.
    pub fn run_due(&mut self, now: Instant) {
        while let Some(Reverse((when, id))) = self.heap.peek().copied() {
            if when > now {
                break;
            }
            self.heap.pop();
            if let Some(waker) = self.wakers.remove(&id) {
                waker.wake();
            }
        }
    }

    /// The nearest live deadline, skipping cancelled entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((when, id))) = self.heap.peek().copied() {
            if self.wakers.contains_key(&id) {
                return Some(when);
            }
            self.heap.pop();
        }
        None
    }
}

/// Suspend the current task for `duration`.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        when: Instant::now() + duration,
        id: None,
    }
}

pub struct Sleep {
    when: Instant,
    id: Option<u64>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.when {
            if let Some(id) = self.id.take() {
                current().timers().borrow_mut().cancel(id);
            }
            return Poll::Ready(());
        }
        let rt = current();
        let mut timers = rt.timers().borrow_mut();
        match self.id {
            None => self.id = Some(timers.register(self.when, cx.waker().clone())),
            Some(id) => timers.update(id, cx.waker()),
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(rt) = crate::runtime::try_current() {
                rt.timers().borrow_mut().cancel(id);
            }
        }
    }
}

/// Drive `future` with a deadline. Returns `None` if the deadline fires
/// first; the inner future is dropped in that case (its cleanup runs).
pub async fn with_timeout<F: Future>(duration: Duration, future: F) -> Option<F::Output> {
    let mut future = Box::pin(future);
    let mut deadline = Box::pin(sleep(duration));
    std::future::poll_fn(move |cx| {
        if let Poll::Ready(v) = future.as_mut().poll(cx) {
            return Poll::Ready(Some(v));
        }
        if deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        Poll::Pending
    })
    .await
}
