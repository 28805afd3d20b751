//! Wait queues.
//!
//! [`WaitQueue`] is the runtime-local flavor: an ordered list of suspended
//! tasks on one runtime. `wait` enqueues FIFO, `waitfirst` enqueues LIFO —
//! idle workers wait at the head so they pick up the next work item before
//! the master spawns another worker. [`WaitSet`] is the cross-thread
//! flavor used by cache partitions, where the waiter and the waker may
//! live on different runtimes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

/// A runtime-local queue of suspended tasks.
pub struct WaitQueue {
    entries: RefCell<VecDeque<(u64, Waker)>>,
    next_id: Cell<u64>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(VecDeque::new()),
            next_id: Cell::new(0),
        }
    }

    fn issue_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Suspend at the tail of the queue.
    pub fn wait(&self) -> Wait<'_> {
        Wait { queue: self, id: None, first: false }
    }

    /// Suspend at the head of the queue.
    pub fn waitfirst(&self) -> Wait<'_> {
        Wait { queue: self, id: None, first: true }
    }

    /// Wake the task at the head. Returns false if nobody was waiting.
    pub fn signal(&self) -> bool {
        match self.entries.borrow_mut().pop_front() {
            Some((_, waker)) => {
                waker.wake();
                true
            }
            None => false,
        }
    }

    /// Wake every waiting task.
    pub fn broadcast(&self) {
        let drained: Vec<_> = self.entries.borrow_mut().drain(..).collect();
        for (_, waker) in drained {
            waker.wake();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn contains(&self, id: u64) -> bool {
        self.entries.borrow().iter().any(|(i, _)| *i == id)
    }

    fn update(&self, id: u64, waker: &Waker) {
        if let Some(entry) = self.entries.borrow_mut().iter_mut().find(|(i, _)| *i == id) {
            entry.1 = waker.clone();
        }
    }

    fn remove(&self, id: u64) {
        self.entries.borrow_mut().retain(|(i, _)| *i != id);
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Wait<'a> {
    queue: &'a WaitQueue,
    id: Option<u64>,
    first: bool,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.id {
            None => {
                let id = self.queue.issue_id();
                let entry = (id, cx.waker().clone());
                if self.first {
                    self.queue.entries.borrow_mut().push_front(entry);
                } else {
                    self.queue.entries.borrow_mut().push_back(entry);
                }
                self.id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                if self.queue.contains(id) {
                    // Spurious poll; stay queued with a fresh waker.
                    self.queue.update(id, cx.waker());
                    Poll::Pending
                } else {
                    self.id = None;
                    Poll::Ready(())
                }
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.queue.remove(id);
        }
    }
}

/// A thread-safe set of waiting tasks, woken all at once.
pub struct WaitSet {
    entries: Mutex<Vec<(u64, Waker)>>,
    next_id: AtomicU64,
}

impl WaitSet {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn wait(&self) -> WaitSetWait<'_> {
        WaitSetWait { set: self, id: None }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().expect("waitset poisoned");
            entries.drain(..).collect()
        };
        for (_, waker) in drained {
            waker.wake();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("waitset poisoned").is_empty()
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WaitSetWait<'a> {
    set: &'a WaitSet,
    id: Option<u64>,
}

impl Future for WaitSetWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut entries = self.set.entries.lock().expect("waitset poisoned");
        match self.id {
            None => {
                let id = self.set.next_id.fetch_add(1, Ordering::Relaxed);
                entries.push((id, cx.waker().clone()));
                drop(entries);
                self.id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                if let Some(entry) = entries.iter_mut().find(|(i, _)| *i == id) {
                    entry.1 = cx.waker().clone();
                    Poll::Pending
                } else {
                    drop(entries);
                    self.id = None;
                    Poll::Ready(())
                }
            }
        }
    }
}

impl Drop for WaitSetWait<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.set
                .entries
                .lock()
                .expect("waitset poisoned")
                .retain(|(i, _)| *i != id);
        }
    }
}
