//! # mica-event
//!
//! A thin readiness dispatcher over `mio`'s epoll/kqueue abstraction.
//!
//! The poll half ([`Poller`]) lives on the primary runtime, whose dealer
//! pumps it with a bounded timeout. The registration half ([`Handle`]) is
//! shared: any runtime may register a descriptor, park a task waker for a
//! direction, or wake the poller through the built-in waker (the self-pipe
//! of the C lineage). Readiness is edge-style: an event either wakes the
//! parked waker or, when no waker is parked yet, sets a sticky ready bit
//! consumed by the next wait.
//!
//! EOF and error conditions are delivered as readiness on the affected
//! direction; the owner discovers the condition from the following
//! syscall.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Registry, Token};
use tracing::trace;

/// Token reserved for the poller waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Readiness events delivered per poll batch.
const EVENT_BATCH: usize = 512;

#[derive(Default)]
struct Registration {
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    read_ready: bool,
    write_ready: bool,
}

/// Shared registration table and poller wakeup. Registration keys are
/// never reused, so a stale readiness wait can only observe "gone".
pub struct Handle {
    registry: Registry,
    regs: Mutex<HashMap<usize, Registration>>,
    next_key: AtomicUsize,
    waker: mio::Waker,
}

/// The poll half: owned by the primary runtime thread.
pub struct Poller {
    poll: mio::Poll,
    events: Events,
}

/// Create the dispatcher pair.
pub fn dispatcher() -> io::Result<(Poller, std::sync::Arc<Handle>)> {
    let poll = mio::Poll::new()?;
    let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;
    let registry = poll.registry().try_clone()?;
    let handle = std::sync::Arc::new(Handle {
        registry,
        regs: Mutex::new(HashMap::new()),
        next_key: AtomicUsize::new(0),
        waker,
    });
    let poller = Poller {
        poll,
        events: Events::with_capacity(EVENT_BATCH),
    };
    Ok((poller, handle))
}

impl Handle {
    /// Register a descriptor for both directions. Returns the registration
    /// key used by the readiness waits.
    pub fn register(&self, fd: RawFd) -> io::Result<usize> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut regs = self.regs.lock().expect("registration table poisoned");
        self.registry.register(
            &mut SourceFd(&fd),
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        regs.insert(key, Registration::default());
        trace!(fd, key, "registered descriptor");
        Ok(key)
    }

    pub fn deregister(&self, fd: RawFd, key: usize) {
        let removed = {
            let mut regs = self.regs.lock().expect("registration table poisoned");
            regs.remove(&key)
        };
        // Waiters parked on the registration must observe the removal,
        // not hang on a waker that will never fire.
        if let Some(mut reg) = removed {
            if let Some(w) = reg.read_waker.take() {
                w.wake();
            }
            if let Some(w) = reg.write_waker.take() {
                w.wake();
            }
        }
        let _ = self.registry.deregister(&mut SourceFd(&fd));
        trace!(fd, key, "deregistered descriptor");
    }

    /// Wake the poller from any thread.
    pub fn notify(&self) {
        let _ = self.waker.wake();
    }

    /// Wait until the descriptor is readable again.
    pub fn readable(&self, key: usize) -> Readiness<'_> {
        Readiness { handle: self, key, dir: Dir::Read, armed: false }
    }

    /// Wait until the descriptor is writable again.
    pub fn writable(&self, key: usize) -> Readiness<'_> {
        Readiness { handle: self, key, dir: Dir::Write, armed: false }
    }
}

#[derive(Clone, Copy)]
enum Dir {
    Read,
    Write,
}

/// A one-shot readiness wait for one direction of one registration.
pub struct Readiness<'a> {
    handle: &'a Handle,
    key: usize,
    dir: Dir,
    armed: bool,
}

impl Future for Readiness<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut regs = self.handle.regs.lock().expect("registration table poisoned");
        let Some(reg) = regs.get_mut(&self.key) else {
            // Registration vanished under us; surface as readiness so the
            // owner trips over the closed descriptor.
            return Poll::Ready(());
        };
        let (ready, parked) = match self.dir {
            Dir::Read => (&mut reg.read_ready, &mut reg.read_waker),
            Dir::Write => (&mut reg.write_ready, &mut reg.write_waker),
        };
        if *ready {
            *ready = false;
            Poll::Ready(())
        } else {
            *parked = Some(cx.waker().clone());
            drop(regs);
            self.armed = true;
            Poll::Pending
        }
    }
}

impl Drop for Readiness<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut regs = self.handle.regs.lock().expect("registration table poisoned");
        if let Some(reg) = regs.get_mut(&self.key) {
            match self.dir {
                Dir::Read => reg.read_waker = None,
                Dir::Write => reg.write_waker = None,
            }
        }
    }
}

impl Poller {
    /// Poll for readiness with a bounded timeout and dispatch the batch.
    /// Returns the number of descriptor events handled.
    pub fn pump(&mut self, handle: &Handle, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut woken = Vec::new();
        let mut count = 0;
        {
            let mut regs = handle.regs.lock().expect("registration table poisoned");
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                count += 1;
                let Some(reg) = regs.get_mut(&token.0) else { continue };
                let fail = event.is_error();
                if event.is_readable() || event.is_read_closed() || fail {
                    match reg.read_waker.take() {
                        Some(w) => woken.push(w),
                        None => reg.read_ready = true,
                    }
                }
                if event.is_writable() || event.is_write_closed() || fail {
                    match reg.write_waker.take() {
                        Some(w) => woken.push(w),
                        None => reg.write_ready = true,
                    }
                }
            }
        }
        for waker in woken {
            waker.wake();
        }
        Ok(count)
    }
}
