//! The per-core runtime: run queue, executor loop, standing tasks and
//! cross-runtime submission.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, trace};

use mica_buffer::{Chunk, ChunkPool, PoolRef};
use mica_ring::MpmcRing;

use crate::task::{yield_now, LocalFuture, Priority, TaskId, TaskSlot, NPRIO};
use crate::timer::TimerHeap;
use crate::wait::WaitQueue;
use crate::work::WorkItem;
use crate::{CHUNK_RING_SIZE, DEALER_TIMEOUT, INBOX_RING_SIZE};

/// Index of a runtime within the set.
pub type CoreId = usize;

/// Called by the primary dealer instead of parking: pump the event loop
/// with a bounded timeout.
pub type PumpFn = Box<dyn FnMut(Option<Duration>) + Send>;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Runtime>>> = const { RefCell::new(None) };
}

/// The runtime hosting the calling task.
///
/// Panics when called off a runtime thread.
pub fn current() -> Rc<Runtime> {
    try_current().expect("not on a runtime thread")
}

pub fn try_current() -> Option<Rc<Runtime>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The cross-thread face of one runtime: the wake list, the inbox and
/// chunks rings, the park/notify pair and the stop flag.
pub struct Shared {
    core: CoreId,
    wakes: Mutex<Vec<TaskId>>,
    inbox: MpmcRing<WorkItem>,
    chunks: MpmcRing<Chunk>,
    park: Mutex<bool>,
    unpark: Condvar,
    stop: AtomicBool,
    notify_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Shared {
    pub(crate) fn new(core: CoreId) -> Arc<Self> {
        Arc::new(Self {
            core,
            wakes: Mutex::new(Vec::new()),
            inbox: MpmcRing::new(INBOX_RING_SIZE),
            chunks: MpmcRing::new(CHUNK_RING_SIZE),
            park: Mutex::new(false),
            unpark: Condvar::new(),
            stop: AtomicBool::new(false),
            notify_hook: Mutex::new(None),
        })
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Queue a task wakeup and kick the runtime out of any blocking wait.
    fn wake_task(&self, task: TaskId) {
        self.wakes.lock().expect("wake list poisoned").push(task);
        self.notify();
    }

    /// Kick the runtime out of its blocking wait (condvar park for
    /// secondary runtimes, the event-loop waker for the primary).
    pub fn notify(&self) {
        {
            let mut pending = self.park.lock().expect("park lock poisoned");
            *pending = true;
        }
        self.unpark.notify_one();
        let hook = self.notify_hook.lock().expect("hook lock poisoned").clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Install the primary runtime's event-loop wakeup.
    pub fn set_notify_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.notify_hook.lock().expect("hook lock poisoned") = Some(hook);
    }

    /// Post a work item into this runtime's inbox without blocking.
    pub fn try_post(&self, work: WorkItem) -> Result<(), WorkItem> {
        let r = self.inbox.put(work);
        if r.is_ok() {
            self.notify();
        }
        r
    }

    /// Post a work item, spinning from a non-runtime thread until the
    /// inbox accepts it.
    pub fn post(&self, work: WorkItem) {
        let mut work = work;
        loop {
            match self.try_post(work) {
                Ok(()) => return,
                Err(back) => {
                    work = back;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Return a buffer chunk freed by a foreign runtime to this runtime's
    /// pool. Dropped on the floor when the ring is full, which only costs
    /// an allocation later.
    pub fn post_chunk(&self, chunk: Chunk) {
        if self.chunks.put(chunk).is_ok() {
            self.notify();
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Block the calling runtime thread until notified or `timeout`.
    fn park_for(&self, timeout: Duration) {
        let mut pending = self.park.lock().expect("park lock poisoned");
        if !*pending {
            let (guard, _) = self
                .unpark
                .wait_timeout(pending, timeout)
                .expect("park lock poisoned");
            pending = guard;
        }
        *pending = false;
    }
}

struct TaskWaker {
    shared: Arc<Shared>,
    task: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.shared.wake_task(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.wake_task(self.task);
    }
}

/// One CPU-pinned cooperative runtime.
pub struct Runtime {
    shared: Arc<Shared>,
    peers: Vec<Arc<Shared>>,
    tasks: RefCell<Slab<TaskSlot>>,
    runq: [RefCell<VecDeque<TaskId>>; NPRIO],
    timers: RefCell<TimerHeap>,
    work: RefCell<VecDeque<WorkItem>>,
    /// Workers wait at the head, the master waits at the tail.
    idle: WaitQueue,
    /// The master blocks here while the worker pool is at capacity.
    worker_exit: WaitQueue,
    nworkers: Cell<u32>,
    nworkers_max: u32,
    pool: PoolRef,
    pump: RefCell<Option<PumpFn>>,
}

impl Runtime {
    pub(crate) fn new(
        shared: Arc<Shared>,
        peers: Vec<Arc<Shared>>,
        nworkers_max: u32,
        pump: Option<PumpFn>,
    ) -> Rc<Self> {
        Rc::new(Self {
            shared,
            peers,
            tasks: RefCell::new(Slab::new()),
            runq: [
                RefCell::new(VecDeque::new()),
                RefCell::new(VecDeque::new()),
                RefCell::new(VecDeque::new()),
            ],
            timers: RefCell::new(TimerHeap::new()),
            work: RefCell::new(VecDeque::new()),
            idle: WaitQueue::new(),
            worker_exit: WaitQueue::new(),
            nworkers: Cell::new(0),
            nworkers_max,
            pool: ChunkPool::handle(),
            pump: RefCell::new(pump),
        })
    }

    pub fn core(&self) -> CoreId {
        self.shared.core
    }

    pub fn ncores(&self) -> usize {
        self.peers.len()
    }

    pub fn is_primary(&self) -> bool {
        self.shared.core == 0
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn peer(&self, core: CoreId) -> &Arc<Shared> {
        &self.peers[core]
    }

    /// The buffer chunk pool owned by this runtime.
    pub fn pool(&self) -> &PoolRef {
        &self.pool
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerHeap> {
        &self.timers
    }

    pub fn stopped(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Install this runtime as the thread's current runtime.
    pub(crate) fn enter(self: &Rc<Self>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(Rc::clone(self)));
    }

    pub(crate) fn leave(&self) {
        CURRENT.with(|c| *c.borrow_mut() = None);
    }

    /// Spawn a task on this runtime.
    pub fn spawn<F>(&self, name: &'static str, priority: Priority, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let future: LocalFuture = Box::pin(future);
        let task = {
            let mut tasks = self.tasks.borrow_mut();
            let task = tasks.insert(TaskSlot {
                name,
                priority,
                future: Some(future),
                waker: None,
                queued: true,
                cancelled: false,
            });
            let waker = Waker::from(Arc::new(TaskWaker {
                shared: Arc::clone(&self.shared),
                task,
            }));
            tasks[task].waker = Some(waker);
            task
        };
        self.runq[priority.band()].borrow_mut().push_back(task);
        trace!(task, name, "spawned task");
        task
    }

    /// Mark a task for cancellation. The executor drops its future at the
    /// next scheduling point, which runs the task's cleanup.
    pub fn cancel(&self, task: TaskId) {
        if let Some(slot) = self.tasks.borrow_mut().get_mut(task) {
            slot.cancelled = true;
        }
        self.shared.wake_task(task);
    }

    /// Number of live tasks, counting the standing master and dealer.
    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Queue a work item on this runtime and let an idle worker (or the
    /// master) have it.
    pub fn post_local(&self, work: WorkItem) {
        self.work.borrow_mut().push_back(work);
        self.idle.signal();
    }

    /// Post a work item to `target`, yielding and retrying while the
    /// target inbox is full.
    pub async fn submit(&self, target: CoreId, work: WorkItem) {
        if target == self.core() {
            self.post_local(work);
            return;
        }
        let peer = Arc::clone(&self.peers[target]);
        let mut work = work;
        loop {
            match peer.try_post(work) {
                Ok(()) => return,
                Err(back) => {
                    work = back;
                    yield_now().await;
                }
            }
        }
    }

    fn drain_wakes(&self) {
        let woken: Vec<TaskId> = {
            let mut wakes = self.shared.wakes.lock().expect("wake list poisoned");
            std::mem::take(&mut *wakes)
        };
        let mut tasks = self.tasks.borrow_mut();
        for task in woken {
            if let Some(slot) = tasks.get_mut(task) {
                if !slot.queued {
                    slot.queued = true;
                    self.runq[slot.priority.band()].borrow_mut().push_back(task);
                }
            }
        }
    }

    fn next_ready(&self) -> Option<TaskId> {
        for band in &self.runq {
            if let Some(task) = band.borrow_mut().pop_front() {
                return Some(task);
            }
        }
        None
    }

    fn poll_task(&self, task: TaskId) {
        let (mut future, waker, name) = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(task) else { return };
            slot.queued = false;
            if slot.cancelled {
                let slot = tasks.remove(task);
                drop(tasks);
                trace!(task, name = slot.name, "cancelled task");
                drop(slot);
                return;
            }
            let Some(future) = slot.future.take() else { return };
            let waker = slot.waker.clone().expect("task waker installed at spawn");
            (future, waker, slot.name)
        };

        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                let mut tasks = self.tasks.borrow_mut();
                if tasks.contains(task) {
                    tasks.remove(task);
                }
                trace!(task, name, "task finished");
            }
            Poll::Pending => {
                if let Some(slot) = self.tasks.borrow_mut().get_mut(task) {
                    slot.future = Some(future);
                }
            }
        }
    }

    /// Run the executor loop until a stop is requested. This call is the
    /// boot task of the runtime thread: it spawns the master and dealer,
    /// then schedules everything else.
    pub fn run(self: &Rc<Self>) {
        let rt = Rc::clone(self);
        self.spawn("master", Priority::Master, master(rt));
        let rt = Rc::clone(self);
        self.spawn("dealer", Priority::Idle, dealer(rt));

        loop {
            self.drain_wakes();
            if self.stopped() {
                break;
            }
            match self.next_ready() {
                Some(task) => self.poll_task(task),
                None => self.shared.park_for(Duration::from_millis(10)),
            }
        }

        // Drop every live task; their cleanup runs in reverse declaration
        // order inside each future.
        let tasks = {
            let mut tasks = self.tasks.borrow_mut();
            std::mem::replace(&mut *tasks, Slab::new())
        };
        drop(tasks);
        debug!(core = self.core(), "runtime stopped");
    }

    fn drain_inbox(&self) -> bool {
        // The dealer is the only consumer of its own inbox.
        let mut received = false;
        while let Some(work) = self.shared.inbox.relaxed_get() {
            self.post_local(work);
            received = true;
        }
        received
    }

    fn drain_chunks(&self) {
        while let Some(chunk) = self.shared.chunks.relaxed_get() {
            self.pool.borrow_mut().release(chunk);
        }
    }

    /// Block until notified, an event arrives, or the nearest timer is
    /// due, whichever comes first.
    fn pump(&self, bound: Duration) {
        let timeout = match self.timers.borrow_mut().next_deadline() {
            Some(when) => bound.min(when.saturating_duration_since(Instant::now())),
            None => bound,
        };
        let mut pump = self.pump.borrow_mut();
        match pump.as_mut() {
            Some(pump) => pump(Some(timeout)),
            None => self.shared.park_for(timeout),
        }
    }

    fn spawn_worker(self: &Rc<Self>, work: WorkItem) {
        self.nworkers.set(self.nworkers.get() + 1);
        let rt = Rc::clone(self);
        self.spawn("worker", Priority::Work, worker(rt, work));
    }
}

/// Master protocol: keep the worker pool fed while the runtime lives.
async fn master(rt: Rc<Runtime>) {
    loop {
        if rt.stopped() {
            break;
        }
        if rt.nworkers.get() >= rt.nworkers_max {
            // Wait for a worker to exit before spawning another.
            rt.worker_exit.wait().await;
            continue;
        }
        let work = rt.work.borrow_mut().pop_front();
        match work {
            None => {
                // Wait at the tail of the idle queue so any idle worker
                // takes work over the master.
                rt.idle.wait().await;
            }
            Some(work) => rt.spawn_worker(work),
        }
    }
}

/// Worker loop: execute the given work item, then keep draining locally
/// queued work, idling at the head of the idle queue between items.
async fn worker(rt: Rc<Runtime>, first: WorkItem) {
    let mut work = first;
    loop {
        trace!(core = rt.core(), name = work.name(), "worker executing");
        work.into_future().await;

        let next = rt.work.borrow_mut().pop_front();
        match next {
            Some(next) => work = next,
            None => {
                rt.idle.waitfirst().await;
                let next = rt.work.borrow_mut().pop_front();
                match next {
                    Some(next) => work = next,
                    None => break,
                }
            }
        }
    }

    // Exit accounting: wake the master if it was blocked on a full pool.
    let was_capped = rt.nworkers.get() == rt.nworkers_max;
    rt.nworkers.set(rt.nworkers.get() - 1);
    if was_capped {
        rt.worker_exit.signal();
    }
}

/// Dealer loop: drain the inbox, pump events or park, reclaim chunks, run
/// due timers, yield.
async fn dealer(rt: Rc<Runtime>) {
    loop {
        if rt.stopped() {
            break;
        }
        if !rt.drain_inbox() {
            rt.pump(DEALER_TIMEOUT);
        }
        rt.drain_chunks();
        rt.timers.borrow_mut().run_due(Instant::now());
        yield_now().await;
    }
}
