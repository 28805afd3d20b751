//! Partition concurrency engines.
//!
//! Exactly one strategy is active per table, chosen at construction:
//!
//! - **Combiner**: callers publish their action into the partition's flat
//!   combiner; whoever holds the combiner role applies a batch under the
//!   partition state.
//! - **Delegate**: each partition is homed on one runtime. Actions from
//!   the home runtime apply directly; the command executor routes foreign
//!   actions to the home runtime (see [`Partition::home`]).
//! - **Locking**: actions apply inline under the partition lock.
//!
//! The observable semantics are identical: per partition, actions are
//! linearizable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use mica_ring::{CombineCell, Combiner};
use mica_runtime::{yield_now, CoreId, WaitSet};

use crate::action::{apply, Action, ActionOut, Applied};
use crate::part::PartInner;
use crate::time::unix_now;

/// Requests flowing through the flat combiner.
struct Request {
    input: Option<(Action, u32)>,
    output: Option<Applied>,
}

enum Engine {
    Locking,
    Combiner(Combiner<Request>),
    Delegate { home: CoreId },
}

/// Concurrency strategy selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineMode {
    Combiner,
    Delegate,
    Locking,
}

impl std::str::FromStr for EngineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combiner" => Ok(Self::Combiner),
            "delegate" => Ok(Self::Delegate),
            "locking" => Ok(Self::Locking),
            other => Err(format!("unknown engine '{other}' (combiner|delegate|locking)")),
        }
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Combiner => "combiner",
            Self::Delegate => "delegate",
            Self::Locking => "locking",
        })
    }
}

/// Ring size of each partition's combiner.
const COMBINER_SIZE: usize = 1024;
/// Requests one combiner role holder executes before handing off.
const COMBINER_HANDOFF: usize = 16;

/// One shard of the cache with its serialization engine and maintenance
/// state.
pub struct Partition {
    index: usize,
    inner: Mutex<PartInner>,
    engine: Engine,
    striding: AtomicBool,
    evicting: AtomicBool,
    waitset: WaitSet,
    evict_reserve: usize,
}

impl Partition {
    pub(crate) fn new(
        inner: PartInner,
        mode: EngineMode,
        ncores: usize,
        evict_reserve: usize,
    ) -> Arc<Self> {
        let index = inner.index();
        let engine = match mode {
            EngineMode::Locking => Engine::Locking,
            EngineMode::Combiner => Engine::Combiner(Combiner::new(COMBINER_SIZE, COMBINER_HANDOFF)),
            EngineMode::Delegate => Engine::Delegate { home: index % ncores.max(1) },
        };
        Arc::new(Self {
            index,
            inner: Mutex::new(inner),
            engine,
            striding: AtomicBool::new(false),
            evicting: AtomicBool::new(false),
            waitset: WaitSet::new(),
            evict_reserve,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The runtime this partition is pinned to, in delegate mode.
    pub fn home(&self) -> Option<CoreId> {
        match &self.engine {
            Engine::Delegate { home } => Some(*home),
            _ => None,
        }
    }

    /// Apply one action under the partition's serialization discipline.
    ///
    /// In delegate mode the caller is responsible for routing: this must
    /// be called on the home runtime (or for reference drops, which are
    /// safe from anywhere because the partition lock still serializes
    /// them).
    pub fn apply(&self, action: Action, now: u32) -> Applied {
        match &self.engine {
            Engine::Combiner(combiner) => {
                let cell = CombineCell::new(Request {
                    input: Some((action, now)),
                    output: None,
                });
                combiner.execute(&cell, |request| {
                    if let Some((action, now)) = request.input.take() {
                        let mut inner = self.inner.lock().expect("partition poisoned");
                        request.output = Some(apply(&mut inner, action, now));
                    }
                });
                cell.take().output.expect("combined request executed")
            }
            Engine::Locking | Engine::Delegate { .. } => {
                let mut inner = self.inner.lock().expect("partition poisoned");
                apply(&mut inner, action, now)
            }
        }
    }

    /// Whether the partition is above its volume cap plus `reserve`.
    pub fn over_volume(&self, reserve: usize) -> bool {
        self.inner.lock().expect("partition poisoned").check_volume(reserve)
    }

    /// Tasks waiting for eviction headroom.
    pub fn waitset(&self) -> &WaitSet {
        &self.waitset
    }

    /// Claim the striding task slot. At most one striding task may be in
    /// flight per partition.
    pub fn begin_stride(&self) -> bool {
        !self.striding.swap(true, Ordering::AcqRel)
    }

    /// Claim the evicting task slot.
    pub fn begin_evict(&self) -> bool {
        !self.evicting.swap(true, Ordering::AcqRel)
    }

    /// Snapshot of the partition counters, for logging and tests.
    pub fn stats(&self) -> PartitionStats {
        let inner = self.inner.lock().expect("partition poisoned");
        PartitionStats {
            live_entries: inner.live_entries(),
            nbuckets: inner.nbuckets(),
            volume: inner.volume(),
            volume_max: inner.volume_max(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PartitionStats {
    pub live_entries: u32,
    pub nbuckets: u32,
    pub volume: usize,
    pub volume_max: usize,
}

/// A held reference to a cache entry, keeping its bytes alive while a
/// reply streams out. Dropping the guard releases the reference through
/// the partition's engine.
pub struct EntryGuard {
    part: Arc<Partition>,
    index: u32,
}

impl EntryGuard {
    pub fn new(part: Arc<Partition>, index: u32) -> Self {
        Self { part, index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.part.apply(Action::Finish { index: self.index }, 0);
    }
}

/// Incremental rehash task: split a batch of buckets, yield, repeat until
/// the table settles. Exactly one per partition.
pub async fn stride_task(part: Arc<Partition>) {
    debug!(part = part.index(), "striding started");
    loop {
        let applied = part.apply(Action::Stride, 0);
        match applied.out {
            ActionOut::More(true) => yield_now().await,
            _ => break,
        }
    }
    part.striding.store(false, Ordering::Release);
    debug!(part = part.index(), "striding finished");
}

/// CLOCK eviction task: recycle one cold entry at a time until the
/// partition is back under its volume cap (with headroom). Exactly one
/// per partition.
pub async fn evict_task(part: Arc<Partition>) {
    debug!(part = part.index(), "eviction started");
    let mut dry_sweeps = 0;
    while part.over_volume(part.evict_reserve) {
        let applied = part.apply(Action::Evict, unix_now());
        match applied.out {
            ActionOut::More(true) => dry_sweeps = 0,
            _ => {
                // Nothing reclaimable right now; give up after two dry
                // sweeps and let the next overrun re-arm the task.
                dry_sweeps += 1;
                if dry_sweeps >= 2 {
                    break;
                }
            }
        }
        yield_now().await;
    }
    part.evicting.store(false, Ordering::Release);
    part.waitset().broadcast();
    debug!(part = part.index(), "eviction finished");
}
