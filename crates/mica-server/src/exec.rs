//! Command execution: translate parsed requests into partition actions,
//! route them to the right engine, and shape the replies.

use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use mica_proto::{Request, StoreOp};
use mica_runtime::{current, with_timeout, WorkItem};
use mica_table::{
    evict_task, fnv1a, normalize_exptime, stride_task, unix_now, Action, ActionOut, Applied,
    EntryGuard, Partition, StoreKind, Table,
};

const LINE_STORED: &str = "STORED\r\n";
const LINE_NOT_STORED: &str = "NOT_STORED\r\n";
const LINE_EXISTS: &str = "EXISTS\r\n";
const LINE_NOT_FOUND: &str = "NOT_FOUND\r\n";
const LINE_DELETED: &str = "DELETED\r\n";
const LINE_OK: &str = "OK\r\n";
const LINE_NOT_IMPLEMENTED: &str = "SERVER_ERROR not implemented\r\n";
const LINE_OOM: &str = "SERVER_ERROR out of memory storing object\r\n";
const LINE_TOO_LARGE: &str = "SERVER_ERROR object too large for cache\r\n";
const LINE_NON_NUMERIC: &str = "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n";

/// How long a storing task waits for the eviction task to make headroom
/// before giving up with a server error.
const STORE_RETRY_WAIT: Duration = Duration::from_millis(100);

/// Shared executor state handed to every connection.
pub struct ExecCtx {
    pub table: Arc<Table>,
}

/// One `get`/`gets` hit. The guard holds the entry reference until the
/// spliced value bytes have left the transmit buffer.
pub struct Hit {
    pub key: Bytes,
    pub flags: u32,
    pub stamp: u64,
    pub value: Bytes,
    pub guard: EntryGuard,
}

/// The shaped result of one command, ready for serialization.
pub enum Reply {
    /// Nothing at all (noreply).
    None,
    Line(&'static str),
    Number(u64),
    Version,
    Values { hits: Vec<Hit>, with_cas: bool },
    Quit,
}

/// Completion slot for actions routed to another runtime.
struct ReplyCell {
    slot: Mutex<(Option<Applied>, Option<Waker>)>,
}

impl ReplyCell {
    fn new() -> Arc<Self> {
        Arc::new(Self { slot: Mutex::new((None, None)) })
    }

    fn complete(&self, applied: Applied) {
        let waker = {
            let mut slot = self.slot.lock().expect("reply cell poisoned");
            slot.0 = Some(applied);
            slot.1.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    async fn wait(self: &Arc<Self>) -> Applied {
        poll_fn(|cx| {
            let mut slot = self.slot.lock().expect("reply cell poisoned");
            match slot.0.take() {
                Some(applied) => Poll::Ready(applied),
                None => {
                    slot.1 = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }
}

/// Spawn any maintenance the action surfaced: at most one striding and
/// one evicting task per partition, homed with the partition.
async fn maintain(part: &Arc<Partition>, applied: &Applied) {
    if applied.needs_stride && part.begin_stride() {
        let task_part = Arc::clone(part);
        let target = part.home().unwrap_or_else(|| current().core());
        current()
            .submit(target, WorkItem::new("table stride", move || stride_task(task_part)))
            .await;
    }
    if applied.needs_evict && part.begin_evict() {
        let task_part = Arc::clone(part);
        let target = part.home().unwrap_or_else(|| current().core());
        current()
            .submit(target, WorkItem::new("table evict", move || evict_task(task_part)))
            .await;
    }
}

/// Apply an action under the partition's engine, routing to the home
/// runtime in delegate mode.
async fn apply_routed(part: &Arc<Partition>, action: Action, now: u32) -> Applied {
    match part.home() {
        Some(home) if home != current().core() => {
            trace!(part = part.index(), home, "routing action to home runtime");
            let cell = ReplyCell::new();
            let work_part = Arc::clone(part);
            let work_cell = Arc::clone(&cell);
            current()
                .submit(
                    home,
                    WorkItem::new("cache action", move || async move {
                        let applied = work_part.apply(action, now);
                        maintain(&work_part, &applied).await;
                        work_cell.complete(applied);
                    }),
                )
                .await;
            cell.wait().await
        }
        _ => {
            let applied = part.apply(action, now);
            maintain(part, &applied).await;
            applied
        }
    }
}

/// Execute one parsed command. `data` carries the bytes of a storage
/// command's data block, already lifted out of the receive buffer.
pub async fn execute(ctx: &ExecCtx, request: Request, data: Option<Bytes>) -> Reply {
    match request {
        Request::Get { keys, with_cas } => {
            let mut hits = Vec::with_capacity(keys.len());
            for key in keys {
                let hash = fnv1a(&key);
                let part = ctx.table.partition_of(hash);
                let action = Action::Lookup { key: key.clone(), hash };
                let applied = apply_routed(part, action, unix_now()).await;
                if let ActionOut::Found { index, flags, stamp, value } = applied.out {
                    hits.push(Hit {
                        key,
                        flags,
                        stamp,
                        value,
                        guard: EntryGuard::new(Arc::clone(part), index),
                    });
                }
            }
            Reply::Values { hits, with_cas }
        }

        Request::Store { op, key, flags, exptime, data: block, cas, noreply: _ } => {
            let value = data.expect("storage command carries its data block");
            debug_assert_eq!(value.len() as u32, block.len);
            let hash = fnv1a(&key);
            let part = ctx.table.partition_of(hash);
            if value.len() + key.len() >= part.stats().volume_max {
                return Reply::Line(LINE_TOO_LARGE);
            }
            let now = unix_now();
            let kind = match op {
                StoreOp::Set => StoreKind::Set,
                StoreOp::Add => StoreKind::Add,
                StoreOp::Replace => StoreKind::Replace,
                StoreOp::Append => StoreKind::Append,
                StoreOp::Prepend => StoreKind::Prepend,
                StoreOp::Cas => StoreKind::Cas(cas),
            };
            let action = Action::Store {
                kind,
                key,
                hash,
                flags,
                exptime: normalize_exptime(exptime, now),
                value,
            };
            let retry = action.clone();
            let applied = apply_routed(part, action, now).await;
            let out = match applied.out {
                ActionOut::NoMemory => {
                    // Give the eviction task a moment to reclaim space,
                    // then try once more.
                    with_timeout(STORE_RETRY_WAIT, part.waitset().wait()).await;
                    apply_routed(part, retry, now).await.out
                }
                out => out,
            };
            match out {
                ActionOut::Stored => Reply::Line(LINE_STORED),
                ActionOut::NotStored => Reply::Line(LINE_NOT_STORED),
                ActionOut::Exists => Reply::Line(LINE_EXISTS),
                ActionOut::NotFound => Reply::Line(LINE_NOT_FOUND),
                ActionOut::NoMemory => Reply::Line(LINE_OOM),
                other => unreachable!("store produced {other:?}"),
            }
        }

        Request::Arith { key, delta, decr, noreply: _ } => {
            let hash = fnv1a(&key);
            let part = ctx.table.partition_of(hash);
            let applied =
                apply_routed(part, Action::Arith { key, hash, delta, decr }, unix_now()).await;
            match applied.out {
                ActionOut::Counter(value) => Reply::Number(value),
                ActionOut::NotFound => Reply::Line(LINE_NOT_FOUND),
                ActionOut::NonNumeric => Reply::Line(LINE_NON_NUMERIC),
                other => unreachable!("arith produced {other:?}"),
            }
        }

        Request::Delete { key, noreply: _ } => {
            let hash = fnv1a(&key);
            let part = ctx.table.partition_of(hash);
            let applied = apply_routed(part, Action::Delete { key, hash }, unix_now()).await;
            match applied.out {
                ActionOut::Deleted => Reply::Line(LINE_DELETED),
                ActionOut::NotFound => Reply::Line(LINE_NOT_FOUND),
                other => unreachable!("delete produced {other:?}"),
            }
        }

        Request::FlushAll { delay, noreply: _ } => {
            let now = unix_now();
            let when = if delay == 0 { now } else { normalize_exptime(delay, now) };
            for part in ctx.table.partitions() {
                apply_routed(part, Action::Flush { when }, now).await;
            }
            Reply::Line(LINE_OK)
        }

        Request::Version => Reply::Version,
        Request::Quit => Reply::Quit,

        // Present in the grammar, intentionally unimplemented.
        Request::Touch { .. } | Request::Stats | Request::Slabs | Request::Verbosity { .. } => {
            Reply::Line(LINE_NOT_IMPLEMENTED)
        }
    }
}
