//! Cache actions: the single entry point through which a partition is
//! mutated, whatever engine serializes the calls.

use bytes::Bytes;
use tracing::error;

use crate::part::PartInner;

/// Storage command family sharing one wire shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas(u64),
}

/// One serialized partition operation.
#[derive(Clone, Debug)]
pub enum Action {
    Lookup { key: Bytes, hash: u32 },
    Finish { index: u32 },
    Store {
        kind: StoreKind,
        key: Bytes,
        hash: u32,
        flags: u32,
        exptime: u32,
        value: Bytes,
    },
    Arith { key: Bytes, hash: u32, delta: u64, decr: bool },
    Delete { key: Bytes, hash: u32 },
    Flush { when: u32 },
    Stride,
    Evict,
}

/// Outcome of one action.
#[derive(Debug)]
pub enum ActionOut {
    Miss,
    Found { index: u32, flags: u32, stamp: u64, value: Bytes },
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Counter(u64),
    NonNumeric,
    NoMemory,
    Done,
    /// Maintenance actions: whether more work remains.
    More(bool),
}

/// An action result plus the maintenance conditions observed on the way
/// out, so the caller can spawn the stride/evict tasks.
#[derive(Debug)]
pub struct Applied {
    pub out: ActionOut,
    pub needs_stride: bool,
    pub needs_evict: bool,
}

pub(crate) fn apply(inner: &mut PartInner, action: Action, now: u32) -> Applied {
    let out = match action {
        Action::Lookup { key, hash } => match inner.lookup(&key, hash, now) {
            Some(index) => {
                let value = inner.entry_value(index);
                let (_, _, flags, stamp) = inner.entry(index);
                ActionOut::Found { index, flags, stamp, value }
            }
            None => ActionOut::Miss,
        },

        Action::Finish { index } => {
            inner.finish(index);
            ActionOut::Done
        }

        Action::Store { kind, key, hash, flags, exptime, value } => {
            store(inner, kind, &key, hash, flags, exptime, value, now)
        }

        Action::Arith { key, hash, delta, decr } => arith(inner, &key, hash, delta, decr, now),

        Action::Delete { key, hash } => {
            if inner.delete(&key, hash, now) {
                ActionOut::Deleted
            } else {
                ActionOut::NotFound
            }
        }

        Action::Flush { when } => {
            inner.flush(when);
            ActionOut::Done
        }

        Action::Stride => match inner.stride() {
            Ok(more) => ActionOut::More(more),
            Err(e) => {
                // Losing the bucket region is unrecoverable.
                error!(part = inner.index(), error = %e, "bucket commit failed");
                std::process::abort();
            }
        },

        Action::Evict => ActionOut::More(inner.evict_one()),
    };

    Applied {
        needs_stride: inner.check_size(),
        needs_evict: inner.check_volume(0),
        out,
    }
}

#[allow(clippy::too_many_arguments)]
fn store(
    inner: &mut PartInner,
    kind: StoreKind,
    key: &[u8],
    hash: u32,
    flags: u32,
    exptime: u32,
    value: Bytes,
    now: u32,
) -> ActionOut {
    let existing = inner.probe(key, hash, now);

    match kind {
        StoreKind::Set => {
            if let Some(old) = existing {
                inner.unlink(old);
                inner.reclaim_if_unreferenced(old);
            }
            match inner.create(key, hash, flags, exptime, value) {
                Some(idx) => {
                    inner.insert(idx);
                    ActionOut::Stored
                }
                None => ActionOut::NoMemory,
            }
        }
        StoreKind::Add => {
            if existing.is_some() {
                return ActionOut::NotStored;
            }
            match inner.create(key, hash, flags, exptime, value) {
                Some(idx) => {
                    inner.insert(idx);
                    ActionOut::Stored
                }
                None => ActionOut::NoMemory,
            }
        }
        StoreKind::Replace => {
            let Some(old) = existing else { return ActionOut::NotStored };
            inner.unlink(old);
            inner.reclaim_if_unreferenced(old);
            match inner.create(key, hash, flags, exptime, value) {
                Some(idx) => {
                    inner.insert(idx);
                    ActionOut::Stored
                }
                None => ActionOut::NoMemory,
            }
        }
        StoreKind::Append | StoreKind::Prepend => {
            let Some(idx) = existing else { return ActionOut::NotStored };
            let old = inner.entry_value(idx);
            let mut joined = Vec::with_capacity(old.len() + value.len());
            if matches!(kind, StoreKind::Append) {
                joined.extend_from_slice(&old);
                joined.extend_from_slice(&value);
            } else {
                joined.extend_from_slice(&value);
                joined.extend_from_slice(&old);
            }
            // Concatenation keeps the stored flags and expiration.
            inner.update_value(idx, Bytes::from(joined), None, None);
            ActionOut::Stored
        }
        StoreKind::Cas(stamp) => {
            let Some(idx) = existing else { return ActionOut::NotFound };
            if inner.entry_stamp(idx) != stamp {
                return ActionOut::Exists;
            }
            inner.update_value(idx, value, Some(flags), Some(exptime));
            ActionOut::Stored
        }
    }
}

fn arith(inner: &mut PartInner, key: &[u8], hash: u32, delta: u64, decr: bool, now: u32) -> ActionOut {
    let Some(idx) = inner.probe(key, hash, now) else {
        return ActionOut::NotFound;
    };
    let old = inner.entry_value(idx);
    let Some(current) = parse_counter(&old) else {
        return ActionOut::NonNumeric;
    };
    let next = if decr {
        current.saturating_sub(delta)
    } else {
        current.saturating_add(delta)
    };
    inner.update_value(idx, Bytes::from(next.to_string()), None, None);
    ActionOut::Counter(next)
}

/// Strict decimal parse of a stored counter value.
fn parse_counter(value: &[u8]) -> Option<u64> {
    if value.is_empty() || value.len() > 20 {
        return None;
    }
    let mut acc: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return None;
        }
        acc = acc.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(acc)
}
