//! Parsed command representation.

use bytes::Bytes;

/// Storage command family: same wire shape, different insert rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

/// Absolute range of a data block inside the receive buffer. The bytes
/// stay pinned in the buffer until the command retires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRef {
    pub off: u64,
    pub len: u32,
}

/// One fully parsed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Get {
        keys: Vec<Bytes>,
        with_cas: bool,
    },
    Store {
        op: StoreOp,
        key: Bytes,
        flags: u32,
        exptime: u32,
        data: DataRef,
        /// Only meaningful for `StoreOp::Cas`.
        cas: u64,
        noreply: bool,
    },
    Arith {
        key: Bytes,
        delta: u64,
        decr: bool,
        noreply: bool,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Touch {
        key: Bytes,
        exptime: u32,
        noreply: bool,
    },
    FlushAll {
        delay: u32,
        noreply: bool,
    },
    Verbosity {
        level: u32,
        noreply: bool,
    },
    Version,
    Stats,
    Slabs,
    Quit,
}

impl Request {
    /// Whether the client asked for the reply to be suppressed.
    pub fn noreply(&self) -> bool {
        match self {
            Request::Store { noreply, .. }
            | Request::Arith { noreply, .. }
            | Request::Delete { noreply, .. }
            | Request::Touch { noreply, .. }
            | Request::FlushAll { noreply, .. }
            | Request::Verbosity { noreply, .. } => *noreply,
            _ => false,
        }
    }
}
