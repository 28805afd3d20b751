//! # mica-proto
//!
//! The memcached ASCII protocol: command model and the incremental parser
//! over a segmented receive buffer. The parser never copies value bytes;
//! a storage command carries the absolute range of its data block and the
//! executor streams it into the cache.

mod command;
mod parser;

pub use command::{DataRef, Request, StoreOp};
pub use parser::{parse, Parsed};

/// Maximum key (and generally parameter) length on the wire.
pub const KEY_LEN_MAX: usize = 250;

/// A connection that scans this much input without reaching a command
/// boundary is considered hostile and dropped.
pub const JUNK_LIMIT: usize = 1024;
