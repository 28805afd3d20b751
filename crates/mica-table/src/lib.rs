//! # mica-table
//!
//! The partitioned cache table: a growing, self-evicting, hash-partitioned
//! key/value store. Keys are routed to partitions by the low bits of their
//! FNV-1a hash; inside a partition, entries live in a chunked slab indexed
//! by `u32` slots, bucket chains are slot indices in a reserved-and-
//! committed address region, and eviction is a CLOCK sweep over the slab.
//!
//! Concurrency isolation is chosen at construction: flat combining, a
//! home-runtime delegate, or a plain partition lock. The observable
//! semantics are identical across the three.

mod action;
mod bucket;
mod engine;
mod entry;
mod hash;
mod part;
mod table;
mod time;

pub use action::{Action, ActionOut, Applied, StoreKind};
pub use engine::{evict_task, stride_task, EngineMode, EntryGuard, Partition, PartitionStats};
pub use entry::KEY_LEN_MAX;
pub use hash::fnv1a;
pub use table::{Table, TableConfig, TableError};
pub use time::{normalize_exptime, unix_now};
