//! # mica-ring
//!
//! Lock-free handoff channels used for all cross-runtime communication in
//! Mica: a single-producer/single-consumer ring, a multi-producer/
//! multi-consumer ring with per-slot generation counters, and a relaxed
//! single-ended view of the MPMC layout. The flat-combining executor that
//! serializes access to one cache partition is built on top of the MPMC
//! ring and lives here too.
//!
//! All rings have power-of-two capacity. Non-blocking `put`/`get` are
//! wait-free; the blocking `enqueue`/`dequeue` variants busy-wait with
//! exponential backoff and are lock-free under contention.

mod backoff;
mod combiner;
mod mpmc;
mod spsc;

pub use combiner::{CombineCell, Combiner};
pub use mpmc::MpmcRing;
pub use spsc::SpscRing;

/// Force 128-byte alignment to prevent false sharing. Modern CPUs prefetch
/// adjacent cache lines, so double cache line size is used.
#[repr(align(128))]
pub(crate) struct CachePadded<T>(pub T);
