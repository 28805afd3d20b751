//! # mica-buffer
//!
//! The segmented I/O buffer used on both sides of a connection: a chain of
//! byte segments where the write cursor advances in the tail segment and
//! the read cursor walks segment by segment. Owned segments draw fixed-size
//! chunks from a runtime-local pool; spliced segments attach an externally
//! owned byte range (a cache value) without copying, with a release
//! callback invoked exactly once when the read cursor passes them.

mod chunk;
mod segbuf;

pub use chunk::{Chunk, ChunkPool, PoolRef, CHUNK_CAPACITY};
pub use segbuf::SegBuf;
