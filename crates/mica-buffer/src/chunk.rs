//! Fixed-size byte chunks and the per-runtime chunk pool.
//!
//! Each runtime owns one pool; buffers allocated on that runtime draw from
//! and return to it. Chunks freed by a foreign runtime travel home through
//! the runtime's chunks ring and are drained back into the pool by the
//! dealer.

use std::cell::RefCell;
use std::rc::Rc;

/// Size of one owned buffer segment.
pub const CHUNK_CAPACITY: usize = 4096;

/// How many free chunks a pool keeps before dropping the excess.
const POOL_KEEP: usize = 64;

/// A fixed-capacity byte chunk. Movable across threads so foreign frees
/// can be shipped back to the owning pool.
pub struct Chunk {
    buf: Box<[u8]>,
}

impl Chunk {
    fn new() -> Self {
        Self {
            buf: vec![0u8; CHUNK_CAPACITY].into_boxed_slice(),
        }
    }

    /// A zero-capacity placeholder used when a chunk is extracted from a
    /// segment that is about to be dropped.
    pub(crate) fn empty() -> Self {
        Self { buf: Box::new([]) }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// A cache of free chunks.
pub struct ChunkPool {
    free: Vec<Chunk>,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// A shareable pool handle for buffers living on one runtime.
    pub fn handle() -> PoolRef {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn alloc(&mut self) -> Chunk {
        self.free.pop().unwrap_or_else(Chunk::new)
    }

    pub fn release(&mut self, chunk: Chunk) {
        if chunk.capacity() == CHUNK_CAPACITY && self.free.len() < POOL_KEEP {
            self.free.push(chunk);
        }
    }

    pub fn free_chunks(&self) -> usize {
        self.free.len()
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool handle shared by the buffers of one runtime.
pub type PoolRef = Rc<RefCell<ChunkPool>>;
