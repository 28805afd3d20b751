//! The segmented buffer itself.
//!
//! Positions are absolute 64-bit offsets that grow monotonically for the
//! life of the buffer; segments carry the absolute offset of their first
//! byte. This lets parser cursors and command end marks survive segment
//! recycling without pointer fixups.

use std::collections::VecDeque;
use std::fmt;
use std::mem;

use bytes::Bytes;

use crate::chunk::{Chunk, PoolRef, CHUNK_CAPACITY};

/// Callback invoked when the read cursor passes a spliced segment.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

enum SegKind {
    Owned { chunk: Chunk, used: usize },
    Spliced { bytes: Bytes, release: Option<ReleaseFn> },
}

struct Segment {
    base: u64,
    kind: SegKind,
}

impl Segment {
    fn len(&self) -> usize {
        match &self.kind {
            SegKind::Owned { used, .. } => *used,
            SegKind::Spliced { bytes, .. } => bytes.len(),
        }
    }

    fn end(&self) -> u64 {
        self.base + self.len() as u64
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Exactly-once release for spliced ranges, whatever path drops the
        // segment (cursor pass-over or buffer teardown).
        if let SegKind::Spliced { release, .. } = &mut self.kind {
            if let Some(f) = release.take() {
                f();
            }
        }
    }
}

/// A chain of byte segments with an absolute read and write cursor.
pub struct SegBuf {
    pool: PoolRef,
    segs: VecDeque<Segment>,
    read_off: u64,
    write_off: u64,
}

impl SegBuf {
    pub fn new(pool: PoolRef) -> Self {
        Self {
            pool,
            segs: VecDeque::new(),
            read_off: 0,
            write_off: 0,
        }
    }

    /// Absolute offset of the next unread byte.
    pub fn read_pos(&self) -> u64 {
        self.read_off
    }

    /// Absolute offset one past the last written byte.
    pub fn write_pos(&self) -> u64 {
        self.write_off
    }

    pub fn readable(&self) -> u64 {
        self.write_off - self.read_off
    }

    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    fn push_chunk(&mut self) {
        let chunk = self.pool.borrow_mut().alloc();
        self.segs.push_back(Segment {
            base: self.write_off,
            kind: SegKind::Owned { chunk, used: 0 },
        });
    }

    fn tail_space(&self) -> usize {
        match self.segs.back() {
            Some(Segment { kind: SegKind::Owned { chunk, used }, .. }) => chunk.capacity() - used,
            _ => 0,
        }
    }

    /// Ensure at least `n` contiguous writable bytes and return the
    /// writable tail slice (which may be longer than `n`).
    ///
    /// `n` must not exceed the chunk capacity.
    pub fn demand(&mut self, n: usize) -> &mut [u8] {
        assert!(n <= CHUNK_CAPACITY, "demand beyond chunk capacity");
        if self.tail_space() < n {
            self.push_chunk();
        }
        match self.segs.back_mut() {
            Some(Segment { kind: SegKind::Owned { chunk, used }, .. }) => {
                &mut chunk.bytes_mut()[*used..]
            }
            _ => unreachable!("tail is an owned chunk after push_chunk"),
        }
    }

    /// Account for `n` bytes written into the slice returned by
    /// [`demand`](Self::demand).
    pub fn commit(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        match self.segs.back_mut() {
            Some(Segment { kind: SegKind::Owned { chunk, used }, .. }) => {
                assert!(*used + n <= chunk.capacity(), "commit past chunk end");
                *used += n;
            }
            _ => panic!("commit without a writable tail"),
        }
        self.write_off += n as u64;
    }

    /// Copy `src` into the buffer, growing the chain as needed.
    pub fn append(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let space = self.tail_space();
            if space == 0 {
                self.push_chunk();
                continue;
            }
            let n = space.min(src.len());
            let dst = self.demand(1);
            dst[..n].copy_from_slice(&src[..n]);
            self.commit(n);
            src = &src[n..];
        }
    }

    /// Attach an externally owned byte range as its own segment. The
    /// release callback runs when the read cursor passes the segment.
    pub fn splice(&mut self, bytes: Bytes, release: Option<ReleaseFn>) {
        if bytes.is_empty() {
            if let Some(f) = release {
                f();
            }
            return;
        }
        self.write_off += bytes.len() as u64;
        let base = self.write_off - bytes.len() as u64;
        self.segs.push_back(Segment {
            base,
            kind: SegKind::Spliced { bytes, release },
        });
    }

    /// The contiguous readable run starting at absolute offset `off`, or
    /// `None` when `off` is at or past the write cursor.
    pub fn run_at(&self, off: u64) -> Option<&[u8]> {
        if off < self.read_off || off >= self.write_off {
            return None;
        }
        for seg in &self.segs {
            if off < seg.end() && off >= seg.base {
                let start = (off - seg.base) as usize;
                let data = match &seg.kind {
                    SegKind::Owned { chunk, used } => &chunk.bytes()[..*used],
                    SegKind::Spliced { bytes, .. } => &bytes[..],
                };
                return Some(&data[start..]);
            }
        }
        None
    }

    /// The readable run at the read cursor.
    pub fn first_run(&self) -> Option<&[u8]> {
        self.run_at(self.read_off)
    }

    /// Walk the readable runs from absolute offset `off` to the write
    /// cursor, one contiguous slice per segment.
    pub fn runs_from<'a>(&'a self, off: u64) -> impl Iterator<Item = &'a [u8]> + 'a {
        let mut next = off.max(self.read_off);
        std::iter::from_fn(move || {
            let run = self.run_at(next)?;
            next += run.len() as u64;
            Some(run)
        })
    }

    /// Copy `len` bytes starting at absolute offset `off` into a vector.
    ///
    /// Panics if the range is not fully readable.
    pub fn copy_range(&self, mut off: u64, len: usize) -> Vec<u8> {
        assert!(off >= self.read_off && off + len as u64 <= self.write_off);
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let run = self.run_at(off).expect("range readable");
            let n = run.len().min(len - out.len());
            out.extend_from_slice(&run[..n]);
            off += n as u64;
        }
        out
    }

    /// Advance the read cursor by `n` bytes, releasing passed segments.
    pub fn reduce(&mut self, n: u64) {
        self.consume_to(self.read_off + n);
    }

    /// Advance the read cursor to absolute offset `off`.
    pub fn consume_to(&mut self, off: u64) {
        assert!(off >= self.read_off && off <= self.write_off, "consume out of range");
        self.read_off = off;
        while let Some(front) = self.segs.front() {
            if front.end() > self.read_off {
                break;
            }
            let mut seg = self.segs.pop_front().expect("front exists");
            if let SegKind::Owned { chunk, .. } = &mut seg.kind {
                let chunk = mem::replace(chunk, Chunk::empty());
                self.pool.borrow_mut().release(chunk);
            }
            // Dropping the segment runs any splice release callback.
        }
    }
}

impl fmt::Write for SegBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPool;
    use std::fmt::Write as _;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn buf() -> SegBuf {
        SegBuf::new(ChunkPool::handle())
    }

    fn collect(buf: &SegBuf) -> Vec<u8> {
        buf.copy_range(buf.read_pos(), buf.readable() as usize)
    }

    #[test]
    fn append_and_walk_runs() {
        let mut b = buf();
        b.append(b"hello ");
        b.append(b"world");
        assert_eq!(b.readable(), 11);
        assert_eq!(collect(&b), b"hello world");
    }

    #[test]
    fn append_spans_chunks() {
        let mut b = buf();
        let big = vec![0xabu8; CHUNK_CAPACITY + 100];
        b.append(&big);
        assert_eq!(b.readable() as usize, big.len());
        assert_eq!(collect(&b), big);
        // Two owned segments: the first run ends at the chunk boundary.
        assert_eq!(b.first_run().unwrap().len(), CHUNK_CAPACITY);
    }

    #[test]
    fn demand_commit_roundtrip() {
        let mut b = buf();
        let dst = b.demand(16);
        assert!(dst.len() >= 16);
        dst[..3].copy_from_slice(b"abc");
        b.commit(3);
        assert_eq!(collect(&b), b"abc");
    }

    #[test]
    fn demand_skips_short_tail() {
        let mut b = buf();
        b.append(&vec![1u8; CHUNK_CAPACITY - 8]);
        let dst = b.demand(64);
        assert!(dst.len() >= 64);
        b.commit(64);
        assert_eq!(b.readable() as usize, CHUNK_CAPACITY - 8 + 64);
    }

    #[test]
    fn splice_is_zero_copy_and_released_in_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let mut b = buf();
        b.append(b"VALUE k 0 3\r\n");

        let o = Arc::clone(&order);
        b.splice(
            Bytes::from_static(b"abc"),
            Some(Box::new(move || {
                assert_eq!(o.fetch_add(1, Ordering::SeqCst), 0);
            })),
        );
        b.append(b"\r\n");
        let o = Arc::clone(&order);
        b.splice(
            Bytes::from_static(b"de"),
            Some(Box::new(move || {
                assert_eq!(o.fetch_add(1, Ordering::SeqCst), 1);
            })),
        );

        assert_eq!(collect(&b), b"VALUE k 0 3\r\nabc\r\nde");

        // Stopping mid-splice releases nothing.
        b.reduce(13 + 1);
        assert_eq!(order.load(Ordering::SeqCst), 0);
        // Passing the end of the first splice releases it.
        b.reduce(2);
        assert_eq!(order.load(Ordering::SeqCst), 1);
        // Teardown releases the rest exactly once.
        drop(b);
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn runs_walk_every_segment_once() {
        let mut b = buf();
        b.append(b"head ");
        b.splice(Bytes::from_static(b"middle"), None);
        b.append(b" tail");
        let runs: Vec<&[u8]> = b.runs_from(b.read_pos()).collect();
        assert_eq!(runs, vec![&b"head "[..], b"middle", b" tail"]);
        let total: usize = runs.iter().map(|r| r.len()).sum();
        assert_eq!(total as u64, b.readable());
    }

    #[test]
    fn consume_to_releases_prefix_only() {
        let mut b = buf();
        b.append(b"first line\nsecond");
        let mark = b.read_pos() + 11;
        b.consume_to(mark);
        assert_eq!(b.read_pos(), mark);
        assert_eq!(collect(&b), b"second");
    }

    #[test]
    fn empty_splice_releases_immediately() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut b = buf();
        let r = Arc::clone(&released);
        b.splice(Bytes::new(), Some(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn reduce_recycles_chunks() {
        let pool = ChunkPool::handle();
        let mut b = SegBuf::new(Rc::clone(&pool));
        b.append(&vec![7u8; CHUNK_CAPACITY * 2]);
        b.reduce(CHUNK_CAPACITY as u64 * 2);
        assert!(b.is_empty());
        assert_eq!(pool.borrow().free_chunks(), 2);
        // Offsets keep growing after a full drain.
        b.append(b"next");
        assert_eq!(collect(&b), b"next");
    }

    #[test]
    fn write_fmt_formats_into_chain() {
        let mut b = buf();
        write!(b, "VALUE {} {} {}\r\n", "key", 7, 5).unwrap();
        assert_eq!(collect(&b), b"VALUE key 7 5\r\n");
    }
}
