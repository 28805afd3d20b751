//! The bucket array: `u32` chain heads in a reserved address region.
//!
//! The worst-case array is reserved `PROT_NONE` up front and committed
//! read-write as the array doubles, so growth never moves the array and
//! never invalidates indices held elsewhere.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

use crate::entry::NIL;
use crate::table::TableError;

const SLOT_BYTES: usize = std::mem::size_of::<u32>();

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

fn round_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

pub(crate) struct BucketRegion {
    base: NonNull<libc::c_void>,
    reserved_bytes: usize,
    committed_slots: usize,
}

// SAFETY: the region is plain memory; access is serialized by the owning
// partition's engine.
unsafe impl Send for BucketRegion {}

impl BucketRegion {
    /// Reserve address space for `max_slots` chain heads without
    /// committing any of it.
    pub fn reserve(max_slots: usize) -> Result<Self, TableError> {
        let bytes = round_up(max_slots.max(1) * SLOT_BYTES, page_size());
        let length = NonZeroUsize::new(bytes).expect("nonzero reservation");

        let mut flags = MapFlags::MAP_PRIVATE;
        #[cfg(target_os = "linux")]
        {
            flags |= MapFlags::MAP_NORESERVE;
        }

        // SAFETY: anonymous mapping with no fixed address.
        let base = unsafe { mmap_anonymous(None, length, ProtFlags::PROT_NONE, flags) }
            .map_err(TableError::Map)?;
        Ok(Self {
            base: base.cast(),
            reserved_bytes: bytes,
            committed_slots: 0,
        })
    }

    pub fn committed(&self) -> usize {
        self.committed_slots
    }

    fn slot_ptr(&self, index: usize) -> *mut u32 {
        debug_assert!(index < self.committed_slots);
        // SAFETY: index is within the committed prefix of the region.
        unsafe { self.base.cast::<u32>().as_ptr().add(index) }
    }

    /// Commit the region up to `slots` chain heads, initializing the new
    /// ones to the empty-chain sentinel.
    pub fn commit_to(&mut self, slots: usize) -> Result<(), TableError> {
        assert!(slots >= self.committed_slots);
        let old_bytes = round_up(self.committed_slots * SLOT_BYTES, page_size());
        let new_bytes = round_up(slots * SLOT_BYTES, page_size());
        if new_bytes > self.reserved_bytes {
            return Err(TableError::RegionExhausted);
        }
        if new_bytes > old_bytes {
            // SAFETY: the range lies inside our own reservation.
            unsafe {
                let addr = NonNull::new_unchecked(self.base.as_ptr().add(old_bytes));
                mprotect(
                    addr,
                    new_bytes - old_bytes,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                )
                .map_err(TableError::Map)?;
            }
        }
        let old_slots = self.committed_slots;
        self.committed_slots = slots;
        for i in old_slots..slots {
            // SAFETY: just committed.
            unsafe { *self.slot_ptr(i) = NIL };
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> u32 {
        // SAFETY: slot_ptr checks the committed bound.
        unsafe { *self.slot_ptr(index) }
    }

    pub fn set(&mut self, index: usize, value: u32) {
        // SAFETY: slot_ptr checks the committed bound.
        unsafe { *self.slot_ptr(index) = value };
    }
}

impl Drop for BucketRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping our own reservation.
        let _ = unsafe { munmap(self.base, self.reserved_bytes) };
    }
}
