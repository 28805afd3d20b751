//! Entry slots and the chunked entry slab.
//!
//! Entries are addressed by `u32` slot index; bucket chains and the free
//! list thread through the `next` field. The slab grows by committing
//! whole chunks of default-initialized slots, so slot addresses never
//! move and indices stay valid across growth.

use bytes::Bytes;

/// Maximum key length accepted by the protocol.
pub const KEY_LEN_MAX: usize = 250;

/// Chain terminator for bucket and free-list links.
pub(crate) const NIL: u32 = u32::MAX;

#[derive(Clone)]
pub(crate) struct EntrySlot {
    /// Bucket chain link while linked, free-list link while free.
    pub next: u32,
    /// Full key hash, kept to avoid rehashing on stride and unlink.
    pub hash: u32,
    /// References held by in-flight results. The slot is reclaimed only
    /// when unlinked and at zero.
    pub refs: u32,
    /// CLOCK reference bit.
    pub clock: bool,
    /// Whether the slot currently sits in a bucket chain.
    pub linked: bool,
    pub flags: u32,
    /// Absolute expiration deadline; zero means never.
    pub exptime: u32,
    pub stamp: u64,
    pub key: Box<[u8]>,
    pub value: Bytes,
}

impl Default for EntrySlot {
    fn default() -> Self {
        Self {
            next: NIL,
            hash: 0,
            refs: 0,
            clock: false,
            linked: false,
            flags: 0,
            exptime: 0,
            stamp: 0,
            key: Box::new([]),
            value: Bytes::new(),
        }
    }
}

impl EntrySlot {
    /// Bytes this entry accounts against the partition volume.
    pub fn charge(&self) -> usize {
        std::mem::size_of::<EntrySlot>() + self.key.len() + self.value.len()
    }
}

/// Index-addressed slab of entry slots, committed one chunk at a time.
pub(crate) struct EntrySlab {
    chunks: Vec<Box<[EntrySlot]>>,
    chunk_slots: u32,
}

impl EntrySlab {
    pub fn new(chunk_slots: u32) -> Self {
        assert!(chunk_slots > 0);
        Self {
            chunks: Vec::new(),
            chunk_slots,
        }
    }

    /// Total committed slots.
    pub fn len(&self) -> u32 {
        self.chunks.len() as u32 * self.chunk_slots
    }

    /// Commit one more chunk of default slots.
    pub fn commit_chunk(&mut self) {
        let chunk: Box<[EntrySlot]> = (0..self.chunk_slots)
            .map(|_| EntrySlot::default())
            .collect();
        self.chunks.push(chunk);
    }

    pub fn get(&self, index: u32) -> &EntrySlot {
        let chunk = (index / self.chunk_slots) as usize;
        let slot = (index % self.chunk_slots) as usize;
        &self.chunks[chunk][slot]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut EntrySlot {
        let chunk = (index / self.chunk_slots) as usize;
        let slot = (index % self.chunk_slots) as usize;
        &mut self.chunks[chunk][slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_grows_in_whole_chunks() {
        let mut slab = EntrySlab::new(16);
        assert_eq!(slab.len(), 0);
        slab.commit_chunk();
        assert_eq!(slab.len(), 16);
        slab.commit_chunk();
        assert_eq!(slab.len(), 32);

        slab.get_mut(17).stamp = 99;
        assert_eq!(slab.get(17).stamp, 99);
        assert_eq!(slab.get(16).stamp, 0);
    }

    #[test]
    fn charge_counts_key_and_value() {
        let mut slot = EntrySlot::default();
        let base = slot.charge();
        slot.key = b"abc".to_vec().into_boxed_slice();
        slot.value = Bytes::from_static(b"defg");
        assert_eq!(slot.charge(), base + 7);
    }
}
