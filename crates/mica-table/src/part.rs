//! One partition: entry storage, bucket chains, incremental rehash and
//! the CLOCK sweep. Everything here runs under the partition's engine
//! discipline; no interior synchronization.

use bytes::Bytes;
use tracing::debug;

use crate::bucket::BucketRegion;
use crate::entry::{EntrySlab, EntrySlot, NIL};
use crate::table::TableError;
use crate::time::is_expired;

/// Source buckets split per stride step.
pub(crate) const STRIDE_WIDTH: u32 = 64;

/// Fullness threshold: stride when `live > nbuckets * GROWTH_FACTOR`.
/// The source lineage disagrees between 2 and 4; the conservative default
/// is kept as a named tunable.
pub(crate) const GROWTH_FACTOR: u32 = 2;

/// How many CLOCK steps a failed slot allocation may spend reclaiming
/// cold entries inline before giving up.
const ALLOC_EVICT_LIMIT: u32 = 32;

pub(crate) struct PartInner {
    index: usize,
    nparts: usize,
    part_bits: u32,

    buckets: BucketRegion,
    /// Current bucket array length (power of two).
    nbuckets: u32,
    /// Buckets populated so far; trails `nbuckets` while a stride is in
    /// progress.
    used: u32,
    mask: u32,
    nbuckets_max: u32,

    slab: EntrySlab,
    free_head: u32,
    /// Low-water mark of never-used slots.
    void_next: u32,

    nentries: u32,
    nentries_free: u32,
    nentries_void: u32,
    nentries_max: u32,

    clock_hand: u32,

    volume: usize,
    volume_max: usize,

    stamp: u64,
}

impl PartInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        nparts: usize,
        part_bits: u32,
        nentries_max: u32,
        nbuckets_max: u32,
        nentries_increment: u32,
        nbuckets_initial: u32,
        volume_max: usize,
    ) -> Result<Self, TableError> {
        let mut buckets = BucketRegion::reserve(nbuckets_max as usize)?;
        buckets.commit_to(nbuckets_initial as usize)?;

        let mut slab = EntrySlab::new(nentries_increment);
        slab.commit_chunk();
        let nentries = slab.len();

        debug!(
            part = index,
            nentries_max, nbuckets_max, nbuckets_initial, volume_max, "partition prepared"
        );

        Ok(Self {
            index,
            nparts,
            part_bits,
            buckets,
            nbuckets: nbuckets_initial,
            used: nbuckets_initial,
            mask: nbuckets_initial - 1,
            nbuckets_max,
            slab,
            free_head: NIL,
            void_next: 0,
            nentries,
            nentries_free: 0,
            nentries_void: nentries,
            nentries_max,
            clock_hand: 0,
            volume: 0,
            volume_max,
            stamp: index as u64,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn volume_max(&self) -> usize {
        self.volume_max
    }

    pub fn nbuckets(&self) -> u32 {
        self.nbuckets
    }

    pub fn live_entries(&self) -> u32 {
        self.nentries - self.nentries_free - self.nentries_void
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += self.nparts as u64;
        self.stamp
    }

    /// Bucket index for a key hash. The partition consumed the low
    /// `part_bits`; buckets hash on the remaining bits. Mid-stride, slots
    /// past the split point fall back to the previous mask.
    pub fn bucket_index(&self, hash: u32) -> u32 {
        let mut i = (hash >> self.part_bits) & self.mask;
        if i >= self.used {
            i &= self.mask >> 1;
        }
        i
    }

    pub fn check_size(&self) -> bool {
        self.live_entries() > self.nbuckets.saturating_mul(GROWTH_FACTOR)
            && self.nbuckets < self.nbuckets_max
    }

    pub fn check_volume(&self, reserve: usize) -> bool {
        self.volume + reserve > self.volume_max
    }

    /// Find a live entry without touching its reference count. Expired
    /// entries encountered on the way are reclaimed in place.
    pub fn probe(&mut self, key: &[u8], hash: u32, now: u32) -> Option<u32> {
        let b = self.bucket_index(hash) as usize;
        let mut idx = self.buckets.get(b);
        while idx != NIL {
            let slot = self.slab.get(idx);
            let next = slot.next;
            if slot.hash == hash && &*slot.key == key {
                if is_expired(slot.exptime, now) {
                    self.unlink(idx);
                    self.reclaim_if_unreferenced(idx);
                    return None;
                }
                return Some(idx);
            }
            idx = next;
        }
        None
    }

    /// Find an entry, take a reference on it and touch its CLOCK
    /// bit.
    pub fn lookup(&mut self, key: &[u8], hash: u32, now: u32) -> Option<u32> {
        let idx = self.probe(key, hash, now)?;
        let slot = self.slab.get_mut(idx);
        slot.refs += 1;
        slot.clock = true;
        Some(idx)
    }

    /// Drop a reference taken by `lookup`.
    pub fn finish(&mut self, idx: u32) {
        let slot = self.slab.get_mut(idx);
        assert!(slot.refs > 0, "entry reference underflow");
        slot.refs -= 1;
        self.reclaim_if_unreferenced(idx);
    }

    pub(crate) fn reclaim_if_unreferenced(&mut self, idx: u32) {
        let slot = self.slab.get(idx);
        if !slot.linked && slot.refs == 0 {
            self.free_slot(idx);
        }
    }

    /// Allocate and fill a fresh, uninserted
    /// slot. Returns `None` when the partition is out of entry slots even
    /// after an inline CLOCK sweep.
    pub fn create(
        &mut self,
        key: &[u8],
        hash: u32,
        flags: u32,
        exptime: u32,
        value: Bytes,
    ) -> Option<u32> {
        let idx = match self.alloc_slot() {
            Some(idx) => idx,
            None => {
                let mut attempts = 0;
                while attempts < ALLOC_EVICT_LIMIT {
                    if self.evict_one() {
                        break;
                    }
                    attempts += 1;
                }
                self.alloc_slot()?
            }
        };
        let slot = self.slab.get_mut(idx);
        slot.hash = hash;
        slot.key = key.to_vec().into_boxed_slice();
        slot.value = value;
        slot.flags = flags;
        slot.exptime = exptime;
        slot.refs = 0;
        slot.clock = true;
        slot.linked = false;
        slot.next = NIL;
        slot.stamp = 0;
        Some(idx)
    }

    /// Abandon a created, uninserted slot.
    pub fn cancel(&mut self, idx: u32) {
        debug_assert!(!self.slab.get(idx).linked);
        self.free_slot(idx);
    }

    /// Link a created slot into its bucket and
    /// assign its CAS stamp.
    pub fn insert(&mut self, idx: u32) {
        let stamp = self.next_stamp();
        let hash = self.slab.get(idx).hash;
        let b = self.bucket_index(hash) as usize;
        let head = self.buckets.get(b);
        let slot = self.slab.get_mut(idx);
        debug_assert!(!slot.linked);
        slot.next = head;
        slot.linked = true;
        slot.stamp = stamp;
        self.buckets.set(b, idx);
        self.volume += self.slab.get(idx).charge();
    }

    /// Replace the payload of a linked entry in place, keeping its slot
    /// and bucket position. Used by append/prepend, cas and the counters.
    pub fn update_value(
        &mut self,
        idx: u32,
        value: Bytes,
        flags: Option<u32>,
        exptime: Option<u32>,
    ) {
        let stamp = self.next_stamp();
        let slot = self.slab.get_mut(idx);
        debug_assert!(slot.linked);
        let old_charge = slot.charge();
        slot.value = value;
        if let Some(flags) = flags {
            slot.flags = flags;
        }
        if let Some(exptime) = exptime {
            slot.exptime = exptime;
        }
        slot.stamp = stamp;
        let new_charge = slot.charge();
        self.volume = self.volume + new_charge - old_charge;
    }

    pub fn entry(&self, idx: u32) -> (&[u8], &Bytes, u32, u64) {
        let slot = self.slab.get(idx);
        (&slot.key, &slot.value, slot.flags, slot.stamp)
    }

    pub fn entry_stamp(&self, idx: u32) -> u64 {
        self.slab.get(idx).stamp
    }

    pub fn entry_value(&self, idx: u32) -> Bytes {
        self.slab.get(idx).value.clone()
    }

    pub fn entry_flags(&self, idx: u32) -> u32 {
        self.slab.get(idx).flags
    }

    /// Unlink an entry from its bucket chain. The slot stays allocated
    /// while references remain.
    pub fn unlink(&mut self, idx: u32) {
        let (hash, charge) = {
            let slot = self.slab.get(idx);
            debug_assert!(slot.linked);
            (slot.hash, slot.charge())
        };
        let b = self.bucket_index(hash) as usize;
        let head = self.buckets.get(b);
        if head == idx {
            self.buckets.set(b, self.slab.get(idx).next);
        } else {
            let mut cur = head;
            while cur != NIL {
                let next = self.slab.get(cur).next;
                if next == idx {
                    let after = self.slab.get(idx).next;
                    self.slab.get_mut(cur).next = after;
                    break;
                }
                cur = next;
            }
            assert!(cur != NIL, "entry missing from its bucket chain");
        }
        let slot = self.slab.get_mut(idx);
        slot.linked = false;
        slot.next = NIL;
        self.volume -= charge;
    }

    /// Unlink an entry by key. Returns whether a live
    /// entry was removed.
    pub fn delete(&mut self, key: &[u8], hash: u32, now: u32) -> bool {
        match self.probe(key, hash, now) {
            Some(idx) => {
                self.unlink(idx);
                self.reclaim_if_unreferenced(idx);
                true
            }
            None => false,
        }
    }

    /// Split up to [`STRIDE_WIDTH`] source
    /// buckets, doubling the array first when the previous stride has
    /// completed. Returns whether more striding work remains.
    pub fn stride(&mut self) -> Result<bool, TableError> {
        if self.used == self.nbuckets {
            if self.nbuckets >= self.nbuckets_max {
                return Ok(false);
            }
            let grown = self.nbuckets * 2;
            self.buckets.commit_to(grown as usize)?;
            self.nbuckets = grown;
            self.mask = grown - 1;
            debug!(part = self.index, nbuckets = grown, "bucket array doubled");
        }

        let half = self.nbuckets / 2;
        let batch = STRIDE_WIDTH.min(self.nbuckets - self.used);
        for _ in 0..batch {
            let target = self.used;
            let source = target - half;

            let mut s_chain = NIL;
            let mut t_chain = NIL;
            let mut cur = self.buckets.get(source as usize);
            while cur != NIL {
                let (next, hash) = {
                    let slot = self.slab.get(cur);
                    (slot.next, slot.hash)
                };
                let bi = (hash >> self.part_bits) & self.mask;
                if bi == source {
                    self.slab.get_mut(cur).next = s_chain;
                    s_chain = cur;
                } else {
                    debug_assert_eq!(bi, target);
                    self.slab.get_mut(cur).next = t_chain;
                    t_chain = cur;
                }
                cur = next;
            }
            self.buckets.set(source as usize, s_chain);
            self.buckets.set(target as usize, t_chain);
            self.used += 1;
        }

        Ok(self.used < self.nbuckets || self.check_size())
    }

    /// Advance the CLOCK hand and recycle one
    /// cold, unreferenced entry. Returns whether anything was reclaimed.
    pub fn evict_one(&mut self) -> bool {
        let span = self.void_next;
        if span == 0 {
            return false;
        }
        let mut scanned: u64 = 0;
        // Two full sweeps: the first may only clear reference bits.
        while scanned < span as u64 * 2 {
            let i = self.clock_hand % span;
            self.clock_hand = (i + 1) % span;
            scanned += 1;

            let slot = self.slab.get_mut(i);
            if !slot.linked {
                continue;
            }
            if slot.clock {
                slot.clock = false;
                continue;
            }
            if slot.refs > 0 {
                continue;
            }
            self.unlink(i);
            self.free_slot(i);
            return true;
        }
        false
    }

    /// Make every current entry stale at `when`.
    pub fn flush(&mut self, when: u32) {
        let when = when.max(1);
        for i in 0..self.void_next {
            let slot = self.slab.get_mut(i);
            if slot.linked && (slot.exptime == 0 || slot.exptime > when) {
                slot.exptime = when;
            }
        }
    }

    fn alloc_slot(&mut self) -> Option<u32> {
        if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slab.get(idx).next;
            self.nentries_free -= 1;
            return Some(idx);
        }
        if self.void_next < self.nentries {
            let idx = self.void_next;
            self.void_next += 1;
            self.nentries_void -= 1;
            return Some(idx);
        }
        if self.expand() {
            return self.alloc_slot();
        }
        None
    }

    fn expand(&mut self) -> bool {
        if self.nentries >= self.nentries_max {
            return false;
        }
        self.slab.commit_chunk();
        let added = self.slab.len() - self.nentries;
        self.nentries = self.slab.len();
        self.nentries_void += added;
        debug!(part = self.index, nentries = self.nentries, "entry slab expanded");
        true
    }

    fn free_slot(&mut self, idx: u32) {
        let head = self.free_head;
        let slot = self.slab.get_mut(idx);
        debug_assert!(!slot.linked && slot.refs == 0);
        slot.key = Box::new([]);
        slot.value = Bytes::new();
        slot.next = head;
        self.free_head = idx;
        self.nentries_free += 1;
    }

    /// Walk a bucket chain, for invariant checks in tests.
    #[cfg(test)]
    pub fn chain(&self, bucket: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = self.buckets.get(bucket as usize);
        while cur != NIL {
            out.push(cur);
            cur = self.slab.get(cur).next;
        }
        out
    }

    #[cfg(test)]
    pub fn used_buckets(&self) -> u32 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a;

    fn small_part() -> PartInner {
        // 4096-entry chunks, tiny bucket array to force striding early.
        PartInner::new(0, 1, 0, 16384, 4096, 4096, 8, usize::MAX).unwrap()
    }

    fn put(part: &mut PartInner, key: &[u8], value: &[u8]) -> u32 {
        let hash = fnv1a(key);
        let idx = part
            .create(key, hash, 0, 0, Bytes::copy_from_slice(value))
            .expect("slot available");
        part.insert(idx);
        idx
    }

    #[test]
    fn insert_lookup_delete_roundtrip() {
        let mut part = small_part();
        put(&mut part, b"alpha", b"one");

        let hash = fnv1a(b"alpha");
        let idx = part.lookup(b"alpha", hash, 0).expect("hit");
        let (key, value, flags, stamp) = part.entry(idx);
        assert_eq!(key, b"alpha");
        assert_eq!(&value[..], b"one");
        assert_eq!(flags, 0);
        assert!(stamp > 0);
        part.finish(idx);

        assert!(part.delete(b"alpha", hash, 0));
        assert!(!part.delete(b"alpha", hash, 0));
        assert_eq!(part.live_entries(), 0);
    }

    #[test]
    fn volume_tracks_inserts_and_removals() {
        let mut part = small_part();
        assert_eq!(part.volume(), 0);
        let idx = put(&mut part, b"k", b"0123456789");
        let charge = part.slab.get(idx).charge();
        assert_eq!(part.volume(), charge);
        part.delete(b"k", fnv1a(b"k"), 0);
        assert_eq!(part.volume(), 0);
    }

    #[test]
    fn referenced_entries_survive_delete_until_finished() {
        let mut part = small_part();
        put(&mut part, b"held", b"payload");
        let hash = fnv1a(b"held");

        let idx = part.lookup(b"held", hash, 0).unwrap();
        assert!(part.delete(b"held", hash, 0));
        // Slot still allocated: the reference pins it.
        assert_eq!(part.nentries_free, 0);
        part.finish(idx);
        assert_eq!(part.nentries_free, 1);
    }

    #[test]
    fn stamps_are_monotonic_per_partition() {
        let mut part = small_part();
        put(&mut part, b"a", b"1");
        put(&mut part, b"b", b"2");
        let ia = part.probe(b"a", fnv1a(b"a"), 0).unwrap();
        let sa = part.entry_stamp(ia);
        let ib = part.probe(b"b", fnv1a(b"b"), 0).unwrap();
        let sb = part.entry_stamp(ib);
        assert!(sb > sa);
    }

    #[test]
    fn expired_entries_are_reclaimed_on_probe() {
        let mut part = small_part();
        let hash = fnv1a(b"ttl");
        let idx = part
            .create(b"ttl", hash, 0, 100, Bytes::from_static(b"v"))
            .unwrap();
        part.insert(idx);

        assert!(part.probe(b"ttl", hash, 99).is_some());
        assert!(part.probe(b"ttl", hash, 100).is_none());
        assert_eq!(part.live_entries(), 0);
    }

    #[test]
    fn flush_marks_everything_stale() {
        let mut part = small_part();
        put(&mut part, b"one", b"1");
        put(&mut part, b"two", b"2");
        part.flush(50);
        assert!(part.probe(b"one", fnv1a(b"one"), 50).is_none());
        assert!(part.probe(b"two", fnv1a(b"two"), 50).is_none());
    }

    #[test]
    fn striding_preserves_the_bucket_invariant() {
        let mut part = small_part();
        // Overfill the 8-bucket array: 8 * GROWTH_FACTOR < 64 entries.
        for i in 0..64u32 {
            let key = format!("key-{i}");
            put(&mut part, key.as_bytes(), b"x");
        }
        assert!(part.check_size());

        let mut rounds = 0;
        while part.stride().unwrap() {
            rounds += 1;
            assert!(rounds < 10_000, "stride failed to converge");
        }
        assert_eq!(part.used_buckets(), part.nbuckets());

        // Every entry is findable and sits in the bucket its hash maps to.
        for i in 0..64u32 {
            let key = format!("key-{i}");
            let hash = fnv1a(key.as_bytes());
            let idx = part.probe(key.as_bytes(), hash, 0).expect("entry survived stride");
            let chain = part.chain(part.bucket_index(hash));
            assert!(chain.contains(&idx));
        }
    }

    #[test]
    fn clock_eviction_prefers_cold_entries() {
        let mut part = small_part();
        for i in 0..8u32 {
            let key = format!("e{i}");
            put(&mut part, key.as_bytes(), b"v");
        }
        // The first reclaim clears all the fresh reference bits on its
        // first sweep and takes the slot under the hand.
        assert!(part.evict_one());
        assert!(part.probe(b"e0", fnv1a(b"e0"), 0).is_none());

        // Touch e1: its bit now protects it, so the hand passes over it
        // and takes the cold neighbor instead.
        let hot = part.lookup(b"e1", fnv1a(b"e1"), 0).unwrap();
        part.finish(hot);
        assert!(part.evict_one());
        assert!(part.probe(b"e1", fnv1a(b"e1"), 0).is_some());
        assert!(part.probe(b"e2", fnv1a(b"e2"), 0).is_none());
        assert_eq!(part.live_entries(), 6);
    }

    #[test]
    fn referenced_entries_are_never_evicted() {
        let mut part = small_part();
        put(&mut part, b"pin", b"v");
        let idx = part.lookup(b"pin", fnv1a(b"pin"), 0).unwrap();
        // Repeated sweeps cannot reclaim the referenced entry.
        assert!(!part.evict_one());
        assert!(!part.evict_one());
        part.finish(idx);
        assert!(part.evict_one());
    }

    #[test]
    fn cancel_returns_slot_to_free_list() {
        let mut part = small_part();
        let idx = part
            .create(b"tmp", fnv1a(b"tmp"), 0, 0, Bytes::from_static(b"v"))
            .unwrap();
        part.cancel(idx);
        assert_eq!(part.nentries_free, 1);
        assert_eq!(part.live_entries(), 0);
    }
}
