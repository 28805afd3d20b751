//! The table coordinator: sizes and owns the partitions and routes keys
//! to them.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::bucket::page_size;
use crate::engine::{EngineMode, Partition};
use crate::entry::EntrySlot;
use crate::part::PartInner;

/// Eviction keeps this much headroom below the volume cap, split across
/// partitions.
const VOLUME_RESERVE: usize = 64 * 1024;

/// Base entry-slab growth increment, scaled up for low partition counts.
const ENTRIES_INCREMENT: u32 = 4 * 1024;

/// Liberal floor for the combined key+value size of an average entry,
/// used to bound the worst-case slot count from the configured volume.
const ENTRY_FLOOR: usize = 20;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("address space mapping failed: {0}")]
    Map(nix::Error),
    #[error("bucket region reservation exhausted")]
    RegionExhausted,
}

#[derive(Clone, Debug)]
pub struct TableConfig {
    /// Total cache bytes across all partitions.
    pub volume: usize,
    /// Desired partition count; rounded down to a power of two.
    pub nparts: usize,
    pub mode: EngineMode,
    /// Runtime count, for delegate homing.
    pub ncores: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            volume: 64 * 1024 * 1024,
            nparts: 8,
            mode: EngineMode::Combiner,
            ncores: 1,
        }
    }
}

/// The set of partitions.
pub struct Table {
    parts: Vec<Arc<Partition>>,
    part_bits: u32,
    part_mask: u32,
}

impl Table {
    pub fn new(config: &TableConfig) -> Result<Self, TableError> {
        let nparts = floor_pow2(config.nparts.clamp(1, 1 << 14));
        let part_bits = nparts.trailing_zeros();
        let part_mask = nparts as u32 - 1;

        let volume_max = (config.volume / nparts).max(page_size());

        let increment = ENTRIES_INCREMENT
            * match nparts {
                1 => 4,
                2 => 2,
                _ => 1,
            };
        let raw_max = (volume_max / (std::mem::size_of::<EntrySlot>() + ENTRY_FLOOR)) as u32;
        let nentries_max = (raw_max / increment).max(1) * increment;
        let nbuckets_max = floor_pow2(nentries_max as usize) as u32;
        let nbuckets_initial = floor_pow2((increment / 2) as usize).min(nbuckets_max as usize) as u32;

        info!(
            nparts,
            part_bits,
            volume_max,
            nentries_max,
            nbuckets_max,
            mode = %config.mode,
            "cache table sized"
        );

        let mut parts = Vec::with_capacity(nparts);
        for index in 0..nparts {
            let inner = PartInner::new(
                index,
                nparts,
                part_bits,
                nentries_max,
                nbuckets_max,
                increment,
                nbuckets_initial,
                volume_max,
            )?;
            parts.push(Partition::new(
                inner,
                config.mode,
                config.ncores,
                VOLUME_RESERVE / nparts,
            ));
        }

        Ok(Self { parts, part_bits, part_mask })
    }

    pub fn nparts(&self) -> usize {
        self.parts.len()
    }

    pub fn part_bits(&self) -> u32 {
        self.part_bits
    }

    pub fn part_mask(&self) -> u32 {
        self.part_mask
    }

    /// The partition owning a key hash: `hash & part_mask`.
    pub fn partition_of(&self, hash: u32) -> &Arc<Partition> {
        &self.parts[(hash & self.part_mask) as usize]
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.parts
    }
}

fn floor_pow2(n: usize) -> usize {
    debug_assert!(n > 0);
    if n.is_power_of_two() {
        n
    } else {
        n.next_power_of_two() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a;

    #[test]
    fn partition_count_rounds_down_to_pow2() {
        for (requested, expect) in [(1, 1), (2, 2), (3, 2), (7, 4), (8, 8), (9, 8)] {
            let table = Table::new(&TableConfig {
                volume: 4 * 1024 * 1024,
                nparts: requested,
                ..Default::default()
            })
            .unwrap();
            assert_eq!(table.nparts(), expect, "requested {requested}");
        }
    }

    #[test]
    fn keys_route_by_masked_hash() {
        let table = Table::new(&TableConfig {
            volume: 4 * 1024 * 1024,
            nparts: 4,
            ..Default::default()
        })
        .unwrap();
        for key in [&b"alpha"[..], b"beta", b"gamma", b"x"] {
            let hash = fnv1a(key);
            let part = table.partition_of(hash);
            assert_eq!(part.index(), (hash & table.part_mask()) as usize);
        }
    }

    #[test]
    fn delegate_mode_homes_partitions_across_cores() {
        let table = Table::new(&TableConfig {
            volume: 4 * 1024 * 1024,
            nparts: 4,
            mode: EngineMode::Delegate,
            ncores: 2,
        })
        .unwrap();
        let homes: Vec<_> = table.partitions().iter().map(|p| p.home().unwrap()).collect();
        assert_eq!(homes, vec![0, 1, 0, 1]);
    }

    #[test]
    fn floor_pow2_rounds_down() {
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(2), 2);
        assert_eq!(floor_pow2(3), 2);
        assert_eq!(floor_pow2(4096), 4096);
        assert_eq!(floor_pow2(5000), 4096);
    }
}
