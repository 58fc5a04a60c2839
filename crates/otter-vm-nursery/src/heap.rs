//! GC heap: the nursery and its remembered set
//!
//! `GcHeap` is the per-runtime collector instance. It is created once at VM
//! start, shared between mutator threads behind an `Arc`, and passed to every
//! allocation and collection entry point.

use std::sync::Arc;

use crate::address::AddressRange;
use crate::barrier::{CardTableRemset, RememberedSet};
use crate::card_table::CardTable;
use crate::config::NurseryConfig;
use crate::error::{NurseryError, Result};
use crate::nursery::{FragmentBuild, Nursery};
use crate::safepoint::WorldStopped;
use crate::scan::{OldGeneration, ScanOps};
use crate::stats::{AllocStats, CardScanStats};

/// Heap statistics snapshot
#[derive(Debug, Default, Clone)]
pub struct HeapStats {
    /// Nursery allocation counters
    pub alloc: AllocStats,
    /// Remembered-set scan counters
    pub card_scan: CardScanStats,
    /// Fragment rebuilds so far
    pub epoch: u64,
    /// Dirty cards right now
    pub dirty_cards: usize,
}

/// Nursery allocator and card-table remembered set of one runtime.
pub struct GcHeap {
    config: NurseryConfig,
    nursery: Nursery,
    remset: Arc<CardTableRemset>,
}

impl GcHeap {
    /// Create a heap with the default configuration. A direct card table
    /// covers `old_space` and the nursery.
    pub fn new(old_space: AddressRange) -> Result<Arc<Self>> {
        Self::with_config(NurseryConfig::default(), old_space)
    }

    /// Create a heap with a custom configuration
    pub fn with_config(config: NurseryConfig, old_space: AddressRange) -> Result<Arc<Self>> {
        let nursery = Nursery::new(&config)?;
        Self::assemble(config, nursery, old_space)
    }

    /// Create a heap whose nursery lives in memory reserved by the embedder.
    ///
    /// # Safety
    ///
    /// Same contract as [`Nursery::from_raw_parts`].
    pub unsafe fn with_nursery_memory(
        config: NurseryConfig,
        nursery: AddressRange,
        old_space: AddressRange,
    ) -> Result<Arc<Self>> {
        // SAFETY: forwarded to the caller
        let nursery = unsafe { Nursery::from_raw_parts(&config, nursery) }?;
        Self::assemble(config, nursery, old_space)
    }

    fn assemble(
        config: NurseryConfig,
        nursery: Nursery,
        old_space: AddressRange,
    ) -> Result<Arc<Self>> {
        let range = nursery.range();
        if !old_space.is_empty() && old_space.start < range.end && range.start < old_space.end {
            return Err(NurseryError::InvalidBounds {
                start: old_space.start,
                end: old_space.end,
            });
        }
        let covered = if old_space.is_empty() {
            range
        } else {
            old_space.union(&range)
        };
        let remset = CardTableRemset::new(&config, covered)?;
        remset.set_nursery_bounds(range.start, range.end);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc::nursery",
            nursery_start = format_args!("{:#x}", range.start),
            nursery_size = range.size(),
            card_size = config.card_size(),
            mode = ?config.card_table_mode,
            policy = ?config.clear_policy,
            "Created nursery heap"
        );

        Ok(Arc::new(Self {
            config,
            nursery,
            remset: Arc::new(remset),
        }))
    }

    /// Get config
    pub fn config(&self) -> &NurseryConfig {
        &self.config
    }

    /// The nursery region.
    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    /// Nursery bounds
    pub fn nursery_range(&self) -> AddressRange {
        self.nursery.range()
    }

    /// Check whether `addr` points into the nursery.
    #[inline]
    pub fn is_in_nursery(&self, addr: usize) -> bool {
        self.nursery.contains(addr)
    }

    /// Allocate `size` bytes from the shared nursery. `None` means a minor
    /// collection is needed.
    pub fn nursery_alloc(&self, size: usize) -> Option<*mut u8> {
        self.nursery.alloc(size).map(|p| p as *mut u8)
    }

    /// Allocate between `minimum` and `desired` bytes from the shared nursery.
    pub fn nursery_alloc_range(&self, desired: usize, minimum: usize) -> Option<(*mut u8, usize)> {
        self.nursery
            .alloc_range(desired, minimum)
            .map(|(p, size)| (p as *mut u8, size))
    }

    /// Check whether `size` bytes could be allocated right now.
    pub fn can_alloc_size(&self, size: usize) -> bool {
        self.nursery.can_alloc(size)
    }

    /// Write-barrier interface for generated code.
    pub fn remembered_set(&self) -> Arc<dyn RememberedSet> {
        self.remset.clone()
    }

    /// The card table behind the remembered set.
    pub fn card_table(&self) -> &dyn CardTable {
        self.remset.card_table()
    }

    /// Fragment rebuilds so far. Thread-local buffers from an older epoch are
    /// stale.
    pub fn epoch(&self) -> u64 {
        self.nursery.epoch()
    }

    /// Zero every unused fragment tail ahead of conservative pinning.
    pub fn prepare_for_pinning(&self, world: &WorldStopped) {
        self.nursery.prepare_for_pinning(world);
    }

    /// Zero unused fragment tails when allocation is responsible for
    /// clearing. Returns the bytes cleared.
    pub fn clear_nursery_fragments(&self, world: &WorldStopped) -> usize {
        self.nursery.clear_fragments(world)
    }

    /// Rebuild the nursery fragments around the sorted pinned objects.
    pub fn build_nursery_fragments(
        &self,
        world: &WorldStopped,
        pinned: &[usize],
        size_of: impl Fn(usize) -> usize,
    ) -> FragmentBuild {
        self.nursery.build_fragments(world, pinned, size_of)
    }

    /// Replay the remembered set over the old generation.
    pub fn finish_scan_remsets(
        &self,
        world: &WorldStopped,
        old: &dyn OldGeneration,
        ops: &mut dyn ScanOps,
    ) {
        self.remset.finish_scan_remsets(world, old, ops);
    }

    /// Clear old-generation cards before a full collection.
    pub fn prepare_for_major_collection(&self, world: &WorldStopped, old: &dyn OldGeneration) {
        self.remset.prepare_for_major_collection(world, old);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            alloc: self.nursery.fragments().stats(),
            card_scan: self.remset.stats(),
            epoch: self.epoch(),
            dirty_cards: self.card_table().dirty_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardTableMode;

    fn small_config() -> NurseryConfig {
        NurseryConfig {
            nursery_size: 64 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_heap_creation() {
        let heap = GcHeap::with_config(small_config(), AddressRange::new(0, 0)).unwrap();
        assert_eq!(heap.nursery_range().size(), 64 * 1024);
        assert!(heap.can_alloc_size(64 * 1024));
        assert!(!heap.can_alloc_size(64 * 1024 + 1));
        assert_eq!(heap.stats().dirty_cards, 0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = NurseryConfig {
            card_bits: 2,
            ..small_config()
        };
        assert!(matches!(
            GcHeap::with_config(config, AddressRange::new(0, 0)),
            Err(NurseryError::InvalidCardBits(2))
        ));
    }

    #[test]
    fn test_rejects_old_space_overlapping_nursery() {
        let mut memory = vec![0u64; 8 * 1024];
        let range = AddressRange::with_size(memory.as_mut_ptr() as usize, 64 * 1024);
        let old = AddressRange::with_size(range.start + 1024, 4096);
        // SAFETY: rejected before the memory is used
        let result = unsafe { GcHeap::with_nursery_memory(small_config(), range, old) };
        assert!(matches!(result, Err(NurseryError::InvalidBounds { .. })));
    }

    #[test]
    fn test_nursery_alloc() {
        let heap = GcHeap::with_config(small_config(), AddressRange::new(0, 0)).unwrap();
        let a = heap.nursery_alloc(100).unwrap();
        let b = heap.nursery_alloc(100).unwrap();
        assert!(heap.is_in_nursery(a as usize));
        assert_eq!(b as usize - a as usize, 104);

        let (tlab, size) = heap.nursery_alloc_range(8192, 512).unwrap();
        assert_eq!(size, 8192);
        assert_eq!(tlab as usize, b as usize + 104);
    }

    #[test]
    fn test_barrier_through_heap() {
        // nursery followed by 8 KiB of old space in one buffer
        let mut memory = vec![0usize; (64 + 8) * 1024 / 8];
        let base = memory.as_mut_ptr() as usize;
        let nursery = AddressRange::with_size(base, 64 * 1024);
        let old = AddressRange::with_size(nursery.end, 8 * 1024);
        // SAFETY: `memory` is zeroed and outlives the heap
        let heap = unsafe { GcHeap::with_nursery_memory(small_config(), nursery, old) }.unwrap();
        let young = heap.nursery_alloc(32).unwrap() as usize;
        assert_eq!(young, base);

        let remset = heap.remembered_set();
        let slot = old.start as *mut usize;
        // SAFETY: `slot` is the first word of the old space
        unsafe { remset.set_field(old.start, slot, young) };
        assert_eq!(memory[64 * 1024 / 8], young);
        assert!(heap.card_table().find_address(old.start));
        assert_eq!(heap.stats().dirty_cards, 1);
    }

    #[test]
    fn test_overlapping_heap() {
        let config = NurseryConfig {
            card_table_mode: CardTableMode::Overlapping { card_count_bits: 12 },
            ..small_config()
        };
        let heap = GcHeap::with_config(config, AddressRange::new(0, 0)).unwrap();
        assert!(heap.card_table().has_shadow());
    }

    #[test]
    fn test_epoch_tracks_builds() {
        let heap = GcHeap::with_config(small_config(), AddressRange::new(0, 0)).unwrap();
        let epoch = heap.epoch();
        // SAFETY: no other thread uses this heap
        let world = unsafe { WorldStopped::assume() };
        let report = heap.build_nursery_fragments(&world, &[], |_| 0);
        assert_eq!(report.fragment_bytes, 64 * 1024);
        assert_eq!(heap.epoch(), epoch + 1);
        assert_eq!(heap.stats().alloc.builds, 2);
    }
}
