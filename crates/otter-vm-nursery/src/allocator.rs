//! Thread-local allocation buffers carved from the nursery

use crate::address::{ALLOC_ALIGN, align_up};
use crate::heap::GcHeap;
use std::sync::Arc;

/// Per-thread bump allocator over a TLAB taken from the shared nursery
pub struct Allocator {
    /// Shared heap reference
    heap: Arc<GcHeap>,
    /// Next free byte in the TLAB
    next: usize,
    /// End of the TLAB
    end: usize,
    /// Heap epoch the TLAB was taken in
    epoch: u64,
}

impl Allocator {
    /// Create new allocator for a heap
    pub fn new(heap: Arc<GcHeap>) -> Self {
        let epoch = heap.epoch();
        Self {
            heap,
            next: 0,
            end: 0,
            epoch,
        }
    }

    /// Allocate memory (returns None if GC needed)
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        let size = align_up(size.max(1), ALLOC_ALIGN)?;

        // A rebuild hands our TLAB range out again
        let epoch = self.heap.epoch();
        if epoch != self.epoch {
            self.reset();
            self.epoch = epoch;
        }

        if self.remaining() >= size {
            let ptr = self.next;
            self.next += size;
            return Some(ptr as *mut u8);
        }

        let config = self.heap.config();
        if size > config.tlab_size || self.remaining() > config.max_nursery_waste {
            return self.heap.nursery_alloc(size);
        }

        let (tlab, got) = self
            .heap
            .nursery_alloc_range(config.tlab_size, size.max(config.tlab_min_size))?;
        let tlab = tlab as usize;
        self.next = tlab + size;
        self.end = tlab + got;

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "otter::gc::nursery",
            tlab = format_args!("{:#x}", tlab),
            size = got,
            "New TLAB"
        );

        Some(tlab as *mut u8)
    }

    /// Bytes left in the current TLAB
    pub fn remaining(&self) -> usize {
        self.end - self.next
    }

    /// Drop the current TLAB (after minor GC)
    pub fn reset(&mut self) {
        self.next = 0;
        self.end = 0;
    }

    /// Get heap reference
    pub fn heap(&self) -> &Arc<GcHeap> {
        &self.heap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressRange;
    use crate::config::NurseryConfig;
    use crate::safepoint::WorldStopped;

    fn heap() -> Arc<GcHeap> {
        let config = NurseryConfig {
            nursery_size: 64 * 1024,
            ..Default::default()
        };
        GcHeap::with_config(config, AddressRange::new(0, 0)).unwrap()
    }

    #[test]
    fn test_allocator_young() {
        let heap = heap();
        let base = heap.nursery_range().start;
        let mut alloc = Allocator::new(heap);

        let ptr1 = alloc.allocate(100).unwrap() as usize;
        let ptr2 = alloc.allocate(200).unwrap() as usize;

        assert_eq!(ptr1, base);
        assert_eq!(ptr2, base + 104);
        assert_eq!(alloc.remaining(), 8192 - 304);
    }

    #[test]
    fn test_allocator_reset() {
        let heap = heap();
        let base = heap.nursery_range().start;
        let mut alloc = Allocator::new(heap);

        alloc.allocate(100).unwrap();
        alloc.reset();
        let ptr = alloc.allocate(100).unwrap() as usize;

        // A fresh TLAB follows the abandoned one
        assert_eq!(ptr, base + 8192);
    }

    #[test]
    fn test_large_object_bypasses_tlab() {
        let heap = heap();
        let base = heap.nursery_range().start;
        let mut alloc = Allocator::new(heap);

        alloc.allocate(16).unwrap();
        let large = alloc.allocate(10_000).unwrap() as usize;
        assert_eq!(large, base + 8192);
        assert_eq!(alloc.remaining(), 8192 - 16);
    }

    #[test]
    fn test_keeps_tlab_with_large_remainder() {
        let heap = heap();
        let base = heap.nursery_range().start;
        let mut alloc = Allocator::new(heap);

        alloc.allocate(7000).unwrap();
        let direct = alloc.allocate(2000).unwrap() as usize;
        assert_eq!(direct, base + 8192);
        assert_eq!(alloc.remaining(), 1192);

        let small = alloc.allocate(1000).unwrap() as usize;
        assert_eq!(small, base + 7000);
    }

    #[test]
    fn test_refills_small_remainder() {
        let heap = heap();
        let base = heap.nursery_range().start;
        let mut alloc = Allocator::new(heap);

        alloc.allocate(8000).unwrap();
        let ptr = alloc.allocate(400).unwrap() as usize;
        assert_eq!(ptr, base + 8192);
        assert_eq!(alloc.remaining(), 8192 - 400);
    }

    #[test]
    fn test_stale_tlab_after_rebuild() {
        let heap = heap();
        let base = heap.nursery_range().start;
        let mut alloc = Allocator::new(heap.clone());

        alloc.allocate(100).unwrap();
        // SAFETY: no other thread uses this heap
        let world = unsafe { WorldStopped::assume() };
        heap.build_nursery_fragments(&world, &[], |_| 0);

        let ptr = alloc.allocate(100).unwrap() as usize;
        assert_eq!(ptr, base);
    }

    #[test]
    fn test_exhaustion() {
        let heap = heap();
        let mut alloc = Allocator::new(heap);

        for _ in 0..8 {
            assert!(alloc.allocate(8192).is_some());
        }
        assert!(alloc.allocate(8192).is_none());
        assert!(alloc.allocate(8).is_none());
    }
}
