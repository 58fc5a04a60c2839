//! Nursery region
//!
//! Owns (or borrows) the nursery memory, the scan-start table and the
//! fragment allocator, and rebuilds the fragment list from the pinned objects
//! left behind by each minor collection.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::address::{ALLOC_ALIGN, AddressRange, align_up};
use crate::config::{ClearPolicy, NurseryConfig};
use crate::error::{NurseryError, Result};
use crate::fragment::{FragmentAllocator, zero};
use crate::safepoint::WorldStopped;

/// Outcome of a fragment rebuild.
///
/// `fragment_bytes + pinned_bytes + wasted_bytes` always equals the nursery
/// size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentBuild {
    /// Free bytes available for allocation
    pub fragment_bytes: usize,
    /// Number of fragments built
    pub fragment_count: usize,
    /// Bytes covered by pinned objects
    pub pinned_bytes: usize,
    /// Bytes in gaps too small to become fragments
    pub wasted_bytes: usize,
}

impl FragmentBuild {
    /// True when no fragment could be built.
    pub fn is_fully_pinned(&self) -> bool {
        self.fragment_count == 0
    }
}

enum Backing {
    Owned { ptr: NonNull<u8>, layout: Layout },
    Borrowed,
}

/// The young generation region.
pub struct Nursery {
    range: AddressRange,
    backing: Backing,
    clear_policy: ClearPolicy,
    scan_start_size: usize,
    /// Lowest known object start per chunk, 0 when unknown
    scan_starts: Box<[AtomicUsize]>,
    fragments: FragmentAllocator,
    last_pinned_end: AtomicUsize,
    /// Bumped by every fragment rebuild
    epoch: AtomicU64,
}

// SAFETY: the backing memory is only reached through raw addresses handed out
// by the lock-free fragment allocator; every other field is thread-safe.
unsafe impl Send for Nursery {}
// SAFETY: see above.
unsafe impl Sync for Nursery {}

impl Nursery {
    /// Reserve `config.nursery_size` bytes of zeroed, card-aligned memory.
    pub fn new(config: &NurseryConfig) -> Result<Self> {
        config.validate()?;
        let layout = Layout::from_size_align(config.nursery_size, config.card_size())
            .map_err(|_| NurseryError::InvalidNurserySize(config.nursery_size))?;
        // SAFETY: the layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(NurseryError::OutOfMemory {
            size: config.nursery_size,
        })?;
        let range = AddressRange::with_size(ptr.as_ptr() as usize, config.nursery_size);
        Ok(Self::with_backing(config, range, Backing::Owned { ptr, layout }))
    }

    /// Manage memory reserved by the embedder. `config.nursery_size` is
    /// ignored in favour of the size of `range`.
    ///
    /// # Safety
    ///
    /// `range` must be zeroed, writable memory that outlives the nursery and
    /// is not used for anything else.
    pub unsafe fn from_raw_parts(config: &NurseryConfig, range: AddressRange) -> Result<Self> {
        if range.is_empty()
            || !range.start.is_multiple_of(ALLOC_ALIGN)
            || !range.end.is_multiple_of(ALLOC_ALIGN)
        {
            return Err(NurseryError::InvalidBounds {
                start: range.start,
                end: range.end,
            });
        }
        let config = NurseryConfig {
            nursery_size: range.size(),
            ..config.clone()
        };
        config.validate()?;
        Ok(Self::with_backing(&config, range, Backing::Borrowed))
    }

    fn with_backing(config: &NurseryConfig, range: AddressRange, backing: Backing) -> Self {
        let chunks = range.size().div_ceil(config.scan_start_size);
        let capacity = range.size() / config.max_nursery_waste + 2;
        let nursery = Self {
            range,
            backing,
            clear_policy: config.clear_policy,
            scan_start_size: config.scan_start_size,
            scan_starts: (0..chunks).map(|_| AtomicUsize::new(0)).collect(),
            fragments: FragmentAllocator::new(
                capacity,
                config.max_nursery_waste,
                config.clear_policy,
            ),
            last_pinned_end: AtomicUsize::new(range.start),
            epoch: AtomicU64::new(0),
        };
        // SAFETY: nothing can allocate before the nursery is returned.
        let world = unsafe { WorldStopped::assume() };
        nursery.build_fragments(&world, &[], |_| 0);
        nursery
    }

    /// Nursery bounds.
    #[inline]
    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Check whether `addr` points into the nursery.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.range.contains(addr)
    }

    /// Zeroing policy in effect.
    pub fn clear_policy(&self) -> ClearPolicy {
        self.clear_policy
    }

    /// Number of fragment rebuilds so far.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The fragment allocator.
    pub fn fragments(&self) -> &FragmentAllocator {
        &self.fragments
    }

    /// End of the last pinned object seen by the latest rebuild, or the
    /// nursery start when nothing was pinned.
    pub fn last_pinned_end(&self) -> usize {
        self.last_pinned_end.load(Ordering::Relaxed)
    }

    /// Allocate one object of `size` bytes.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        let size = align_up(size.max(1), ALLOC_ALIGN)?;
        let p = self.fragments.alloc(size)?;
        self.hand_out(p, size);
        Some(p)
    }

    /// Allocate between `minimum` and `desired` bytes, typically for a TLAB.
    pub fn alloc_range(&self, desired: usize, minimum: usize) -> Option<(usize, usize)> {
        let minimum = align_up(minimum.max(1), ALLOC_ALIGN)?;
        let desired = align_up(desired, ALLOC_ALIGN)?.max(minimum);
        let (p, size) = self.fragments.alloc_range(desired, minimum)?;
        self.hand_out(p, size);
        Some((p, size))
    }

    /// Check whether an allocation of `size` bytes could currently succeed.
    pub fn can_alloc(&self, size: usize) -> bool {
        align_up(size.max(1), ALLOC_ALIGN).is_some_and(|size| self.fragments.can_alloc(size))
    }

    fn hand_out(&self, p: usize, size: usize) {
        debug_assert!(self.range.contains(p) && p + size <= self.range.end);
        self.set_scan_start(p);
        if self.clear_policy == ClearPolicy::ClearAtTlabCreation {
            // SAFETY: the fragment allocator gave [p, p + size) to this caller
            // alone, and it lies inside the nursery memory.
            unsafe { zero(p, size) };
        }
    }

    #[inline]
    fn chunk_index(&self, addr: usize) -> usize {
        assert!(
            self.range.contains(addr),
            "address {addr:#x} outside the nursery"
        );
        (addr - self.range.start) / self.scan_start_size
    }

    /// Record an object start for conservative scanning.
    pub fn set_scan_start(&self, addr: usize) {
        let slot = &self.scan_starts[self.chunk_index(addr)];
        let _ = slot.fetch_update(Ordering::Release, Ordering::Relaxed, |current| {
            (current == 0 || addr < current).then_some(addr)
        });
    }

    /// Closest recorded object start at or below `addr`.
    pub fn find_scan_start(&self, addr: usize) -> Option<usize> {
        let idx = self.chunk_index(addr);
        self.scan_starts[..=idx].iter().rev().find_map(|slot| {
            let start = slot.load(Ordering::Acquire);
            (start != 0 && start <= addr).then_some(start)
        })
    }

    /// Forget every recorded object start.
    pub fn clear_scan_starts(&self, _world: &WorldStopped) {
        for slot in self.scan_starts.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Rebuild the fragment list around the pinned objects at `pinned`.
    ///
    /// `pinned` must be sorted, non-overlapping object starts inside the
    /// nursery; `size_of` reports each object's size.
    pub fn build_fragments(
        &self,
        world: &WorldStopped,
        pinned: &[usize],
        size_of: impl Fn(usize) -> usize,
    ) -> FragmentBuild {
        self.fragments.release(world);
        self.clear_scan_starts(world);

        let mut report = FragmentBuild::default();
        let mut frag_start = self.range.start;
        for &obj in pinned {
            assert!(
                obj >= frag_start,
                "pinned objects unsorted or overlapping at {obj:#x}"
            );
            let Some(size) = align_up(size_of(obj), ALLOC_ALIGN) else {
                panic!("pinned object {obj:#x} has an impossible size");
            };
            let obj_end = obj + size;
            assert!(
                obj_end <= self.range.end,
                "pinned object {obj:#x} extends past the nursery"
            );
            self.set_scan_start(obj);
            if obj > frag_start {
                self.add_fragment(world, frag_start, obj, &mut report);
            }
            report.pinned_bytes += size;
            frag_start = obj_end;
        }
        self.last_pinned_end.store(frag_start, Ordering::Relaxed);
        if self.range.end > frag_start {
            self.add_fragment(world, frag_start, self.range.end, &mut report);
        }

        self.fragments.reverse(world);
        self.fragments
            .counters()
            .record_build(report.fragment_bytes, report.wasted_bytes);
        self.epoch.fetch_add(1, Ordering::AcqRel);

        #[cfg(feature = "gc_logging")]
        {
            tracing::debug!(
                target: "otter::gc::nursery",
                fragments = report.fragment_count,
                free_bytes = report.fragment_bytes,
                pinned = pinned.len(),
                pinned_bytes = report.pinned_bytes,
                wasted_bytes = report.wasted_bytes,
                "Built nursery fragments"
            );
            if report.is_fully_pinned() {
                tracing::warn!(target: "otter::gc::nursery", "Nursery fully pinned");
                for &obj in pinned {
                    tracing::trace!(
                        target: "otter::gc::nursery",
                        addr = format_args!("{obj:#x}"),
                        size = size_of(obj),
                        "Pinned object"
                    );
                }
            }
        }

        debug_assert_eq!(
            report.fragment_bytes + report.pinned_bytes + report.wasted_bytes,
            self.range.size()
        );
        report
    }

    fn add_fragment(
        &self,
        world: &WorldStopped,
        start: usize,
        end: usize,
        report: &mut FragmentBuild,
    ) {
        let size = end - start;
        if size >= self.fragments.max_waste() {
            if self.clear_policy == ClearPolicy::ClearAtGc {
                // SAFETY: gaps between pinned objects are unused nursery memory
                unsafe { zero(start, size) };
            }
            // SAFETY: the gap is unused nursery memory until the next rebuild
            unsafe { self.fragments.add(world, start, end) };
            report.fragment_bytes += size;
            report.fragment_count += 1;
        } else {
            // Conservative pinning relies on free memory being zero
            // SAFETY: as above
            unsafe { zero(start, size) };
            report.wasted_bytes += size;
        }
    }

    /// Zero unused fragment memory when allocation is responsible for
    /// clearing. Returns the bytes cleared.
    pub fn clear_fragments(&self, world: &WorldStopped) -> usize {
        match self.clear_policy {
            ClearPolicy::ClearAtTlabCreation => self.fragments.clear_fragments(world),
            ClearPolicy::ClearAtGc => 0,
        }
    }

    /// Zero every unused fragment tail so a conservative scan only finds
    /// object starts in allocated memory.
    pub fn prepare_for_pinning(&self, world: &WorldStopped) {
        self.fragments.clear_fragments(world);
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = self.backing {
            // SAFETY: allocated in `new` with this layout
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}
