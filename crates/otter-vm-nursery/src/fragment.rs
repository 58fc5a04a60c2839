//! Lock-free nursery fragment allocator
//!
//! Free nursery space between pinned objects is tracked as fragments. Each
//! fragment lives in a slot of a fixed arena and is threaded on two lists:
//!
//! - the allocation list, which mutators walk and bump-allocate from with
//!   compare-and-swap on the fragment cursor; exhausted fragments are marked
//!   deleted and unlinked Harris–Michael style
//! - the region list, a stable list of every fragment of the current cycle,
//!   only touched while the world is stopped
//!
//! Links are slot indices packed with a deletion mark and a slot generation,
//! so no pointer tagging is involved. Slots are only recycled while the world
//! is stopped, which keeps indices stable for the whole allocation phase.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use crate::address::AddressRange;
use crate::config::ClearPolicy;
use crate::safepoint::WorldStopped;
use crate::stats::{AllocCounters, AllocStats};

/// Empty link target
const NIL: u32 = u32::MAX;

/// Packed list link: target slot in the low 32 bits, deletion mark in bit 32,
/// generation of the owning slot in the remaining bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link(u64);

impl Link {
    const DELETED: u64 = 1 << 32;
    const GENERATION_SHIFT: u32 = 33;

    #[inline]
    const fn new(target: u32, generation: u32) -> Self {
        Self(target as u64 | ((generation as u64) << Self::GENERATION_SHIFT))
    }

    #[inline]
    const fn target(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    const fn is_deleted(self) -> bool {
        self.0 & Self::DELETED != 0
    }

    #[inline]
    const fn generation(self) -> u32 {
        (self.0 >> Self::GENERATION_SHIFT) as u32
    }

    #[inline]
    const fn deleted(self) -> Self {
        Self(self.0 | Self::DELETED)
    }

    /// Same owner and mark, new target.
    #[inline]
    const fn with_target(self, target: u32) -> Self {
        Self((self.0 & !(u32::MAX as u64)) | target as u64)
    }
}

/// Generations fit in the 31 bits above the mark.
const GENERATION_MASK: u32 = u32::MAX >> 1;

struct FragmentSlot {
    start: AtomicUsize,
    /// Allocation cursor
    next: AtomicUsize,
    end: AtomicUsize,
    alloc_link: AtomicU64,
    region_link: AtomicU32,
    generation: AtomicU32,
}

impl FragmentSlot {
    fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            alloc_link: AtomicU64::new(Link::new(NIL, 0).0),
            region_link: AtomicU32::new(NIL),
            generation: AtomicU32::new(0),
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        let next = self.next.load(Ordering::Acquire);
        self.end.load(Ordering::Relaxed).saturating_sub(next)
    }
}

/// Concurrent bump allocator over a list of free nursery ranges.
pub struct FragmentAllocator {
    slots: Box<[CachePadded<FragmentSlot>]>,
    alloc_head: CachePadded<AtomicU64>,
    region_head: AtomicU32,
    /// Unused slots; only touched while the world is stopped
    free: Mutex<Vec<u32>>,
    max_waste: usize,
    clear_policy: ClearPolicy,
    counters: AllocCounters,
}

impl FragmentAllocator {
    /// Create an allocator able to track `capacity` fragments at once.
    pub fn new(capacity: usize, max_waste: usize, clear_policy: ClearPolicy) -> Self {
        assert!(
            capacity < NIL as usize,
            "fragment arena capacity {capacity} too large"
        );
        let slots = (0..capacity)
            .map(|_| CachePadded::new(FragmentSlot::new()))
            .collect();
        // Popped from the back, so slot 0 is used first
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            alloc_head: CachePadded::new(AtomicU64::new(Link::new(NIL, 0).0)),
            region_head: AtomicU32::new(NIL),
            free: Mutex::new(free),
            max_waste,
            clear_policy,
            counters: AllocCounters::default(),
        }
    }

    /// Fragments that cannot be worth keeping are smaller than this.
    pub fn max_waste(&self) -> usize {
        self.max_waste
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AllocStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &AllocCounters {
        &self.counters
    }

    #[inline]
    fn slot(&self, idx: u32) -> &FragmentSlot {
        &self.slots[idx as usize]
    }

    #[inline]
    fn head(&self) -> Link {
        Link(self.alloc_head.load(Ordering::Acquire))
    }

    /// Push `[start, end)` on both lists.
    ///
    /// # Safety
    ///
    /// The range must be writable memory that nothing else uses until the
    /// next [`release`](Self::release). The allocator zeroes parts of it.
    pub unsafe fn add(&self, _world: &WorldStopped, start: usize, end: usize) {
        assert!(start < end, "empty fragment {start:#x}..{end:#x}");
        let Some(idx) = self.free.lock().pop() else {
            panic!("fragment arena exhausted");
        };
        let slot = self.slot(idx);
        let generation = (slot.generation.load(Ordering::Relaxed) + 1) & GENERATION_MASK;
        slot.generation.store(generation, Ordering::Relaxed);
        slot.start.store(start, Ordering::Relaxed);
        slot.next.store(start, Ordering::Relaxed);
        slot.end.store(end, Ordering::Relaxed);

        let head = self.head();
        slot.alloc_link
            .store(Link::new(head.target(), generation).0, Ordering::Relaxed);
        slot.region_link
            .store(self.region_head.load(Ordering::Relaxed), Ordering::Relaxed);
        self.region_head.store(idx, Ordering::Relaxed);
        self.alloc_head
            .store(head.with_target(idx).0, Ordering::Release);
    }

    /// Drop every fragment and recycle their slots.
    pub fn release(&self, _world: &WorldStopped) {
        let mut free = self.free.lock();
        let mut idx = self.region_head.load(Ordering::Relaxed);
        while idx != NIL {
            free.push(idx);
            idx = self.slot(idx).region_link.load(Ordering::Relaxed);
        }
        self.region_head.store(NIL, Ordering::Relaxed);
        self.alloc_head
            .store(self.head().with_target(NIL).0, Ordering::Release);
    }

    /// Reverse both lists. Fragments are pushed in ascending address order
    /// during a build; reversing makes allocation walk them from the bottom.
    pub fn reverse(&self, _world: &WorldStopped) {
        let order = self.region_indices();
        let mut region_next = NIL;
        let mut alloc_next = NIL;
        for &idx in &order {
            let slot = self.slot(idx);
            slot.region_link.store(region_next, Ordering::Relaxed);
            region_next = idx;
            // Retired fragments stay off the allocation list
            if !Link(slot.alloc_link.load(Ordering::Relaxed)).is_deleted() {
                let generation = slot.generation.load(Ordering::Relaxed);
                slot.alloc_link
                    .store(Link::new(alloc_next, generation).0, Ordering::Relaxed);
                alloc_next = idx;
            }
        }
        self.region_head.store(region_next, Ordering::Relaxed);
        self.alloc_head
            .store(self.head().with_target(alloc_next).0, Ordering::Release);
    }

    /// Zero the unused part of every fragment. Returns the bytes cleared.
    pub fn clear_fragments(&self, _world: &WorldStopped) -> usize {
        let mut cleared = 0;
        for idx in self.region_indices() {
            let slot = self.slot(idx);
            let next = slot.next.load(Ordering::Relaxed);
            let end = slot.end.load(Ordering::Relaxed);
            if next < end {
                // SAFETY: `add` requires fragment memory to be writable and
                // unused; [next, end) has not been handed out.
                unsafe { zero(next, end - next) };
                cleared += end - next;
            }
        }

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "otter::gc::nursery",
            bytes = cleared,
            "Cleared fragment tails"
        );

        cleared
    }

    /// Unused ranges of every fragment of the current cycle, in list order.
    pub fn fragments(&self, _world: &WorldStopped) -> Vec<AddressRange> {
        self.region_indices()
            .into_iter()
            .map(|idx| {
                let slot = self.slot(idx);
                let next = slot.next.load(Ordering::Relaxed);
                let end = slot.end.load(Ordering::Relaxed);
                AddressRange::new(next.min(end), end)
            })
            .collect()
    }

    /// Original extents of every fragment of the current cycle, in list order.
    pub fn fragment_extents(&self, _world: &WorldStopped) -> Vec<AddressRange> {
        self.region_indices()
            .into_iter()
            .map(|idx| {
                let slot = self.slot(idx);
                AddressRange::new(
                    slot.start.load(Ordering::Relaxed),
                    slot.end.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    fn region_indices(&self) -> Vec<u32> {
        let mut order = Vec::new();
        let mut idx = self.region_head.load(Ordering::Relaxed);
        while idx != NIL {
            order.push(idx);
            idx = self.slot(idx).region_link.load(Ordering::Relaxed);
        }
        order
    }

    /// Check whether some fragment currently has `size` free bytes.
    pub fn can_alloc(&self, size: usize) -> bool {
        let mut link = self.head();
        while link.target() != NIL {
            let slot = self.slot(link.target());
            if slot.remaining() >= size {
                return true;
            }
            link = Link(slot.alloc_link.load(Ordering::Acquire));
        }
        false
    }

    /// Allocate `size` bytes from the first fragment with room.
    ///
    /// Returns `None` when no fragment can hold the request; the caller then
    /// has to trigger a collection.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        debug_assert!(size > 0);
        self.counters.alloc_request();
        let backoff = Backoff::new();

        'restart: loop {
            let mut link = self.head();
            while link.target() != NIL {
                let idx = link.target();
                let slot = self.slot(idx);
                if slot.remaining() >= size {
                    match self.alloc_from(idx, size) {
                        Some(p) => return Some(p),
                        None => {
                            self.counters.alloc_retry();
                            backoff.spin();
                            continue 'restart;
                        }
                    }
                }
                link = Link(slot.alloc_link.load(Ordering::Acquire));
            }
            return None;
        }
    }

    /// Allocate up to `desired` bytes, accepting as little as `minimum`.
    ///
    /// Prefers the first fragment with `desired` free bytes. Otherwise the
    /// largest fragment with at least `minimum` free bytes is claimed whole.
    /// Returns the start and the size actually handed out.
    pub fn alloc_range(&self, desired: usize, minimum: usize) -> Option<(usize, usize)> {
        debug_assert!(minimum > 0 && minimum <= desired);
        self.counters.range_request();
        let backoff = Backoff::new();

        'restart: loop {
            let mut best: Option<u32> = None;
            let mut current_minimum = minimum;
            let mut link = self.head();

            while link.target() != NIL {
                let idx = link.target();
                let slot = self.slot(idx);
                let available = slot.remaining();
                if available >= desired {
                    match self.alloc_from(idx, desired) {
                        Some(p) => return Some((p, desired)),
                        None => {
                            self.counters.range_retry();
                            backoff.spin();
                            continue 'restart;
                        }
                    }
                }
                if available >= current_minimum {
                    best = Some(idx);
                    current_minimum = available;
                }
                link = Link(slot.alloc_link.load(Ordering::Acquire));
            }

            let idx = best?;
            let available = self.slot(idx).remaining();
            if available < minimum {
                self.counters.range_retry();
                backoff.spin();
                continue 'restart;
            }
            match self.alloc_from(idx, available) {
                Some(p) => return Some((p, available)),
                None => {
                    self.counters.range_retry();
                    backoff.spin();
                    continue 'restart;
                }
            }
        }
    }

    /// Bump the cursor of one fragment. Fails when the fragment no longer has
    /// room or another thread moved the cursor first.
    fn alloc_from(&self, idx: u32, size: usize) -> Option<usize> {
        let slot = self.slot(idx);
        let p = slot.next.load(Ordering::Acquire);
        let end = p.checked_add(size)?;
        let frag_end = slot.end.load(Ordering::Relaxed);
        if end > frag_end {
            return None;
        }
        slot.next
            .compare_exchange(p, end, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        if frag_end - end < self.max_waste {
            let mut trailer = 0;
            // The range allocator ignores the waste threshold, so the tail has
            // to be claimed before it is cleared.
            if self.clear_policy == ClearPolicy::ClearAtTlabCreation
                && self.claim_remaining_size(slot, end)
            {
                trailer = frag_end - end;
                // SAFETY: the claim made [end, frag_end) exclusively ours, and
                // `add` requires fragment memory to be writable.
                unsafe { zero(end, trailer) };
            }
            self.counters.fragment_retired(trailer);
            self.retire(idx);
        }
        Some(p)
    }

    /// Take every byte left after `alloc_end` so nobody else can allocate it.
    fn claim_remaining_size(&self, slot: &FragmentSlot, alloc_end: usize) -> bool {
        let frag_end = slot.end.load(Ordering::Relaxed);
        if frag_end <= alloc_end {
            return false;
        }
        slot.next
            .compare_exchange(alloc_end, frag_end, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark a fragment deleted, then unlink it from the allocation list.
    fn retire(&self, idx: u32) {
        let slot = self.slot(idx);
        let backoff = Backoff::new();

        let mut next = Link(slot.alloc_link.load(Ordering::Acquire));
        while !next.is_deleted() {
            match slot.alloc_link.compare_exchange(
                next.0,
                next.deleted().0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                // Successor changed underneath us
                Err(actual) => next = Link(actual),
            }
        }
        debug_assert_eq!(
            next.generation(),
            slot.generation.load(Ordering::Relaxed),
            "stale fragment link"
        );

        // Whoever loses a race here retries from a fresh predecessor; a
        // missing predecessor means a helper already unlinked the fragment.
        while let Some((pred, observed)) = self.find_predecessor(idx) {
            let unlinked = observed.with_target(next.target());
            if pred
                .compare_exchange(observed.0, unlinked.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Locate the link pointing at `target`, unlinking deleted fragments met
    /// on the way. Returns the link and the value observed in it.
    fn find_predecessor(&self, target: u32) -> Option<(&AtomicU64, Link)> {
        'retry: loop {
            let mut pred: &AtomicU64 = &self.alloc_head;
            let mut current = Link(pred.load(Ordering::Acquire));
            loop {
                let idx = current.target();
                if idx == NIL {
                    return None;
                }
                if idx == target {
                    return Some((pred, current));
                }
                let node = self.slot(idx);
                let succ = Link(node.alloc_link.load(Ordering::Acquire));
                if succ.is_deleted() {
                    let helped = current.with_target(succ.target());
                    if pred
                        .compare_exchange(
                            current.0,
                            helped.0,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue 'retry;
                    }
                    current = helped;
                    continue;
                }
                pred = &node.alloc_link;
                current = succ;
            }
        }
    }
}

/// Zero `len` bytes at `addr`.
///
/// # Safety
///
/// The range must be writable and not concurrently accessed.
#[inline]
pub(crate) unsafe fn zero(addr: usize, len: usize) {
    // SAFETY: forwarded to the caller.
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
}
