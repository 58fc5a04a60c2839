//! Write barriers and the card-table remembered set
//!
//! Every store that may write a heap reference goes through one of the
//! barrier entry points of [`RememberedSet`]. The barrier performs the store
//! and then dirties the card of the written slot when the stored value points
//! into the nursery, or unconditionally while concurrent marking runs.
//! Generated code binds to a `dyn RememberedSet` chosen when the collector is
//! constructed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::address::{AddressRange, WORD_SIZE};
use crate::card_table::{CardTable, DirectCardTable, OverlappingCardTable};
use crate::cards::CardGeometry;
use crate::config::{CardTableMode, NurseryConfig};
use crate::error::Result;
use crate::safepoint::WorldStopped;
use crate::scan::{CardScanner, OldGeneration, ScanBuffers, ScanOps};
use crate::stats::{CardScanCounters, CardScanStats};

/// Write-barrier and remembered-set interface of a collector.
///
/// The barrier methods are called by mutators and must not block. The
/// collection hooks take a [`WorldStopped`] token.
pub trait RememberedSet: Send + Sync {
    /// Store `value` into the field at `slot` of `obj`.
    ///
    /// # Safety
    ///
    /// `slot` must be an aligned, writable reference slot inside `obj`.
    unsafe fn set_field(&self, obj: usize, slot: *mut usize, value: usize);

    /// Store `value` into the element at `slot` of array `arr`.
    ///
    /// # Safety
    ///
    /// `slot` must be an aligned, writable element slot inside `arr`.
    unsafe fn set_arrayref(&self, arr: usize, slot: *mut usize, value: usize);

    /// Copy `count` references from `src` to `dest`; the ranges may overlap.
    ///
    /// # Safety
    ///
    /// Both ranges must be aligned, valid reference slots.
    unsafe fn arrayref_copy(&self, dest: *mut usize, src: *const usize, count: usize);

    /// Copy `count` inline values of `element_size` bytes from `src` to
    /// `dest` and dirty every card of the destination.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `count * element_size` bytes.
    unsafe fn value_copy(&self, dest: *mut u8, src: *const u8, count: usize, element_size: usize);

    /// Copy the body of object `src` over object `obj`, keeping the header
    /// of `obj`, and dirty every card of `obj`.
    ///
    /// # Safety
    ///
    /// Both objects must be `size` bytes of valid memory with the same layout.
    unsafe fn object_copy(&self, obj: usize, src: usize, size: usize);

    /// Dirty the card of a slot that was written without a barrier store.
    fn generic_nostore(&self, slot: usize);

    /// Dirty the card of a slot recorded by the runtime.
    fn record_pointer(&self, slot: usize);

    /// Copy `count` reference words belonging to one value type and dirty the
    /// destination cards if any copied reference is young.
    ///
    /// # Safety
    ///
    /// Both ranges must be aligned, valid reference slots.
    unsafe fn range_copy(&self, dest: *mut usize, src: *const usize, count: usize);

    /// Whether the card of `addr` is dirty.
    fn find_address(&self, addr: usize) -> bool;

    /// Replay the remembered set after the nursery has been evacuated.
    fn finish_scan_remsets(
        &self,
        world: &WorldStopped,
        old: &dyn OldGeneration,
        ops: &mut dyn ScanOps,
    );

    /// Clear the cards of the old generation before a full collection.
    fn prepare_for_major_collection(&self, world: &WorldStopped, old: &dyn OldGeneration);

    /// Switch concurrent-marking mode, in which every barrier dirties its card.
    fn set_concurrent_marking(&self, enabled: bool);

    /// The underlying card table.
    fn card_table(&self) -> &dyn CardTable;
}

/// Card-table backed remembered set.
pub struct CardTableRemset {
    table: Box<dyn CardTable>,
    nursery_start: AtomicUsize,
    nursery_end: AtomicUsize,
    concurrent_marking: AtomicBool,
    header_size: usize,
    /// Only used while the world is stopped
    buffers: Mutex<ScanBuffers>,
    counters: CardScanCounters,
}

impl CardTableRemset {
    /// Build the card table selected by `config`. A direct table covers
    /// `heap`; an overlapping table covers everything.
    pub fn new(config: &NurseryConfig, heap: AddressRange) -> Result<Self> {
        config.validate()?;
        let geometry = CardGeometry::new(config.card_bits);
        let table: Box<dyn CardTable> = match config.card_table_mode {
            CardTableMode::Direct => Box::new(DirectCardTable::new(geometry, heap)?),
            CardTableMode::Overlapping { card_count_bits } => {
                Box::new(OverlappingCardTable::new(geometry, card_count_bits)?)
            }
        };
        Ok(Self::with_table(table, config.object_header_size))
    }

    /// Wrap an existing table.
    pub fn with_table(table: Box<dyn CardTable>, header_size: usize) -> Self {
        Self {
            table,
            nursery_start: AtomicUsize::new(0),
            nursery_end: AtomicUsize::new(0),
            concurrent_marking: AtomicBool::new(false),
            header_size,
            buffers: Mutex::new(ScanBuffers::default()),
            counters: CardScanCounters::default(),
        }
    }

    /// Tell the barriers where the nursery lives.
    pub fn set_nursery_bounds(&self, start: usize, end: usize) {
        assert!(start <= end, "inverted nursery bounds");
        self.nursery_start.store(start, Ordering::Relaxed);
        self.nursery_end.store(end, Ordering::Release);
    }

    /// Current nursery bounds.
    pub fn nursery_bounds(&self) -> AddressRange {
        let end = self.nursery_end.load(Ordering::Acquire);
        AddressRange::new(self.nursery_start.load(Ordering::Relaxed), end)
    }

    /// Card scan counter snapshot.
    pub fn stats(&self) -> CardScanStats {
        self.counters.snapshot()
    }

    #[inline]
    fn ptr_in_nursery(&self, value: usize) -> bool {
        value >= self.nursery_start.load(Ordering::Relaxed)
            && value < self.nursery_end.load(Ordering::Relaxed)
    }

    #[inline]
    fn needs_mark(&self, value: usize) -> bool {
        self.ptr_in_nursery(value) || self.concurrent_marking.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn store(&self, slot: *mut usize, value: usize) {
        // SAFETY: the caller guarantees an aligned, writable slot
        unsafe { AtomicUsize::from_ptr(slot) }.store(value, Ordering::Relaxed);
        if self.needs_mark(value) {
            self.table.mark(slot as usize);
        }
    }

    /// Copy words in whichever direction is safe for overlapping ranges and
    /// call `f` with each destination and value.
    unsafe fn copy_words(
        dest: *mut usize,
        src: *const usize,
        count: usize,
        mut f: impl FnMut(*mut usize, usize),
    ) {
        let mut copy_one = |i: usize| {
            // SAFETY: the caller guarantees both ranges hold `count` slots
            let (from, to) = unsafe {
                (
                    AtomicUsize::from_ptr(src.add(i).cast_mut()),
                    AtomicUsize::from_ptr(dest.add(i)),
                )
            };
            let value = from.load(Ordering::Relaxed);
            to.store(value, Ordering::Relaxed);
            // SAFETY: in bounds as above
            f(unsafe { dest.add(i) }, value);
        };

        let (s, d) = (src as usize, dest as usize);
        if s < d && s + count * WORD_SIZE > d {
            (0..count).rev().for_each(&mut copy_one);
        } else {
            (0..count).for_each(&mut copy_one);
        }
    }
}

impl RememberedSet for CardTableRemset {
    unsafe fn set_field(&self, _obj: usize, slot: *mut usize, value: usize) {
        // SAFETY: forwarded to the caller
        unsafe { self.store(slot, value) };
    }

    unsafe fn set_arrayref(&self, _arr: usize, slot: *mut usize, value: usize) {
        // SAFETY: forwarded to the caller
        unsafe { self.store(slot, value) };
    }

    unsafe fn arrayref_copy(&self, dest: *mut usize, src: *const usize, count: usize) {
        // SAFETY: forwarded to the caller
        unsafe {
            Self::copy_words(dest, src, count, |slot, value| {
                if self.needs_mark(value) {
                    self.table.mark(slot as usize);
                }
            })
        };
    }

    unsafe fn value_copy(&self, dest: *mut u8, src: *const u8, count: usize, element_size: usize) {
        let Some(size) = count.checked_mul(element_size) else {
            panic!("value copy of {count} x {element_size} bytes overflows");
        };
        if size == 0 {
            return;
        }
        // SAFETY: forwarded to the caller
        unsafe { std::ptr::copy(src, dest, size) };
        self.table.mark_range(dest as usize, size);
    }

    unsafe fn object_copy(&self, obj: usize, src: usize, size: usize) {
        assert!(
            size >= self.header_size,
            "object of {size} bytes smaller than its header"
        );
        let header = self.header_size;
        // SAFETY: forwarded to the caller
        unsafe {
            std::ptr::copy(
                (src + header) as *const u8,
                (obj + header) as *mut u8,
                size - header,
            )
        };
        self.table.mark_range(obj, size);
    }

    fn generic_nostore(&self, slot: usize) {
        self.table.mark(slot);
    }

    fn record_pointer(&self, slot: usize) {
        self.table.mark(slot);
    }

    unsafe fn range_copy(&self, dest: *mut usize, src: *const usize, count: usize) {
        if count == 0 {
            return;
        }
        let mut young = self.concurrent_marking.load(Ordering::Relaxed);
        // SAFETY: forwarded to the caller
        unsafe {
            Self::copy_words(dest, src, count, |_, value| {
                young |= self.ptr_in_nursery(value);
            })
        };
        if young {
            self.table.mark_range(dest as usize, count * WORD_SIZE);
        }
    }

    fn find_address(&self, addr: usize) -> bool {
        self.table.find_address(addr)
    }

    fn finish_scan_remsets(
        &self,
        _world: &WorldStopped,
        old: &dyn OldGeneration,
        ops: &mut dyn ScanOps,
    ) {
        let table = &*self.table;
        if table.has_shadow() {
            table.clear_shadow();
            old.for_each_major_block(&mut |block| table.move_to_shadow(block.start, block.size));
            old.for_each_large_object(&mut |addr, size| table.move_to_shadow(addr, size));
        }

        let mut buffers = self.buffers.lock();
        let mut scanner =
            CardScanner::new(table, self.nursery_bounds(), &self.counters, &mut buffers);

        let start = Instant::now();
        scanner.scan_major_heap(old, ops);
        let major = start.elapsed();

        let start = Instant::now();
        scanner.scan_large_objects(old, ops);
        let los = start.elapsed();

        self.counters.record_scan(major, los);

        #[cfg(feature = "gc_logging")]
        {
            let stats = self.counters.snapshot();
            tracing::debug!(
                target: "otter::gc::cardtable",
                major_us = major.as_micros() as u64,
                los_us = los.as_micros() as u64,
                cards_scanned = stats.cards_scanned,
                marked_cards = stats.marked_cards,
                remarked_cards = stats.remarked_cards,
                shadow = table.has_shadow(),
                "Scanned remembered set"
            );
        }
    }

    fn prepare_for_major_collection(&self, _world: &WorldStopped, old: &dyn OldGeneration) {
        let table = &*self.table;
        old.for_each_major_block(&mut |block| table.clear_range(block.start, block.size));
        old.for_each_large_object(&mut |addr, size| table.clear_range(addr, size));
    }

    fn set_concurrent_marking(&self, enabled: bool) {
        self.concurrent_marking.store(enabled, Ordering::Relaxed);
    }

    fn card_table(&self) -> &dyn CardTable {
        &*self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{MajorBlock, ObjectShape};

    const NURSERY: AddressRange = AddressRange::new(0x4000_0000, 0x4040_0000);

    /// Card-aligned heap words with a remembered set covering them.
    struct Fixture {
        _memory: Vec<usize>,
        base: usize,
        remset: CardTableRemset,
    }

    impl Fixture {
        fn new(mode: CardTableMode) -> Self {
            let mut memory = vec![0usize; (16 * 1024 + 512) / WORD_SIZE];
            let base = (memory.as_mut_ptr() as usize + 511) & !511;
            let config = NurseryConfig {
                card_table_mode: mode,
                ..Default::default()
            };
            let remset =
                CardTableRemset::new(&config, AddressRange::with_size(base, 16 * 1024)).unwrap();
            remset.set_nursery_bounds(NURSERY.start, NURSERY.end);
            Self {
                _memory: memory,
                base,
                remset,
            }
        }

        fn slot(&self, offset: usize) -> *mut usize {
            (self.base + offset) as *mut usize
        }

        fn read(&self, offset: usize) -> usize {
            // SAFETY: offsets stay inside the fixture memory
            unsafe { self.slot(offset).read() }
        }

        fn write(&self, offset: usize, value: usize) {
            // SAFETY: as above
            unsafe { self.slot(offset).write(value) }
        }
    }

    #[test]
    fn test_set_field_marks_young_values() {
        let f = Fixture::new(CardTableMode::Direct);
        // SAFETY: slots lie inside the fixture memory
        unsafe {
            f.remset.set_field(f.base, f.slot(8), NURSERY.start + 16);
            f.remset.set_field(f.base, f.slot(1024), 0x1234);
        }
        assert_eq!(f.read(8), NURSERY.start + 16);
        assert_eq!(f.read(1024), 0x1234);
        assert!(f.remset.find_address(f.base + 8));
        assert!(!f.remset.find_address(f.base + 1024));
        assert_eq!(f.remset.card_table().dirty_count(), 1);
    }

    #[test]
    fn test_concurrent_marking_marks_everything() {
        let f = Fixture::new(CardTableMode::Direct);
        f.remset.set_concurrent_marking(true);
        // SAFETY: slot lies inside the fixture memory
        unsafe { f.remset.set_arrayref(f.base, f.slot(2048), 0x1234) };
        assert!(f.remset.find_address(f.base + 2048));

        f.remset.set_concurrent_marking(false);
        // SAFETY: as above
        unsafe { f.remset.set_arrayref(f.base, f.slot(4096), 0x1234) };
        assert!(!f.remset.find_address(f.base + 4096));
    }

    #[test]
    fn test_arrayref_copy_overlapping_backward() {
        let f = Fixture::new(CardTableMode::Direct);
        for i in 0..4 {
            f.write(i * WORD_SIZE, i + 1);
        }
        f.write(3 * WORD_SIZE, NURSERY.start);
        // Shift four slots up by two, overlapping the source
        // SAFETY: both ranges lie inside the fixture memory
        unsafe {
            f.remset
                .arrayref_copy(f.slot(2 * WORD_SIZE), f.slot(0), 4)
        };
        let copied: Vec<usize> = (2..6).map(|i| f.read(i * WORD_SIZE)).collect();
        assert_eq!(copied, vec![1, 2, 3, NURSERY.start]);
        assert!(f.remset.find_address(f.base + 5 * WORD_SIZE));
    }

    #[test]
    fn test_arrayref_copy_marks_destination_cards_only() {
        let f = Fixture::new(CardTableMode::Direct);
        f.write(0, NURSERY.start);
        // SAFETY: both ranges lie inside the fixture memory
        unsafe { f.remset.arrayref_copy(f.slot(4096), f.slot(0), 1) };
        assert!(f.remset.find_address(f.base + 4096));
        assert!(!f.remset.find_address(f.base));
    }

    #[test]
    fn test_value_copy_marks_range() {
        let f = Fixture::new(CardTableMode::Direct);
        f.write(0, 7);
        // SAFETY: both ranges lie inside the fixture memory
        unsafe {
            f.remset
                .value_copy(f.slot(1000) as *mut u8, f.slot(0) as *const u8, 4, 8)
        };
        assert_eq!(f.read(1000), 7);
        // 1000..1032 straddles cards 1 and 2
        assert!(f.remset.find_address(f.base + 1000));
        assert!(f.remset.find_address(f.base + 1024));
        assert_eq!(f.remset.card_table().dirty_count(), 2);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_value_copy_rejects_overflowing_size() {
        let f = Fixture::new(CardTableMode::Direct);
        // SAFETY: the size check fires before any memory is touched
        unsafe {
            f.remset
                .value_copy(f.slot(0) as *mut u8, f.slot(8) as *const u8, usize::MAX / 2, 4)
        };
    }

    #[test]
    fn test_object_copy_keeps_header() {
        let f = Fixture::new(CardTableMode::Direct);
        let (dst, src) = (2048, 0);
        for i in 0..6 {
            f.write(src + i * WORD_SIZE, 100 + i);
            f.write(dst + i * WORD_SIZE, 200 + i);
        }
        // SAFETY: both objects lie inside the fixture memory
        unsafe {
            f.remset
                .object_copy(f.base + dst, f.base + src, 6 * WORD_SIZE)
        };
        let words: Vec<usize> = (0..6).map(|i| f.read(dst + i * WORD_SIZE)).collect();
        assert_eq!(words, vec![200, 201, 102, 103, 104, 105]);
        assert!(f.remset.find_address(f.base + dst));
    }

    #[test]
    fn test_range_copy() {
        let f = Fixture::new(CardTableMode::Direct);
        f.write(0, 5);
        f.write(8, 6);
        // SAFETY: both ranges lie inside the fixture memory
        unsafe { f.remset.range_copy(f.slot(3000), f.slot(0), 2) };
        assert_eq!(f.read(3000), 5);
        assert!(!f.remset.find_address(f.base + 3000));

        f.write(8, NURSERY.start + 8);
        // SAFETY: as above
        unsafe { f.remset.range_copy(f.slot(3000), f.slot(0), 2) };
        assert!(f.remset.find_address(f.base + 3000));
    }

    #[test]
    fn test_nostore_barriers() {
        let f = Fixture::new(CardTableMode::Direct);
        f.remset.generic_nostore(f.base + 600);
        f.remset.record_pointer(f.base + 5000);
        assert!(f.remset.find_address(f.base + 512));
        assert!(f.remset.find_address(f.base + 4608));
    }

    struct OneBlock {
        block: MajorBlock,
    }

    // SAFETY: the block lies inside fixture memory that outlives every scan
    unsafe impl OldGeneration for OneBlock {
        fn for_each_major_block(&self, f: &mut dyn FnMut(&MajorBlock)) {
            f(&self.block);
        }

        fn is_object_live(&self, _addr: usize) -> bool {
            true
        }

        fn for_each_large_object(&self, _f: &mut dyn FnMut(usize, usize)) {}

        fn shape(&self, _addr: usize) -> ObjectShape {
            ObjectShape::Object
        }
    }

    #[derive(Default)]
    struct Scanned(Vec<usize>);

    impl ScanOps for Scanned {
        fn scan_object(&mut self, obj: usize) {
            self.0.push(obj);
        }

        fn copy_or_mark(&mut self, _obj: usize, _slot: *mut usize) {}

        fn scan_value(&mut self, _obj: usize, _elem: usize, _size: usize) {}
    }

    fn world() -> WorldStopped {
        // SAFETY: single-threaded tests
        unsafe { WorldStopped::assume() }
    }

    fn scan_finds_written_object(mode: CardTableMode) {
        let f = Fixture::new(mode);
        let old = OneBlock {
            block: MajorBlock {
                start: f.base,
                size: 8192,
                object_size: 64,
                first_object_offset: 0,
            },
        };
        // SAFETY: slot lies inside the fixture memory
        unsafe { f.remset.set_field(f.base + 640, f.slot(648), NURSERY.start) };

        let mut ops = Scanned::default();
        f.remset.finish_scan_remsets(&world(), &old, &mut ops);
        assert_eq!(ops.0, (0..8).map(|i| f.base + 512 + i * 64).collect::<Vec<_>>());
        assert_eq!(f.remset.stats().scans, 1);

        let mut ops = Scanned::default();
        f.remset.finish_scan_remsets(&world(), &old, &mut ops);
        assert!(ops.0.is_empty());
    }

    #[test]
    fn test_finish_scan_remsets_direct() {
        scan_finds_written_object(CardTableMode::Direct);
    }

    #[test]
    fn test_finish_scan_remsets_overlapping() {
        scan_finds_written_object(CardTableMode::Overlapping { card_count_bits: 10 });
    }

    #[test]
    fn test_prepare_for_major_collection() {
        let f = Fixture::new(CardTableMode::Direct);
        let old = OneBlock {
            block: MajorBlock {
                start: f.base,
                size: 8192,
                object_size: 64,
                first_object_offset: 0,
            },
        };
        f.remset.generic_nostore(f.base + 100);
        f.remset.generic_nostore(f.base + 9000);
        f.remset.prepare_for_major_collection(&world(), &old);
        assert!(!f.remset.find_address(f.base + 100));
        // Outside the block
        assert!(f.remset.find_address(f.base + 9000));
    }
}
