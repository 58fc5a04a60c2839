//! Remembered-set card scanning
//!
//! After the nursery has been evacuated, the collector replays the
//! remembered set: every dirty card of the old generation is revisited and the
//! slots it covers that still reference nursery objects are handed to the
//! copying collector. The old generation itself is an external collaborator
//! described by [`OldGeneration`]; the copy/mark work goes through
//! [`ScanOps`].

use crate::address::{AddressRange, WORD_SIZE};
use crate::card_table::CardTable;
use crate::cards::{CardGeometry, any_marked, find_next_card};
use crate::stats::CardScanCounters;

/// Kind of array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Element is one heap reference
    Reference,
    /// Element is an inline value that may contain references
    Value,
}

/// Reference layout of an old-generation object, as far as card scanning
/// cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectShape {
    /// Holds no references; never scanned
    NoReferences,
    /// Ordinary object, scanned whole
    Object,
    /// Array scanned card by card
    Array {
        /// Offset of element 0 from the object start
        data_offset: usize,
        /// Size of one element
        element_size: usize,
        /// Element count
        length: usize,
        /// Element kind
        element: ElementKind,
    },
}

/// A major-heap block of equally sized object slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MajorBlock {
    /// Block start, card aligned
    pub start: usize,
    /// Block size in bytes
    pub size: usize,
    /// Size of every object slot in the block
    pub object_size: usize,
    /// Offset of the first object slot (block header size)
    pub first_object_offset: usize,
}

/// View of the old generation needed to replay the remembered set.
///
/// # Safety
///
/// Every block, large object and live object reported must be readable and
/// writable memory for the duration of the call that reports it, and
/// `shape` must describe the object's real layout: the scanner reads and
/// rewrites reference slots based on it.
pub unsafe trait OldGeneration {
    /// Visit every major-heap block.
    fn for_each_major_block(&self, f: &mut dyn FnMut(&MajorBlock));

    /// Whether the block slot at `addr` holds a live object.
    fn is_object_live(&self, addr: usize) -> bool;

    /// Visit every large object as `(start, size)`.
    fn for_each_large_object(&self, f: &mut dyn FnMut(usize, usize));

    /// Reference layout of the object at `addr`.
    fn shape(&self, addr: usize) -> ObjectShape;
}

/// Copy/mark callbacks of the running minor collection.
pub trait ScanOps {
    /// Scan every reference of the object at `obj`.
    fn scan_object(&mut self, obj: usize);

    /// Copy or mark the nursery object referenced from `slot`, rewriting the
    /// slot if the object moved. `obj` is the object containing the slot.
    fn copy_or_mark(&mut self, obj: usize, slot: *mut usize);

    /// Scan the references inside the inline value at `elem`.
    fn scan_value(&mut self, obj: usize, elem: usize, size: usize);
}

/// Scratch buffers reused across scans.
#[derive(Debug, Default)]
pub struct ScanBuffers {
    block_cards: Vec<u8>,
    object_cards: Vec<u8>,
}

#[derive(Clone, Copy)]
struct ScanContext<'a> {
    table: &'a dyn CardTable,
    geometry: CardGeometry,
    nursery: AddressRange,
    counters: &'a CardScanCounters,
}

/// Element layout of one array being scanned.
#[derive(Clone, Copy)]
struct ArrayLayout {
    obj: usize,
    data_offset: usize,
    element_size: usize,
    length: usize,
    element: ElementKind,
}

impl ScanContext<'_> {
    /// Scan the array elements covered by dirty cards. `extra_idx` is the
    /// index of `cards[0]` relative to the first card of the array.
    fn scan_array_cards(
        &self,
        ops: &mut dyn ScanOps,
        array: ArrayLayout,
        cards: &[u8],
        extra_idx: usize,
    ) -> usize {
        let ArrayLayout {
            obj,
            data_offset,
            element_size,
            length,
            element,
        } = array;
        assert!(element_size > 0, "zero-sized array element at {obj:#x}");
        debug_assert!(element != ElementKind::Reference || element_size == WORD_SIZE);

        let card_size = self.geometry.card_size();
        let obj_card = self.geometry.align_down(obj);
        let data = obj + data_offset;
        let data_end = data + length * element_size;

        let mut marked = 0;
        let mut i = find_next_card(cards, 0);
        while i < cards.len() {
            marked += 1;
            let start = obj_card + (i + extra_idx) * card_size;
            let card_end = (start + card_size).min(data_end);
            let index = if start <= data {
                0
            } else {
                (start - data) / element_size
            };
            let mut elem = data + index * element_size;
            match element {
                ElementKind::Value => {
                    while elem < card_end {
                        ops.scan_value(obj, elem, element_size);
                        elem += element_size;
                    }
                }
                ElementKind::Reference => {
                    while elem < card_end {
                        self.scan_reference_slot(ops, obj, elem);
                        elem += element_size;
                    }
                }
            }
            i = find_next_card(cards, i + 1);
        }
        marked
    }

    /// Forward a slot that still points into the nursery, and dirty its card
    /// again if the referent stayed young.
    fn scan_reference_slot(&self, ops: &mut dyn ScanOps, obj: usize, slot_addr: usize) {
        let slot = slot_addr as *mut usize;
        // SAFETY: `OldGeneration` guarantees the object memory is accessible
        // while it is being scanned.
        let value = unsafe { slot.read() };
        if !self.nursery.contains(value) {
            return;
        }
        ops.copy_or_mark(obj, slot);
        // SAFETY: as above
        let updated = unsafe { slot.read() };
        if self.nursery.contains(updated) {
            self.table.mark(slot_addr);
            self.counters.remarked();
        }
    }
}

/// Replays dirty cards over the old generation.
pub struct CardScanner<'a> {
    ctx: ScanContext<'a>,
    buffers: &'a mut ScanBuffers,
}

impl<'a> CardScanner<'a> {
    /// Scanner over `table` for a nursery at `nursery`.
    pub fn new(
        table: &'a dyn CardTable,
        nursery: AddressRange,
        counters: &'a CardScanCounters,
        buffers: &'a mut ScanBuffers,
    ) -> Self {
        Self {
            ctx: ScanContext {
                table,
                geometry: table.geometry(),
                nursery,
                counters,
            },
            buffers,
        }
    }

    /// Rescan the parts of one object covered by dirty cards.
    ///
    /// `cards` holds card data starting at the card of `obj`, already taken
    /// out of the table and counted by a block scan; `None` reads the table
    /// directly.
    pub fn cardtable_scan_object(
        &mut self,
        old: &dyn OldGeneration,
        ops: &mut dyn ScanOps,
        obj: usize,
        size: usize,
        cards: Option<&[u8]>,
    ) {
        let ctx = self.ctx;
        match old.shape(obj) {
            ObjectShape::NoReferences => {}
            ObjectShape::Array {
                data_offset,
                element_size,
                length,
                element,
            } => {
                ctx.counters.object_scanned();
                let array = ArrayLayout {
                    obj,
                    data_offset,
                    element_size,
                    length,
                    element,
                };
                let count = ctx.geometry.cards_in_range(obj, size);
                match cards {
                    // Counted by the block scan that owns these cards
                    Some(cards) => {
                        let cards = &cards[..count.min(cards.len())];
                        ctx.scan_array_cards(ops, array, cards, 0);
                    }
                    None => {
                        let mut marked = 0;
                        ctx.table.visit_scan_cards(
                            obj,
                            size,
                            &mut self.buffers.object_cards,
                            &mut |cards, extra_idx| {
                                marked += ctx.scan_array_cards(ops, array, cards, extra_idx);
                            },
                        );
                        ctx.counters.add_cards(count, marked);
                    }
                }
            }
            ObjectShape::Object => {
                let count = ctx.geometry.cards_in_range(obj, size);
                let dirty = match cards {
                    Some(cards) => any_marked(&cards[..count.min(cards.len())]),
                    None => {
                        let dirty = ctx.table.region_begin_scanning(obj, size);
                        ctx.counters.add_cards(count, usize::from(dirty));
                        dirty
                    }
                };
                if dirty {
                    ctx.counters.object_scanned();
                    ops.scan_object(obj);
                }
            }
        }
    }

    /// Rescan the dirty cards of one major-heap block.
    pub fn scan_major_block(
        &mut self,
        old: &dyn OldGeneration,
        ops: &mut dyn ScanOps,
        block: &MajorBlock,
    ) {
        let geometry = self.ctx.geometry;
        let card_size = geometry.card_size();
        assert!(block.object_size > 0, "block {:#x} with empty slots", block.start);

        let mut cards = std::mem::take(&mut self.buffers.block_cards);
        cards.clear();
        cards.resize(geometry.cards_in_range(block.start, block.size), 0);
        self.ctx.table.get_card_data(&mut cards, block.start);

        let block_card = geometry.align_down(block.start);
        let first_obj = block.start + block.first_object_offset;
        let block_end = block.start + block.size;
        let header_cards = geometry.card_offset(first_obj, block_card);
        let small_objects = block.object_size < card_size;

        let body = cards.get(header_cards..).unwrap_or_default();
        let scanned = body.len();
        let marked = body.iter().filter(|&&card| card != 0).count();

        let mut scan_front = first_obj;
        let mut idx = find_next_card(&cards, header_cards);
        while idx < cards.len() {
            let start = block_card + idx * card_size;
            let end = start + card_size;
            let first_index = if start <= first_obj {
                0
            } else {
                (start - first_obj) / block.object_size
            };
            let mut obj = first_obj + first_index * block.object_size;

            while obj < end && obj + block.object_size <= block_end {
                if obj >= scan_front && old.is_object_live(obj) {
                    if small_objects {
                        if old.shape(obj) != ObjectShape::NoReferences {
                            self.ctx.counters.object_scanned();
                            ops.scan_object(obj);
                        }
                    } else {
                        let offset = geometry.card_offset(obj, block_card);
                        self.cardtable_scan_object(
                            old,
                            ops,
                            obj,
                            block.object_size,
                            Some(&cards[offset..]),
                        );
                    }
                }
                obj += block.object_size;
                scan_front = obj;
            }

            idx = if small_objects {
                idx + 1
            } else {
                geometry.card_offset(obj, block_card).max(idx + 1)
            };
            idx = find_next_card(&cards, idx);
        }

        self.ctx.counters.add_cards(scanned, marked);
        self.buffers.block_cards = cards;
    }

    /// Rescan every major-heap block.
    pub fn scan_major_heap(&mut self, old: &dyn OldGeneration, ops: &mut dyn ScanOps) {
        let mut blocks = Vec::new();
        old.for_each_major_block(&mut |block| blocks.push(*block));
        for block in &blocks {
            self.scan_major_block(old, ops, block);
        }
    }

    /// Rescan every large object.
    pub fn scan_large_objects(&mut self, old: &dyn OldGeneration, ops: &mut dyn ScanOps) {
        let mut objects = Vec::new();
        old.for_each_large_object(&mut |addr, size| objects.push((addr, size)));
        for (addr, size) in objects {
            self.cardtable_scan_object(old, ops, addr, size, None);
        }
    }
}
