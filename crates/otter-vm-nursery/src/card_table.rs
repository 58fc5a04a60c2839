//! Card tables
//!
//! A card table holds one byte per card. Mutators dirty cards through the
//! write barriers; the collector reads and clears them while replaying the
//! remembered set. Two layouts implement the same [`CardTable`] interface:
//!
//! - [`DirectCardTable`] covers one heap range with one card per card-sized
//!   block. Scanning reads and clears the primary table directly.
//! - [`OverlappingCardTable`] is a fixed-size table indexed by card number
//!   modulo its length, so it covers the whole address space with distant
//!   cards aliasing each other. Before a scan the collector moves dirty cards
//!   into a shadow table and scans that, leaving the primary table free for
//!   mutators.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

use crate::address::AddressRange;
use crate::cards::{CARD_CLEAN, CARD_DIRTY, CardGeometry};
use crate::error::{NurseryError, Result};

/// Card marking and scanning primitives shared by both table layouts.
///
/// Marking and the `is_*` queries may run concurrently with mutators. The
/// scanning entry points (`region_begin_scanning`, `get_card_data`,
/// `visit_scan_cards`, `move_to_shadow`, `clear_*`) are only called by the
/// collector while mutators are parked.
pub trait CardTable: Send + Sync {
    /// Card size description.
    fn geometry(&self) -> CardGeometry;

    /// Dirty the card containing `addr`.
    fn mark(&self, addr: usize);

    /// Dirty every card overlapping `[addr, addr + size)`.
    fn mark_range(&self, addr: usize, size: usize);

    /// Check whether any card overlapping `[addr, addr + size)` is dirty.
    fn is_range_marked(&self, addr: usize, size: usize) -> bool;

    /// Check whether the card containing `addr` is dirty.
    fn find_address(&self, addr: usize) -> bool;

    /// Report whether any card of `[addr, addr + size)` is dirty in the scan
    /// view, consuming the marks where the layout allows it.
    fn region_begin_scanning(&self, addr: usize, size: usize) -> bool;

    /// Copy the scan view of `dest.len()` cards starting at the card of
    /// `addr` into `dest`.
    fn get_card_data(&self, dest: &mut [u8], addr: usize);

    /// Hand the scan view of the cards overlapping `[addr, addr + size)` to
    /// `f`, possibly in several contiguous segments. The second argument of
    /// `f` is the index, relative to the first card of the range, of the
    /// segment's first card.
    fn visit_scan_cards(
        &self,
        addr: usize,
        size: usize,
        scratch: &mut Vec<u8>,
        f: &mut dyn FnMut(&[u8], usize),
    );

    /// Whether scans read a separate shadow table.
    fn has_shadow(&self) -> bool {
        false
    }

    /// Reset the shadow table before a round of `move_to_shadow` calls.
    fn clear_shadow(&self) {}

    /// Move the dirty cards of `[addr, addr + size)` into the shadow table.
    fn move_to_shadow(&self, _addr: usize, _size: usize) {}

    /// Clear the primary cards of `[addr, addr + size)`.
    fn clear_range(&self, addr: usize, size: usize);

    /// Clear every card.
    fn clear_all(&self);

    /// Number of dirty cards in the primary table.
    fn dirty_count(&self) -> usize;
}

/// Card table over a single heap range.
pub struct DirectCardTable {
    geometry: CardGeometry,
    /// Card-aligned start of the covered range
    base: usize,
    cards: Box<[AtomicU8]>,
}

impl DirectCardTable {
    /// Create a table covering `heap`.
    pub fn new(geometry: CardGeometry, heap: AddressRange) -> Result<Self> {
        if heap.is_empty() {
            return Err(NurseryError::InvalidBounds {
                start: heap.start,
                end: heap.end,
            });
        }
        let base = geometry.align_down(heap.start);
        let count = geometry.cards_in_range(base, heap.end - base);
        Ok(Self {
            geometry,
            base,
            cards: new_cards(count),
        })
    }

    /// Number of cards in the table.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table has no cards.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    #[inline]
    fn index(&self, addr: usize) -> usize {
        assert!(
            addr >= self.base,
            "card address {addr:#x} below table base {:#x}",
            self.base
        );
        let idx = (addr - self.base) >> self.geometry.bits();
        assert!(
            idx < self.cards.len(),
            "card index {idx} out of bounds for address {addr:#x}"
        );
        idx
    }

    #[inline]
    fn range(&self, addr: usize, size: usize) -> Range<usize> {
        let first = self.index(addr);
        let count = self.geometry.cards_in_range(addr, size);
        assert!(
            first + count <= self.cards.len(),
            "card range {addr:#x}+{size} runs past the table"
        );
        first..first + count
    }
}

impl CardTable for DirectCardTable {
    fn geometry(&self) -> CardGeometry {
        self.geometry
    }

    #[inline]
    fn mark(&self, addr: usize) {
        self.cards[self.index(addr)].store(CARD_DIRTY, Ordering::Relaxed);
    }

    fn mark_range(&self, addr: usize, size: usize) {
        for card in &self.cards[self.range(addr, size)] {
            card.store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    fn is_range_marked(&self, addr: usize, size: usize) -> bool {
        self.cards[self.range(addr, size)]
            .iter()
            .any(|card| card.load(Ordering::Relaxed) != CARD_CLEAN)
    }

    fn find_address(&self, addr: usize) -> bool {
        self.cards[self.index(addr)].load(Ordering::Relaxed) != CARD_CLEAN
    }

    fn region_begin_scanning(&self, addr: usize, size: usize) -> bool {
        let mut dirty = false;
        for card in &self.cards[self.range(addr, size)] {
            dirty |= card.swap(CARD_CLEAN, Ordering::Relaxed) != CARD_CLEAN;
        }
        dirty
    }

    fn get_card_data(&self, dest: &mut [u8], addr: usize) {
        let first = self.index(addr);
        assert!(
            first + dest.len() <= self.cards.len(),
            "card data request runs past the table"
        );
        for (out, card) in dest.iter_mut().zip(&self.cards[first..]) {
            *out = card.swap(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    fn visit_scan_cards(
        &self,
        addr: usize,
        size: usize,
        scratch: &mut Vec<u8>,
        f: &mut dyn FnMut(&[u8], usize),
    ) {
        scratch.clear();
        scratch.extend(
            self.cards[self.range(addr, size)]
                .iter()
                .map(|card| card.swap(CARD_CLEAN, Ordering::Relaxed)),
        );
        f(scratch, 0);
    }

    fn clear_range(&self, addr: usize, size: usize) {
        for card in &self.cards[self.range(addr, size)] {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    fn dirty_count(&self) -> usize {
        count_dirty(&self.cards)
    }
}

/// Fixed-size card table aliasing the whole address space, with a shadow
/// table for scanning.
pub struct OverlappingCardTable {
    geometry: CardGeometry,
    mask: usize,
    cards: Box<[AtomicU8]>,
    shadow: RwLock<Box<[u8]>>,
}

impl OverlappingCardTable {
    /// Create a table of `1 << card_count_bits` cards.
    pub fn new(geometry: CardGeometry, card_count_bits: u32) -> Result<Self> {
        if !(8..=28).contains(&card_count_bits) {
            return Err(NurseryError::InvalidCardCountBits(card_count_bits));
        }
        let count = 1usize << card_count_bits;
        Ok(Self {
            geometry,
            mask: count - 1,
            cards: new_cards(count),
            shadow: RwLock::new(vec![CARD_CLEAN; count].into_boxed_slice()),
        })
    }

    /// Number of cards in the table.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table has no cards.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    #[inline]
    fn index(&self, addr: usize) -> usize {
        self.geometry.card_number(addr) & self.mask
    }

    /// Split `count` cards starting at the card of `addr` into runs that do
    /// not wrap past the end of the table. `f` gets each run and the offset of
    /// its first card from the start of the whole range.
    fn for_each_segment(&self, addr: usize, count: usize, mut f: impl FnMut(Range<usize>, usize)) {
        let len = self.cards.len();
        let mut idx = self.index(addr);
        let mut done = 0;
        while done < count {
            let run = (count - done).min(len - idx);
            f(idx..idx + run, done);
            done += run;
            idx = 0;
        }
    }

    /// Cards touched by a range, capped at one full pass over the table.
    #[inline]
    fn distinct_cards(&self, addr: usize, size: usize) -> usize {
        self.geometry.cards_in_range(addr, size).min(self.cards.len())
    }
}

impl CardTable for OverlappingCardTable {
    fn geometry(&self) -> CardGeometry {
        self.geometry
    }

    #[inline]
    fn mark(&self, addr: usize) {
        self.cards[self.index(addr)].store(CARD_DIRTY, Ordering::Relaxed);
    }

    fn mark_range(&self, addr: usize, size: usize) {
        self.for_each_segment(addr, self.distinct_cards(addr, size), |run, _| {
            for card in &self.cards[run] {
                card.store(CARD_DIRTY, Ordering::Relaxed);
            }
        });
    }

    fn is_range_marked(&self, addr: usize, size: usize) -> bool {
        let mut dirty = false;
        self.for_each_segment(addr, self.distinct_cards(addr, size), |run, _| {
            dirty = dirty
                || self.cards[run]
                    .iter()
                    .any(|card| card.load(Ordering::Relaxed) != CARD_CLEAN);
        });
        dirty
    }

    fn find_address(&self, addr: usize) -> bool {
        self.cards[self.index(addr)].load(Ordering::Relaxed) != CARD_CLEAN
    }

    /// Reads the shadow table without clearing it: aliased cards may still be
    /// needed by other objects during the same scan.
    fn region_begin_scanning(&self, addr: usize, size: usize) -> bool {
        let shadow = self.shadow.read();
        let mut dirty = false;
        self.for_each_segment(addr, self.distinct_cards(addr, size), |run, _| {
            dirty = dirty || shadow[run].iter().any(|&card| card != CARD_CLEAN);
        });
        dirty
    }

    fn get_card_data(&self, dest: &mut [u8], addr: usize) {
        let shadow = self.shadow.read();
        self.for_each_segment(addr, dest.len(), |run, offset| {
            dest[offset..offset + run.len()].copy_from_slice(&shadow[run]);
        });
    }

    fn visit_scan_cards(
        &self,
        addr: usize,
        size: usize,
        _scratch: &mut Vec<u8>,
        f: &mut dyn FnMut(&[u8], usize),
    ) {
        let shadow = self.shadow.read();
        let count = self.geometry.cards_in_range(addr, size);
        self.for_each_segment(addr, count, |run, offset| f(&shadow[run], offset));
    }

    fn has_shadow(&self) -> bool {
        true
    }

    fn clear_shadow(&self) {
        self.shadow.write().fill(CARD_CLEAN);
    }

    fn move_to_shadow(&self, addr: usize, size: usize) {
        let mut shadow = self.shadow.write();
        self.for_each_segment(addr, self.distinct_cards(addr, size), |run, _| {
            for idx in run {
                // Aliased ranges may already have moved this card.
                let card = self.cards[idx].swap(CARD_CLEAN, Ordering::Relaxed);
                if card != CARD_CLEAN {
                    shadow[idx] = card;
                }
            }
        });
    }

    fn clear_range(&self, addr: usize, size: usize) {
        self.for_each_segment(addr, self.distinct_cards(addr, size), |run, _| {
            for card in &self.cards[run] {
                card.store(CARD_CLEAN, Ordering::Relaxed);
            }
        });
    }

    fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
        self.clear_shadow();
    }

    fn dirty_count(&self) -> usize {
        count_dirty(&self.cards)
    }
}

fn new_cards(count: usize) -> Box<[AtomicU8]> {
    (0..count).map(|_| AtomicU8::new(CARD_CLEAN)).collect()
}

fn count_dirty(cards: &[AtomicU8]) -> usize {
    cards
        .iter()
        .filter(|card| card.load(Ordering::Relaxed) != CARD_CLEAN)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(start: usize, size: usize) -> DirectCardTable {
        DirectCardTable::new(CardGeometry::new(9), AddressRange::with_size(start, size)).unwrap()
    }

    fn collect_scan_cards(table: &dyn CardTable, addr: usize, size: usize) -> Vec<(usize, u8)> {
        let mut scratch = Vec::new();
        let mut out = Vec::new();
        table.visit_scan_cards(addr, size, &mut scratch, &mut |cards, offset| {
            for (i, &card) in cards.iter().enumerate() {
                out.push((offset + i, card));
            }
        });
        out
    }

    #[test]
    fn test_mark_single_card() {
        let table = direct(0, 64 * 1024);
        table.mark(512);

        assert!(table.find_address(512));
        assert!(table.find_address(1023));
        assert!(!table.find_address(0));
        assert!(!table.is_range_marked(0, 512));
        assert!(table.is_range_marked(512, 1));
        assert!(table.is_range_marked(0, 513));
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn test_mark_range_spans_cards() {
        let table = direct(0x10000, 64 * 1024);
        table.mark_range(0x10000 + 500, 24);
        assert_eq!(table.dirty_count(), 2);
        assert!(table.find_address(0x10000));
        assert!(table.find_address(0x10000 + 512));
        assert!(!table.find_address(0x10000 + 1024));
    }

    #[test]
    fn test_unaligned_heap_base() {
        // Base is rounded down to a card boundary
        let table = direct(0x10000 + 100, 1000);
        assert_eq!(table.len(), 3);
        table.mark(0x10000 + 100);
        table.mark(0x10000 + 1099);
        assert_eq!(table.dirty_count(), 2);
    }

    #[test]
    fn test_region_begin_scanning_clears() {
        let table = direct(0, 64 * 1024);
        table.mark(4096);
        table.mark(8192);

        assert!(table.region_begin_scanning(4096, 8192));
        assert!(!table.region_begin_scanning(4096, 8192));
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_get_card_data_copies_and_clears() {
        let table = direct(0, 64 * 1024);
        table.mark(1024);
        table.mark(3000);

        let mut cards = [0u8; 8];
        table.get_card_data(&mut cards, 0);
        assert_eq!(cards, [0, 0, 1, 0, 0, 1, 0, 0]);
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_direct_visit_single_segment() {
        let table = direct(0, 64 * 1024);
        table.mark(600);
        let cards = collect_scan_cards(&table, 0, 2048);
        assert_eq!(cards, vec![(0, 0), (1, 1), (2, 0), (3, 0)]);
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_mark_outside_table_panics() {
        let table = direct(0, 4096);
        table.mark(8192);
    }

    #[test]
    fn test_overlapping_aliases() {
        let table = OverlappingCardTable::new(CardGeometry::new(9), 8).unwrap();
        let span = 512 * 256;
        table.mark(1024);
        // Same card index one table span later
        assert!(table.find_address(1024 + span));
        assert!(table.is_range_marked(span, 2048));
    }

    #[test]
    fn test_overlapping_shadow_scan() {
        let table = OverlappingCardTable::new(CardGeometry::new(9), 8).unwrap();
        table.mark(2048);
        assert!(!table.region_begin_scanning(2048, 1));

        table.clear_shadow();
        table.move_to_shadow(0, 4096);
        assert_eq!(table.dirty_count(), 0);
        assert!(table.region_begin_scanning(2048, 1));
        // Shadow reads do not consume marks
        assert!(table.region_begin_scanning(2048, 1));

        // Mutators may dirty the primary table during the scan
        table.mark(0);
        assert!(!table.region_begin_scanning(0, 1));
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn test_overlapping_aliased_move_keeps_marks() {
        let table = OverlappingCardTable::new(CardGeometry::new(9), 8).unwrap();
        let span = 512 * 256;
        table.mark(512);
        table.clear_shadow();
        table.move_to_shadow(0, 4096);
        // Aliased range maps onto the already-moved card
        table.move_to_shadow(span, 4096);
        assert!(table.region_begin_scanning(512, 1));
    }

    #[test]
    fn test_overlapping_wrap() {
        let table = OverlappingCardTable::new(CardGeometry::new(9), 8).unwrap();
        let len = table.len();
        // Range covering the last two and first two cards of the table
        let start = (len - 2) * 512;
        table.mark(start);
        table.mark(start + 3 * 512);
        table.clear_shadow();
        table.move_to_shadow(start, 4 * 512);

        let cards = collect_scan_cards(&table, start, 4 * 512);
        assert_eq!(cards, vec![(0, 1), (1, 0), (2, 0), (3, 1)]);

        let mut data = [0u8; 4];
        table.get_card_data(&mut data, start);
        assert_eq!(data, [1, 0, 0, 1]);
    }

    #[test]
    fn test_overlapping_rejects_bad_size() {
        assert!(OverlappingCardTable::new(CardGeometry::new(9), 4).is_err());
    }

    #[test]
    fn test_clear_all() {
        let table = direct(0, 64 * 1024);
        table.mark_range(0, 64 * 1024);
        assert_eq!(table.dirty_count(), table.len());
        table.clear_all();
        assert_eq!(table.dirty_count(), 0);
    }
}
