//! Card-range arithmetic.
//!
//! A card is a `1 << card_bits` byte, card-aligned block of address space.
//! Both card table flavours, the barriers and the scanner agree on the
//! helpers in this module, so an object's card span is computed the same way
//! when it is marked and when it is scanned.

use crate::address::{WORD_SIZE, align_down};

/// Card state values.
pub const CARD_CLEAN: u8 = 0;
/// Dirty card: may hold a reference into the nursery.
pub const CARD_DIRTY: u8 = 1;

/// Card size description derived from `CARD_BITS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardGeometry {
    bits: u32,
}

impl CardGeometry {
    /// Geometry for `1 << bits` byte cards.
    #[inline]
    pub const fn new(bits: u32) -> Self {
        assert!(bits > 0 && bits < usize::BITS, "card bits out of range");
        Self { bits }
    }

    /// Log2 of the card size.
    #[inline]
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Card size in bytes.
    #[inline]
    pub const fn card_size(&self) -> usize {
        1 << self.bits
    }

    /// Absolute card number of `addr` (its index in an address-space-wide table).
    #[inline]
    pub const fn card_number(&self, addr: usize) -> usize {
        addr >> self.bits
    }

    /// Start of the card containing `addr`.
    #[inline]
    pub const fn align_down(&self, addr: usize) -> usize {
        align_down(addr, self.card_size())
    }

    /// Number of cards overlapping `[addr, addr + size)`.
    ///
    /// A zero-sized range still touches the card holding `addr`.
    #[inline]
    pub fn cards_in_range(&self, addr: usize, size: usize) -> usize {
        let Some(last) = addr.checked_add(size.max(1) - 1) else {
            panic!("card range {addr:#x}+{size} overflows the address space");
        };
        (last >> self.bits) - (addr >> self.bits) + 1
    }

    /// Index of the card holding `addr`, counted from the card holding `base`.
    #[inline]
    pub fn card_offset(&self, addr: usize, base: usize) -> usize {
        assert!(addr >= base, "card offset below its base");
        (addr >> self.bits) - (base >> self.bits)
    }
}

/// Index of the first dirty card in `cards` at or after `from`.
///
/// Returns `cards.len()` when every remaining card is clean. Unaligned edges
/// are checked byte by byte, the aligned interior one word at a time.
pub fn find_next_card(cards: &[u8], from: usize) -> usize {
    if from >= cards.len() {
        return cards.len();
    }
    let tail = &cards[from..];
    // SAFETY: any bit pattern is a valid usize, and align_to only hands out
    // the properly aligned middle of the slice.
    let (head, words, rest) = unsafe { tail.align_to::<usize>() };

    if let Some(i) = head.iter().position(|&card| card != CARD_CLEAN) {
        return from + i;
    }
    let mut offset = from + head.len();
    for &word in words {
        if word != 0 {
            // Little-endian view puts the lowest address in the low byte.
            let byte = usize::from_le(word).trailing_zeros() as usize / 8;
            return offset + byte;
        }
        offset += WORD_SIZE;
    }
    match rest.iter().position(|&card| card != CARD_CLEAN) {
        Some(i) => offset + i,
        None => cards.len(),
    }
}

/// Check whether any card in the slice is dirty.
#[inline]
pub fn any_marked(cards: &[u8]) -> bool {
    find_next_card(cards, 0) < cards.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cards_in_range() {
        let geometry = CardGeometry::new(9);
        assert_eq!(geometry.card_size(), 512);

        assert_eq!(geometry.cards_in_range(0, 0), 1);
        assert_eq!(geometry.cards_in_range(0, 1), 1);
        assert_eq!(geometry.cards_in_range(0, 512), 1);
        assert_eq!(geometry.cards_in_range(0, 513), 2);
        // Straddles a card boundary
        assert_eq!(geometry.cards_in_range(500, 24), 2);
        assert_eq!(geometry.cards_in_range(511, 1), 1);
        assert_eq!(geometry.cards_in_range(511, 2), 2);
    }

    #[test]
    fn test_card_offset() {
        let geometry = CardGeometry::new(9);
        assert_eq!(geometry.card_offset(0x1000, 0x1000), 0);
        assert_eq!(geometry.card_offset(0x1000 + 1023, 0x1000), 1);
        assert_eq!(geometry.card_number(512), 1);
        assert_eq!(geometry.align_down(1000), 512);
    }

    #[test]
    fn test_find_next_card_every_position() {
        // Exercise unaligned heads, word interiors and tails
        let mut backing = vec![0u8; 80];
        for start in 0..8 {
            let cards = &mut backing[start..start + 64];
            for dirty in 0..cards.len() {
                cards.fill(CARD_CLEAN);
                cards[dirty] = CARD_DIRTY;
                assert_eq!(find_next_card(cards, 0), dirty);
                assert_eq!(find_next_card(cards, dirty), dirty);
                assert_eq!(find_next_card(cards, dirty + 1), cards.len());
            }
        }
    }

    #[test]
    fn test_find_next_card_clean() {
        let cards = [0u8; 37];
        assert_eq!(find_next_card(&cards, 0), 37);
        assert_eq!(find_next_card(&cards, 100), 37);
        assert!(!any_marked(&cards));
    }

    #[test]
    fn test_find_next_card_multiple() {
        let mut cards = [0u8; 40];
        cards[3] = CARD_DIRTY;
        cards[17] = CARD_DIRTY;
        cards[39] = CARD_DIRTY;

        let mut found = Vec::new();
        let mut i = find_next_card(&cards, 0);
        while i < cards.len() {
            found.push(i);
            i = find_next_card(&cards, i + 1);
        }
        assert_eq!(found, vec![3, 17, 39]);
    }
}
