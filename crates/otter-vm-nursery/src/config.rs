//! Nursery configuration
//!
//! Card geometry, fragment thresholds and TLAB sizing are construction-time
//! parameters. The defaults match the collector's historical tuning; none of
//! them is assumed optimal.

use crate::address::{ALLOC_ALIGN, WORD_SIZE};
use crate::error::{NurseryError, Result};

/// Default card shift (512-byte cards).
pub const DEFAULT_CARD_BITS: u32 = 9;

/// Default minimum size of a reusable fragment.
pub const DEFAULT_MAX_NURSERY_WASTE: usize = 512;

/// Smallest accepted waste threshold. Keeps the fragment arena at most half
/// the nursery size.
pub const MIN_NURSERY_WASTE: usize = 256;

/// Default granularity of the nursery scan-start table.
pub const DEFAULT_SCAN_START_SIZE: usize = 8 * 1024;

/// When free nursery memory is zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearPolicy {
    /// Fragments are zeroed while the collector builds them; allocation hands
    /// out memory as-is.
    ClearAtGc,
    /// Memory is zeroed when a TLAB or object is handed out. The collector
    /// zeroes unused fragment tails before conservative scanning.
    #[default]
    ClearAtTlabCreation,
}

/// Card table flavour selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardTableMode {
    /// One card per card-sized block of the covered heap range.
    #[default]
    Direct,
    /// Fixed table of `1 << card_count_bits` cards aliasing the whole address
    /// space, with a shadow copy used for scanning.
    Overlapping {
        /// Log2 of the number of cards
        card_count_bits: u32,
    },
}

/// Nursery and remembered-set configuration
#[derive(Debug, Clone)]
pub struct NurseryConfig {
    /// Size of the nursery region in bytes (default: 4MB)
    pub nursery_size: usize,
    /// Log2 of the card size (default: 9)
    pub card_bits: u32,
    /// Gaps and fragment tails below this size are not worth tracking (default: 512)
    ///
    /// The fragment list preallocates one cache-padded slot per
    /// `max_nursery_waste` bytes of nursery, so lowering it grows that arena
    /// proportionally. Must be at least [`MIN_NURSERY_WASTE`].
    pub max_nursery_waste: usize,
    /// Granularity of the scan-start table (default: 8KB)
    pub scan_start_size: usize,
    /// Zeroing policy (default: at TLAB creation)
    pub clear_policy: ClearPolicy,
    /// Card table flavour (default: direct)
    pub card_table_mode: CardTableMode,
    /// Bytes of object header preserved by `object_copy` (default: 2 words)
    pub object_header_size: usize,
    /// Desired TLAB size (default: 8KB)
    pub tlab_size: usize,
    /// Smallest TLAB worth taking (default: 512)
    pub tlab_min_size: usize,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            nursery_size: 4 * 1024 * 1024, // 4MB
            card_bits: DEFAULT_CARD_BITS,
            max_nursery_waste: DEFAULT_MAX_NURSERY_WASTE,
            scan_start_size: DEFAULT_SCAN_START_SIZE,
            clear_policy: ClearPolicy::default(),
            card_table_mode: CardTableMode::default(),
            object_header_size: 2 * WORD_SIZE,
            tlab_size: 8 * 1024,  // 8KB
            tlab_min_size: 512,
        }
    }
}

impl NurseryConfig {
    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.nursery_size == 0 || !self.nursery_size.is_multiple_of(ALLOC_ALIGN) {
            return Err(NurseryError::InvalidNurserySize(self.nursery_size));
        }
        if !(5..=16).contains(&self.card_bits) {
            return Err(NurseryError::InvalidCardBits(self.card_bits));
        }
        if let CardTableMode::Overlapping { card_count_bits } = self.card_table_mode
            && !(8..=28).contains(&card_count_bits)
        {
            return Err(NurseryError::InvalidCardCountBits(card_count_bits));
        }
        if self.max_nursery_waste < MIN_NURSERY_WASTE {
            return Err(NurseryError::InvalidWasteThreshold(self.max_nursery_waste));
        }
        if !self.scan_start_size.is_power_of_two() || self.scan_start_size < ALLOC_ALIGN {
            return Err(NurseryError::InvalidScanStartSize(self.scan_start_size));
        }
        if !self.object_header_size.is_multiple_of(WORD_SIZE)
            || self.object_header_size > self.tlab_size.max(ALLOC_ALIGN)
        {
            return Err(NurseryError::InvalidHeaderSize(self.object_header_size));
        }
        if self.tlab_min_size > self.tlab_size || self.tlab_min_size == 0 {
            return Err(NurseryError::InvalidTlabSize {
                min: self.tlab_min_size,
                desired: self.tlab_size,
            });
        }
        Ok(())
    }

    /// Card size in bytes.
    #[inline]
    pub fn card_size(&self) -> usize {
        1 << self.card_bits
    }
}
