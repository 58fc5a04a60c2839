//! Address arithmetic shared by the nursery and the card table.

/// Allocation granularity. Every object start and size is a multiple of this.
pub const ALLOC_ALIGN: usize = 8;

/// Size of a heap reference slot.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    /// First address in the range
    pub start: usize,
    /// One past the last address
    pub end: usize,
}

impl AddressRange {
    /// Create a range; `start` must not exceed `end`.
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "inverted address range");
        Self { start, end }
    }

    /// Range covering `size` bytes starting at `start`.
    #[inline]
    pub fn with_size(start: usize, size: usize) -> Self {
        let Some(end) = start.checked_add(size) else {
            panic!("address range {start:#x}+{size} overflows the address space");
        };
        Self { start, end }
    }

    /// Size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    /// True when the range holds no bytes.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Check whether `addr` falls inside the range.
    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Smallest range covering both `self` and `other`.
    #[inline]
    pub fn union(&self, other: &AddressRange) -> AddressRange {
        AddressRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}
