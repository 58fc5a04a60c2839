//! Nursery errors

use thiserror::Error;

/// Errors raised while setting up the nursery or the remembered set.
///
/// Only construction can fail. Allocation reports exhaustion through `Option`
/// and scanning through `bool`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NurseryError {
    /// Nursery size is zero or not a multiple of the allocation alignment
    #[error("Invalid nursery size: {0} bytes")]
    InvalidNurserySize(usize),

    /// Card shift outside the supported range
    #[error("Unsupported card bits: {0}")]
    InvalidCardBits(u32),

    /// Overlapping card table size outside the supported range
    #[error("Unsupported overlapping card count bits: {0}")]
    InvalidCardCountBits(u32),

    /// Waste threshold below `MIN_NURSERY_WASTE`
    #[error("Nursery waste threshold too small: {0} bytes")]
    InvalidWasteThreshold(usize),

    /// Scan start granularity is not a usable power of two
    #[error("Invalid scan start size: {0} bytes")]
    InvalidScanStartSize(usize),

    /// Object header larger than any sensible object
    #[error("Invalid object header size: {0} bytes")]
    InvalidHeaderSize(usize),

    /// TLAB minimum exceeds the desired TLAB size
    #[error("Invalid TLAB sizes: minimum {min} exceeds desired {desired}")]
    InvalidTlabSize {
        /// Minimum TLAB size
        min: usize,
        /// Desired TLAB size
        desired: usize,
    },

    /// Address range is empty, inverted or misaligned
    #[error("Invalid address range {start:#x}..{end:#x}")]
    InvalidBounds {
        /// Range start
        start: usize,
        /// Range end
        end: usize,
    },

    /// Backing memory for the nursery could not be reserved
    #[error("Out of memory reserving {size} bytes")]
    OutOfMemory {
        /// Requested size
        size: usize,
    },
}

/// Result type for nursery setup
pub type Result<T> = std::result::Result<T, NurseryError>;
