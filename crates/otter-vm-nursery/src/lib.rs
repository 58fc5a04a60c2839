//! # Otter VM Nursery
//!
//! Young-generation allocation and old-to-young tracking for the generational
//! collector.
//!
//! ## Design
//!
//! - **Nursery**: Contiguous region split into fragments around pinned
//!   objects, allocated from lock-free by many threads
//! - **TLABs**: Per-thread bump buffers carved from the fragments
//! - **Card table**: One byte per card, dirtied by write barriers when an old
//!   object gains a reference into the nursery
//! - **Remembered set**: Dirty cards are replayed at each minor collection,
//!   scanning only the slots that can hold young references

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod barrier;
pub mod card_table;
pub mod cards;
pub mod config;
pub mod error;
pub mod fragment;
pub mod heap;
pub mod nursery;
pub mod safepoint;
pub mod scan;
pub mod stats;

pub use address::{ALLOC_ALIGN, AddressRange, WORD_SIZE};
pub use allocator::Allocator;
pub use barrier::{CardTableRemset, RememberedSet};
pub use card_table::{CardTable, DirectCardTable, OverlappingCardTable};
pub use cards::{CARD_CLEAN, CARD_DIRTY, CardGeometry};
pub use config::{CardTableMode, ClearPolicy, MIN_NURSERY_WASTE, NurseryConfig};
pub use error::{NurseryError, Result};
pub use fragment::FragmentAllocator;
pub use heap::{GcHeap, HeapStats};
pub use nursery::{FragmentBuild, Nursery};
pub use safepoint::WorldStopped;
pub use scan::{
    CardScanner, ElementKind, MajorBlock, ObjectShape, OldGeneration, ScanBuffers, ScanOps,
};
pub use stats::{AllocStats, CardScanStats};
