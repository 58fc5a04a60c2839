//! Allocation and card-scan counters
//!
//! Counters are bumped with relaxed atomics from any thread and read back as
//! plain snapshot structs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live allocation counters.
#[derive(Debug, Default)]
pub struct AllocCounters {
    alloc_requests: AtomicU64,
    alloc_retries: AtomicU64,
    range_requests: AtomicU64,
    range_retries: AtomicU64,
    fragments_retired: AtomicU64,
    trailer_bytes_wasted: AtomicU64,
    gap_bytes_wasted: AtomicU64,
    last_fragment_total: AtomicU64,
    builds: AtomicU64,
}

impl AllocCounters {
    #[inline]
    pub(crate) fn alloc_request(&self) {
        self.alloc_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn alloc_retry(&self) {
        self.alloc_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn range_request(&self) {
        self.range_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn range_retry(&self) {
        self.range_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn fragment_retired(&self, trailer: usize) {
        self.fragments_retired.fetch_add(1, Ordering::Relaxed);
        self.trailer_bytes_wasted
            .fetch_add(trailer as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_build(&self, fragment_total: usize, gap_waste: usize) {
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.last_fragment_total
            .store(fragment_total as u64, Ordering::Relaxed);
        self.gap_bytes_wasted
            .fetch_add(gap_waste as u64, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> AllocStats {
        AllocStats {
            alloc_requests: self.alloc_requests.load(Ordering::Relaxed),
            alloc_retries: self.alloc_retries.load(Ordering::Relaxed),
            range_requests: self.range_requests.load(Ordering::Relaxed),
            range_retries: self.range_retries.load(Ordering::Relaxed),
            fragments_retired: self.fragments_retired.load(Ordering::Relaxed),
            trailer_bytes_wasted: self.trailer_bytes_wasted.load(Ordering::Relaxed),
            gap_bytes_wasted: self.gap_bytes_wasted.load(Ordering::Relaxed),
            last_fragment_total: self.last_fragment_total.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
        }
    }
}

/// Nursery allocation statistics
#[derive(Debug, Default, Clone)]
pub struct AllocStats {
    /// `alloc` calls
    pub alloc_requests: u64,
    /// Failed cursor CAS attempts in `alloc`
    pub alloc_retries: u64,
    /// `alloc_range` calls
    pub range_requests: u64,
    /// Restarts of `alloc_range`
    pub range_retries: u64,
    /// Fragments removed from the allocation list
    pub fragments_retired: u64,
    /// Bytes left behind in retired fragments
    pub trailer_bytes_wasted: u64,
    /// Bytes in gaps too small to become fragments, over all builds
    pub gap_bytes_wasted: u64,
    /// Free bytes produced by the last fragment build
    pub last_fragment_total: u64,
    /// Fragment builds performed
    pub builds: u64,
}

/// Live card-scan counters.
#[derive(Debug, Default)]
pub struct CardScanCounters {
    cards_scanned: AtomicU64,
    marked_cards: AtomicU64,
    remarked_cards: AtomicU64,
    objects_scanned: AtomicU64,
    scans: AtomicU64,
    last_major_nanos: AtomicU64,
    last_los_nanos: AtomicU64,
    total_major_nanos: AtomicU64,
    total_los_nanos: AtomicU64,
}

impl CardScanCounters {
    pub(crate) fn add_cards(&self, scanned: usize, marked: usize) {
        self.cards_scanned
            .fetch_add(scanned as u64, Ordering::Relaxed);
        self.marked_cards.fetch_add(marked as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn remarked(&self) {
        self.remarked_cards.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn object_scanned(&self) {
        self.objects_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self, major: Duration, los: Duration) {
        let major = major.as_nanos() as u64;
        let los = los.as_nanos() as u64;
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.last_major_nanos.store(major, Ordering::Relaxed);
        self.last_los_nanos.store(los, Ordering::Relaxed);
        self.total_major_nanos.fetch_add(major, Ordering::Relaxed);
        self.total_los_nanos.fetch_add(los, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> CardScanStats {
        CardScanStats {
            cards_scanned: self.cards_scanned.load(Ordering::Relaxed),
            marked_cards: self.marked_cards.load(Ordering::Relaxed),
            remarked_cards: self.remarked_cards.load(Ordering::Relaxed),
            objects_scanned: self.objects_scanned.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            last_major_time: Duration::from_nanos(self.last_major_nanos.load(Ordering::Relaxed)),
            last_los_time: Duration::from_nanos(self.last_los_nanos.load(Ordering::Relaxed)),
            total_major_time: Duration::from_nanos(self.total_major_nanos.load(Ordering::Relaxed)),
            total_los_time: Duration::from_nanos(self.total_los_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Remembered-set scan statistics
#[derive(Debug, Default, Clone)]
pub struct CardScanStats {
    /// Cards inspected
    pub cards_scanned: u64,
    /// Inspected cards that were dirty
    pub marked_cards: u64,
    /// Cards dirtied again because a slot still points into the nursery
    pub remarked_cards: u64,
    /// Objects handed to the scanner
    pub objects_scanned: u64,
    /// Completed remembered-set scans
    pub scans: u64,
    /// Major-heap scan time of the last scan
    pub last_major_time: Duration,
    /// Large-object scan time of the last scan
    pub last_los_time: Duration,
    /// Major-heap scan time over all scans
    pub total_major_time: Duration,
    /// Large-object scan time over all scans
    pub total_los_time: Duration,
}
