//! Stream operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for stream hot paths.
///
/// Updated with relaxed atomics; read through [`StreamStats::snapshot`].
#[derive(Debug, Default)]
pub struct StreamStats {
    /// Retries because the reserve queue was full.
    pub(crate) reserve_queue_spins: AtomicU64,
    /// Retries because the buffer could not grant the reservation.
    pub(crate) reserve_buffer_spins: AtomicU64,
    /// Reads that had to wait for data to be committed.
    pub(crate) read_not_enough_data: AtomicU64,
    /// Reads served from the stream file instead of the buffer.
    pub(crate) read_not_in_buffer: AtomicU64,
    /// Polls of the stream file while it caught up.
    pub(crate) wait_for_file_polls: AtomicU64,
    /// Reads that found no readable range for an in-range position.
    pub(crate) read_no_readable_range: AtomicU64,
    /// Reads refused by the page-pin check.
    pub(crate) read_pin_failed: AtomicU64,
}

impl StreamStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reserve_queue_spins: self.reserve_queue_spins.load(Ordering::Relaxed),
            reserve_buffer_spins: self.reserve_buffer_spins.load(Ordering::Relaxed),
            read_not_enough_data: self.read_not_enough_data.load(Ordering::Relaxed),
            read_not_in_buffer: self.read_not_in_buffer.load(Ordering::Relaxed),
            wait_for_file_polls: self.wait_for_file_polls.load(Ordering::Relaxed),
            read_no_readable_range: self.read_no_readable_range.load(Ordering::Relaxed),
            read_pin_failed: self.read_pin_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the stream counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reserve_queue_spins: u64,
    pub reserve_buffer_spins: u64,
    pub read_not_enough_data: u64,
    pub read_not_in_buffer: u64,
    pub wait_for_file_polls: u64,
    pub read_no_readable_range: u64,
    pub read_pin_failed: u64,
}
