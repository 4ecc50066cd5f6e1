//! Configuration for stream behavior.

/// Minimum committed delta before the ready-position handler fires again.
pub const DEFAULT_TRIGGER_MIN_TO_READ_SIZE: usize = 16;

/// Writers block when the unrecycled backlog reaches this share of capacity.
pub const BLOCK_THRESHOLD_PERCENT: usize = 80;
/// Blocked writers resume when the backlog falls below this share.
pub const RESUME_THRESHOLD_PERCENT: usize = 70;

/// Sleep between retries when the reserve queue or buffer is contended.
pub const RESERVE_SPIN_SLEEP_MICROS: u64 = 100;
/// Sleep between polls of the stream file while it catches up.
pub const WAIT_FOR_FILE_SLEEP_MICROS: u64 = 100;
/// A file-backed read waits for at least this much data (or the requested
/// amount, whichever is smaller) before copying.
pub const MIN_BYTES_TO_READ_FROM_FILE: usize = 16 * 1024;

/// Configuration for a [`Stream`](crate::Stream).
///
/// `capacity` is aligned and capped by the underlying buffer; all derived
/// thresholds are computed from the aligned value.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Requested bip-buffer capacity in bytes.
    pub capacity: usize,
    /// Maximum number of concurrent appenders (sizes the reserve queue).
    pub max_appenders: usize,
    /// Override for the buffer reserve margin.
    pub reserve_margin: Option<usize>,
    /// Unflushed-bytes level that asks the flusher to run.
    ///
    /// Defaults to half the capacity.
    pub trigger_flush_to_disk_size: Option<usize>,
    /// Minimum committed delta before the ready-position handler fires.
    pub trigger_min_to_read_size: usize,
    /// Also wake the flusher after every collapsing commit.
    pub flush_on_commit: bool,
}

impl StreamConfig {
    /// Creates a configuration with the default thresholds.
    pub fn new(capacity: usize, max_appenders: usize) -> Self {
        assert!(max_appenders > 0, "at least one appender is required");
        Self {
            capacity,
            max_appenders,
            reserve_margin: None,
            trigger_flush_to_disk_size: None,
            trigger_min_to_read_size: DEFAULT_TRIGGER_MIN_TO_READ_SIZE,
            flush_on_commit: false,
        }
    }

    /// Sets the buffer reserve margin.
    pub fn with_reserve_margin(mut self, margin: usize) -> Self {
        self.reserve_margin = Some(margin);
        self
    }

    /// Sets the flush trigger size.
    pub fn with_trigger_flush_to_disk_size(mut self, size: usize) -> Self {
        self.trigger_flush_to_disk_size = Some(size);
        self
    }

    /// Sets the minimum committed delta for ready notifications.
    pub fn with_trigger_min_to_read_size(mut self, size: usize) -> Self {
        self.trigger_min_to_read_size = size;
        self
    }

    /// Wakes the flusher after every collapsing commit.
    pub fn with_flush_on_commit(mut self, enabled: bool) -> Self {
        self.flush_on_commit = enabled;
        self
    }
}
