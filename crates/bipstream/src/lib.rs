//! Multi-producer append stream over a bip-buffer.
//!
//! A [`Stream`] is the in-memory transport between producers that emit
//! replication records and the consumers that drain, persist or forward
//! them. Producers reserve contiguous byte ranges, fill them without holding
//! any lock, and commit; the committed boundary advances only past the
//! contiguous prefix of completed reservations, so readers never observe a
//! gap no matter what order writers finish in. Logical positions are 64-bit
//! byte counters that extend beyond the physical buffer: once bytes are
//! recycled out of the buffer, reads fall back to an attached
//! [`StreamFile`].
//!
//! # Example
//!
//! ```
//! use bipstream::Stream;
//!
//! let stream = Stream::new(1024 * 1024, 4);
//! stream.init(0);
//!
//! // Producer: reserve 12 bytes and fill them in place.
//! stream.write(12, |_pos, buf| {
//!     buf.copy_from_slice(b"hello stream");
//!     Ok(buf.len())
//! })?;
//!
//! // Consumer: observe the committed bytes.
//! stream.read(0, 12, |buf| {
//!     assert_eq!(buf, b"hello stream");
//!     Ok(buf.len())
//! })?;
//! # Ok::<(), bipstream::StreamError>(())
//! ```
//!
//! The [`entry`] module layers record framing on top (fixed packed header,
//! checksummed payload), and [`packer`] holds the primitive codec records
//! are built from.

mod config;
pub mod entry;
mod error;
pub mod packer;
mod stats;
mod stream;
mod stream_file;

pub use config::{
    StreamConfig, BLOCK_THRESHOLD_PERCENT, DEFAULT_TRIGGER_MIN_TO_READ_SIZE,
    MIN_BYTES_TO_READ_FROM_FILE, RESUME_THRESHOLD_PERCENT,
};
pub use error::StreamError;
pub use stats::{StatsSnapshot, StreamStats};
pub use stream::Stream;
pub use stream_file::{MemoryStreamFile, StreamFile};

/// Logical stream position: bytes ever reserved since stream initialization.
pub type StreamPos = u64;
