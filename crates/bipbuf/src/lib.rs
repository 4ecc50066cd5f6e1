//! Bipartite circular byte buffer with out-of-order commit.
//!
//! This crate provides the two memory primitives behind a multi-producer
//! append stream:
//!
//! - [`BipBuffer`]: a fixed-capacity contiguous byte buffer divided into
//!   equal-sized read pages. Appenders reserve contiguous ranges and commit
//!   them in reservation order; readers pin pages so the append pointer
//!   cannot overwrite data they are still looking at.
//! - [`ReserveQueue`]: a bounded circular queue of in-flight reservation
//!   contexts. Contexts may complete in any order; consuming the head
//!   collapses every contiguous completed slot in a single call, which is
//!   how the owning stream advances its committed boundary to the furthest
//!   contiguous completion.
//!
//! Neither type synchronizes on its own: both are designed to be driven
//! under one external mutex, with only the raw buffer bytes touched outside
//! it (through pointers obtained while holding it).
//!
//! # Example
//!
//! ```
//! use bipbuf::BipBuffer;
//!
//! let mut buf = BipBuffer::new(64 * 1024);
//!
//! let offset = buf.reserve(128).unwrap();
//! // ... write 128 bytes at `buf.range_ptr(offset)` ...
//! buf.commit(offset + 128);
//!
//! let ranges = buf.read_ranges();
//! assert_eq!(ranges.trail_b.len, 128);
//!
//! let page = buf.start_read(offset, 128).unwrap();
//! // ... read the bytes; the page cannot be overwritten meanwhile ...
//! buf.end_read(page);
//! ```

mod buffer;
mod invariants;
mod queue;

pub use buffer::{
    BipBuffer, BufRange, PageId, ReadLatchError, ReadRanges, ReserveError, READ_PAGE_COUNT,
};
pub use queue::{Collapsed, ReserveQueue, SlotId};
