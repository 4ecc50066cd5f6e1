use crate::invariants::{debug_assert_append_in_region_a, debug_assert_region_order};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use thiserror::Error;

// =============================================================================
// REGION LAYOUT & APPEND PROTOCOL
// =============================================================================
//
// The buffer is a single contiguous allocation of `capacity` bytes, carved
// into two revolving regions plus the trail of previously committed data:
//
//   | B region | trail B             | A region                | trail A |
//   |----------|---------------------|-------------------------|---------|
//   | future   | committed (young)   | reserved      margin    | committed
//   |          |                     | start_a  append   end_a | (old gen)
//
// Region A `[start_a, end_a)` serves appends: `[start_a, append)` is handed
// out to writers, `[append, end_a)` is the reserve margin (space guaranteed
// available without further bookkeeping). When the margin can no longer be
// carved out before `capacity`, region B `[0, end_b)` is pre-allocated at the
// front of the buffer, and the next overflowing reserve CYCLES: region A is
// re-based onto B, and the old region A survives as the "previous generation"
// `[prev.committed, prev.last_reserved)` until its reservations drain.
//
// An append is two steps: `reserve(amount)` hands out `[append, append+amount)`
// and advances `append`; `commit(offset)` later advances either `start_a` (the
// committed boundary of the current generation) or `prev.committed`, depending
// on which generation the offset belongs to. Commits must arrive in reserve
// order; the caller's queue enforces this (see `ReserveQueue`).
//
// Reads never enter region A or region B. A reader latches the page holding
// the start of its range (`start_read`); `reserve` refuses to advance `append`
// across any latched page, so the latched page and everything the reader can
// legally see behind it stay immutable until `end_read`.
//
// The buffer itself is not thread-safe: every method takes `&mut self` and
// the owning stream serializes calls under its mutex. Only the raw bytes are
// touched outside that mutex, through pointers obtained while holding it.
//
// =============================================================================

/// Number of equal-sized read pages the buffer is split into.
///
/// Each page carries a reader fix count; the bitset summarizing them is a
/// `u64`, so this constant must not exceed 64.
pub const READ_PAGE_COUNT: usize = 64;

/// Buffer capacity is aligned up to this boundary.
const CAPACITY_ALIGN: usize = 4 * 1024;
/// Hard cap on the buffer capacity.
const MAX_CAPACITY: usize = 100 * 1024 * 1024;
/// Reserve margin bounds, applied after the capacity/10 default.
const MIN_RESERVE_MARGIN: usize = 10 * 1024;
const MAX_RESERVE_MARGIN: usize = 10 * 1024 * 1024;
/// Word alignment applied to the reserve margin.
const MARGIN_ALIGN: usize = 8;

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Identifier of a latched read page, handed back to [`BipBuffer::end_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageId(pub(crate) usize);

impl PageId {
    /// Index of the latched page within the buffer.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Why a reservation could not be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReserveError {
    /// A single reservation may not exceed a tenth of the capacity.
    #[error("reservation of {amount} bytes exceeds limit of {limit} bytes")]
    TooLarge { amount: usize, limit: usize },
    /// A reader holds a page the append pointer would have to cross.
    #[error("append range is blocked by a reader pin")]
    WouldBlock,
}

/// `start_read` refused because the latch page overlaps an append region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("read latch page overlaps an active append region")]
pub struct ReadLatchError;

/// One readable span of the buffer, as `(offset, len)` into the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufRange {
    pub offset: usize,
    pub len: usize,
}

/// The up-to-two disjoint readable spans of committed, still-buffered bytes.
///
/// `trail_a` (when non-empty) holds bytes strictly older than `trail_b`;
/// logically the readable window is `trail_a` followed by `trail_b`, ending at
/// the committed boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadRanges {
    pub trail_b: BufRange,
    pub trail_a: BufRange,
}

impl ReadRanges {
    /// Total committed bytes still resident in the buffer.
    #[inline]
    pub fn total(&self) -> usize {
        self.trail_a.len + self.trail_b.len
    }
}

/// Still-live tail of the old region A after a cycle.
#[derive(Debug, Clone, Copy)]
struct PrevGen {
    /// Committed boundary of the previous generation; catches up with
    /// `last_reserved` as the old reservations drain.
    committed: usize,
    /// Where the append pointer stood when the cycle happened.
    last_reserved: usize,
}

/// Bipartite circular byte buffer.
///
/// Grants contiguous byte ranges for append, accepts commits in reservation
/// order, and lets readers pin pages of previously committed data against
/// appender progress. All offsets are byte offsets into the allocation.
pub struct BipBuffer {
    /// Backing allocation. Raw so that writers and pinned readers may touch
    /// the bytes through pointers while bookkeeping mutates under `&mut self`.
    data: NonNull<u8>,
    capacity: usize,
    page_size: usize,
    reserve_margin: usize,

    /// Region A limits; `end_a` points one past the last byte of the region.
    start_a: usize,
    end_a: usize,
    append: usize,

    /// End of region B when active. B always starts at offset zero.
    end_b: Option<usize>,

    prev_gen: Option<PrevGen>,

    /// Reader fix count per page, plus a bitset mirror for the fast path.
    read_fcnt: [u32; READ_PAGE_COUNT],
    read_flags: u64,

    /// Times region A has been re-based onto the start of the buffer.
    cycles: u64,
}

// SAFETY: the allocation is owned exclusively by this value; the raw pointer
// is only there so that byte ranges can be handed out under the owning
// stream's reserve/pin protocol. Moving the struct between threads moves
// ownership of the allocation with it.
unsafe impl Send for BipBuffer {}

impl BipBuffer {
    /// Creates a buffer of roughly `capacity` bytes.
    ///
    /// The capacity is aligned up to 4 KiB, capped at 100 MiB and rounded to
    /// a multiple of the page size. The reserve margin defaults to a tenth of
    /// the capacity, clamped to [10 KiB, 10 MiB].
    pub fn new(capacity: usize) -> Self {
        let capacity = align_up(capacity.max(1), CAPACITY_ALIGN).min(MAX_CAPACITY);
        let page_size = capacity / READ_PAGE_COUNT;
        let capacity = page_size * READ_PAGE_COUNT;

        let mut reserve_margin = align_up(capacity / 10, MARGIN_ALIGN);
        reserve_margin = reserve_margin.clamp(MIN_RESERVE_MARGIN, MAX_RESERVE_MARGIN);
        debug_assert!(reserve_margin < capacity, "margin must leave room to cycle");

        let layout = Layout::from_size_align(capacity, CAPACITY_ALIGN)
            .expect("capacity bounds keep the layout valid");
        // SAFETY: layout has non-zero size (capacity >= CAPACITY_ALIGN).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let data = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));

        Self {
            data,
            capacity,
            page_size,
            reserve_margin,
            start_a: 0,
            end_a: reserve_margin,
            append: 0,
            end_b: None,
            prev_gen: None,
            read_fcnt: [0; READ_PAGE_COUNT],
            read_flags: 0,
            cycles: 0,
        }
    }

    // ---------------------------------------------------------------------
    // ACCESSORS
    // ---------------------------------------------------------------------

    /// Usable capacity in bytes (a multiple of the page size).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of one read page.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of completed cycles.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Current reserve margin.
    #[inline]
    pub fn reserve_margin(&self) -> usize {
        self.reserve_margin
    }

    /// Overrides the reserve margin.
    pub fn set_reserve_margin(&mut self, margin: usize) {
        debug_assert!(margin > 0 && margin < self.capacity);
        self.reserve_margin = margin;
    }

    /// Returns true if any page is currently pinned by a reader.
    #[inline]
    pub fn has_pinned_pages(&self) -> bool {
        self.read_flags != 0
    }

    /// Raw pointer to the byte at `offset`.
    ///
    /// The pointer stays valid for the lifetime of the buffer (the allocation
    /// never moves). Dereferencing it is only sound under the reserve/pin
    /// protocol: writers own `[reserved, reserved+amount)` between `reserve`
    /// and `commit`, readers own latched ranges between `start_read` and
    /// `end_read`.
    #[inline]
    pub fn range_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity);
        // SAFETY: offset is within (or one past) the allocation.
        unsafe { self.data.as_ptr().add(offset) }
    }

    // ---------------------------------------------------------------------
    // APPEND PATH
    // ---------------------------------------------------------------------

    /// Reserves `amount` contiguous bytes for append.
    ///
    /// On success returns the offset of the reserved range; the caller may
    /// write `[offset, offset + amount)` and must later hand the range back
    /// through [`commit`](Self::commit), in reservation order. On failure
    /// nothing has changed and the caller may retry after yielding.
    pub fn reserve(&mut self, amount: usize) -> Result<usize, ReserveError> {
        debug_assert!(amount > 0);
        let mut need_take_margin = true;

        if amount > self.reserve_margin {
            let limit = self.capacity / 10;
            if amount > limit {
                return Err(ReserveError::TooLarge { amount, limit });
            }
            // Adaptive margin: remember the largest amount ever granted.
            self.reserve_margin = amount;
        }

        if self.append + amount > self.capacity {
            // Not enough room before the end of the buffer: fall over to
            // region B. B is normally armed by the margin logic below, but a
            // reservation larger than the remaining tail can get here first.
            if self.end_b.is_none() {
                self.activate_region_b();
            }
            self.cycle();
        }

        if self.append + amount > self.end_a {
            // Enough room before the end of the buffer, but region A itself
            // must be extended.
            self.take_margin(amount);
            need_take_margin = false;
        }

        debug_assert!(self.append + amount <= self.end_a);

        if !self.pages_unpinned(self.append, self.append + amount) {
            return Err(ReserveError::WouldBlock);
        }

        let reserved = self.append;
        self.append += amount;

        if need_take_margin {
            self.take_margin(0);
        }

        debug_assert_region_order!(self.start_a, self.append, self.end_a, self.capacity);
        Ok(reserved)
    }

    /// Completes the reservation whose range ends at `offset`.
    ///
    /// An offset inside the current region A advances the committed boundary
    /// `start_a`; an offset inside the previous generation advances its
    /// committed boundary instead. A current-generation commit proves the
    /// previous generation fully drained (commits arrive in reservation
    /// order) and snaps it closed.
    pub fn commit(&mut self, offset: usize) {
        debug_assert!(offset <= self.capacity);

        if offset >= self.start_a && offset <= self.end_a {
            if let Some(prev) = self.prev_gen.as_mut() {
                debug_assert!(prev.committed <= prev.last_reserved);
                if prev.committed < prev.last_reserved {
                    prev.committed = prev.last_reserved;
                }
            }
            self.start_a = offset;
        } else {
            debug_assert!(self.prev_gen.is_some(), "commit outside any live region");
            if let Some(prev) = self.prev_gen.as_mut() {
                // The upper bound is inclusive: a commit may land exactly at
                // the last reserved byte of the previous generation.
                debug_assert!(prev.committed <= offset && offset <= prev.last_reserved);
                prev.committed = offset;
            }
        }
    }

    // ---------------------------------------------------------------------
    // READ PATH
    // ---------------------------------------------------------------------

    /// Latches the page holding `offset` so that `[offset, offset + amount)`
    /// cannot be overwritten until [`end_read`](Self::end_read).
    ///
    /// Appends always move forward through the buffer, so pinning the first
    /// page of the range is enough: the append pointer cannot pass a pinned
    /// page. If the append pointer currently sits inside that page, the
    /// previous page (wrapping to the last) is latched instead; when that
    /// fallback page overlaps an append region the read is refused.
    pub fn start_read(&mut self, offset: usize, amount: usize) -> Result<PageId, ReadLatchError> {
        debug_assert!(offset < self.capacity && offset + amount <= self.capacity);

        if cfg!(debug_assertions) {
            if let Some(end_b) = self.end_b {
                if ranges_overlap(offset, amount, 0, end_b) {
                    return Err(ReadLatchError);
                }
            } else if let Some(prev) = self.prev_gen {
                // Only reads in the old-generation trail (past end_a) are
                // bounded by the previous committed pointer; below end_a the
                // same offsets already belong to the current generation.
                if offset >= self.end_a
                    && ranges_overlap(offset, amount, prev.committed, self.capacity - prev.committed)
                {
                    return Err(ReadLatchError);
                }
            }
            if ranges_overlap(offset, amount, self.start_a, self.end_a - self.start_a) {
                return Err(ReadLatchError);
            }
        }

        let mut page = offset / self.page_size;

        if self.offset_in_page(self.append, page) {
            page = if page == 0 { READ_PAGE_COUNT - 1 } else { page - 1 };

            let latch_start = page * self.page_size;
            if let Some(end_b) = self.end_b {
                if ranges_overlap(latch_start, self.page_size, 0, end_b) {
                    return Err(ReadLatchError);
                }
            }
            if ranges_overlap(latch_start, self.page_size, self.start_a, self.end_a - self.start_a)
            {
                return Err(ReadLatchError);
            }
        }

        debug_assert!(!self.offset_in_page(self.append, page));

        self.read_fcnt[page] += 1;
        self.read_flags |= 1 << page;

        Ok(PageId(page))
    }

    /// Releases a latch taken by [`start_read`](Self::start_read).
    pub fn end_read(&mut self, page: PageId) {
        let idx = page.0;
        debug_assert!(idx < READ_PAGE_COUNT);
        debug_assert!(self.read_fcnt[idx] > 0);

        self.read_fcnt[idx] -= 1;
        if self.read_fcnt[idx] == 0 {
            debug_assert!(self.read_flags & (1 << idx) != 0);
            self.read_flags &= !(1 << idx);
        }
    }

    /// Returns the readable spans of committed, still-buffered bytes.
    ///
    /// While region B is armed there is a gap between B and the young trail;
    /// rather than account for it, the old-generation trail is given up
    /// entirely (by then that far past lives in the backing store anyway).
    pub fn read_ranges(&self) -> ReadRanges {
        if let Some(end_b) = self.end_b {
            ReadRanges {
                trail_b: BufRange {
                    offset: end_b,
                    len: self.start_a - end_b,
                },
                trail_a: BufRange::default(),
            }
        } else {
            let trail_a = match self.prev_gen {
                Some(prev) => {
                    debug_assert!(
                        prev.committed == prev.last_reserved || self.start_a == 0,
                        "live previous generation implies a fresh cycle"
                    );
                    BufRange {
                        offset: self.end_a,
                        // The margin logic may have grown end_a past the old
                        // trail once it was recycled.
                        len: prev.committed.saturating_sub(self.end_a),
                    }
                }
                None => BufRange::default(),
            };
            ReadRanges {
                trail_b: BufRange {
                    offset: 0,
                    len: self.start_a,
                },
                trail_a,
            }
        }
    }

    // ---------------------------------------------------------------------
    // INTERNALS
    // ---------------------------------------------------------------------

    fn activate_region_b(&mut self) {
        self.end_b = Some(self.reserve_margin);
    }

    /// Re-bases region A onto region B and records the old region A as the
    /// previous generation.
    fn cycle(&mut self) {
        debug_assert!(
            self.prev_gen
                .map_or(true, |p| p.committed == p.last_reserved),
            "cycling over an undrained previous generation"
        );

        self.prev_gen = Some(PrevGen {
            committed: self.start_a,
            last_reserved: self.append,
        });

        self.start_a = 0;
        self.end_a = self.end_b.take().unwrap_or(self.reserve_margin);
        self.append = 0;
        self.cycles += 1;
    }

    /// Extends region A so that `append + amount` plus the margin fits, or
    /// pushes `end_a` to the end of the buffer and arms region B for the
    /// next cycle.
    fn take_margin(&mut self, amount: usize) {
        if self.append + amount + self.reserve_margin <= self.capacity {
            self.end_a = self.append + amount + self.reserve_margin;
        } else {
            self.end_a = self.capacity;
            if self.end_b.is_none() {
                self.activate_region_b();
            }
        }
    }

    /// True if no page overlapping `[start, end)` is pinned by a reader.
    fn pages_unpinned(&self, start: usize, end: usize) -> bool {
        debug_assert!(start < end && end <= self.capacity);
        if self.read_flags == 0 {
            return true;
        }

        let first = start / self.page_size;
        let last = (end - 1) / self.page_size;
        for page in first..=last {
            if self.read_flags & (1 << page) != 0 {
                return false;
            }
        }
        true
    }

    fn offset_in_page(&self, offset: usize, page: usize) -> bool {
        offset >= page * self.page_size && offset < (page + 1) * self.page_size
    }
}

impl Drop for BipBuffer {
    fn drop(&mut self) {
        debug_assert!(self.read_flags == 0, "dropping buffer with live read pins");
        debug_assert_append_in_region_a!(self.start_a, self.append, self.end_a);

        let layout = Layout::from_size_align(self.capacity, CAPACITY_ALIGN)
            .expect("layout was validated at construction");
        // SAFETY: data was allocated with exactly this layout in `new`.
        unsafe { alloc::dealloc(self.data.as_ptr(), layout) };
    }
}

fn ranges_overlap(off1: usize, len1: usize, off2: usize, len2: usize) -> bool {
    off1 + len1 > off2 && off2 + len2 > off1
}
