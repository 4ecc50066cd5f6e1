//! Debug assertion macros for buffer and queue invariants.
//!
//! Only active in debug builds; release builds compile them away entirely.

/// Assert the region ordering invariant of the bip-buffer.
///
/// **Invariant**: `start_a <= append <= end_a <= capacity`
///
/// Used in: `BipBuffer::reserve()` after advancing the append pointer
macro_rules! debug_assert_region_order {
    ($start_a:expr, $append:expr, $end_a:expr, $capacity:expr) => {
        debug_assert!(
            $start_a <= $append && $append <= $end_a && $end_a <= $capacity,
            "region order violated: start_a {} append {} end_a {} capacity {}",
            $start_a,
            $append,
            $end_a,
            $capacity
        )
    };
}

/// Assert that the append pointer lies within region A.
///
/// **Invariant**: `start_a <= append <= end_a`
///
/// Used in: `BipBuffer::drop()` as a final consistency check
macro_rules! debug_assert_append_in_region_a {
    ($start_a:expr, $append:expr, $end_a:expr) => {
        debug_assert!(
            $start_a <= $append && $append <= $end_a,
            "append {} outside region A [{}, {}]",
            $append,
            $start_a,
            $end_a
        )
    };
}

/// Assert that the queue head slot is in use unless the queue is empty.
///
/// **Invariant**: `head used ∨ head == tail`
///
/// Used in: `ReserveQueue::consume()` after collapsing the head
macro_rules! debug_assert_head_used_or_empty {
    ($queue:expr) => {
        debug_assert!(
            $queue.is_empty() || $queue.head_used(),
            "queue head is free but queue is not empty"
        )
    };
}

pub(crate) use debug_assert_append_in_region_a;
pub(crate) use debug_assert_head_used_or_empty;
pub(crate) use debug_assert_region_order;
