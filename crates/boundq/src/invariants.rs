//! Debug assertion macros for queue invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is zero
//! overhead in release builds.

// =============================================================================
// Bounded Count
// =============================================================================

/// Assert that the occupied count never exceeds capacity.
///
/// **Invariant**: `0 ≤ len ≤ capacity`
///
/// Used in: `BoundedQueue::push()` after writing a slot
macro_rules! debug_assert_bounded_count {
    ($len:expr, $capacity:expr) => {
        debug_assert!(
            $len <= $capacity,
            "bounded count violated: len {} exceeds capacity {}",
            $len,
            $capacity
        )
    };
}

// =============================================================================
// Slot Occupancy
// =============================================================================

/// Assert that the slot being written is free.
///
/// **Invariant**: the write cursor `(head + len) % capacity` always points at
/// an empty slot while `len < capacity`.
///
/// Used in: `BoundedQueue::push()` before writing
macro_rules! debug_assert_slot_free {
    ($slot:expr, $idx:expr) => {
        debug_assert!(
            $slot.is_none(),
            "slot occupancy violated: write cursor {} points at an occupied slot",
            $idx
        )
    };
}

/// Assert that the slot being read holds an item.
///
/// **Invariant**: while `len > 0`, the read cursor points at an occupied slot.
///
/// Used in: `State::take_front()` after reading
macro_rules! debug_assert_slot_filled {
    ($item:expr, $idx:expr) => {
        debug_assert!(
            $item.is_some(),
            "slot occupancy violated: read cursor {} points at an empty slot",
            $idx
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_slot_filled;
pub(crate) use debug_assert_slot_free;
