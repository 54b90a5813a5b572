//! Utilities shared by the quartz crates.

mod address;

pub use address::{Address, Span};

/// Returns a `Box<[T; LEN]>` filled with `elem`.
#[inline(always)]
pub fn boxed_array<T: Clone, const LEN: usize>(elem: T) -> Box<[T; LEN]> {
    let Ok(array) = vec![elem; LEN].into_boxed_slice().try_into() else {
        unreachable!("boxed slice has exactly LEN elements")
    };

    array
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
#[inline(always)]
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` up to the next multiple of `alignment`, or `None` if that does not fit in a
/// `u32`.
#[inline(always)]
pub const fn checked_align_up(value: u32, alignment: u32) -> Option<u32> {
    value.checked_next_multiple_of(alignment)
}

/// Rounds `value` down to the previous multiple of `alignment`, which must be a power of two.
#[inline(always)]
pub const fn align_down(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}
