//! Helper functions that don't particularly belong to any concrete module of the allocator.

/// Every block size and block offset is a multiple of this many bytes, so
/// every payload pointer handed out is aligned to it too.
pub const ALIGNMENT: usize = 8;

/// It aligns `to_be_aligned` up to a multiple of `aligment`, which must be a power of two.
///
/// Used to round region sizes up to a multiple of [`crate::kernel::page_size`]
/// and block sizes up to a multiple of [`ALIGNMENT`]. Returns `None` when the
/// rounded value does not fit in a `usize`.
#[inline]
pub fn align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    debug_assert!(aligment.is_power_of_two());
    to_be_aligned
        .checked_add(aligment - 1)
        .map(|value| value & !(aligment - 1))
}

/// Bytes a block needs to hold a payload of `payload` bytes: the header plus
/// the payload, rounded up to [`ALIGNMENT`].
#[inline]
pub fn required_size(payload: usize) -> Option<usize> {
    payload
        .checked_add(crate::block::HEADER_SIZE)
        .and_then(|size| align(size, ALIGNMENT))
}
