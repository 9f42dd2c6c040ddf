// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mapping between block sizes and `(first-level, second-level)` free-list indices.
//!
//! The first level splits sizes into power-of-two classes, the second level splits every
//! class linearly into [`SL_INDEX_COUNT`] buckets. Sizes below [`SMALL_BLOCK_SIZE`] all share
//! first-level class `0` and are bucketed exactly, one bucket per [`ALIGN_SIZE`] step.

use static_assertions::{const_assert, const_assert_eq};

use crate::block::{BLOCK_SIZE_MAX, BLOCK_SIZE_MIN};

#[cfg(target_pointer_width = "64")]
pub(crate) const ALIGN_SIZE_LOG2: u32 = 3;
#[cfg(not(target_pointer_width = "64"))]
pub(crate) const ALIGN_SIZE_LOG2: u32 = 2;

/// Every allocation returned by the allocator is aligned to this many bytes.
pub const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

pub(crate) const SL_INDEX_COUNT_LOG2: u32 = 5;
pub(crate) const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

#[cfg(target_pointer_width = "64")]
pub(crate) const FL_INDEX_MAX: u32 = 32;
#[cfg(not(target_pointer_width = "64"))]
pub(crate) const FL_INDEX_MAX: u32 = 30;

pub(crate) const FL_INDEX_SHIFT: u32 = SL_INDEX_COUNT_LOG2 + ALIGN_SIZE_LOG2;
pub(crate) const FL_INDEX_COUNT: usize = (FL_INDEX_MAX - FL_INDEX_SHIFT + 1) as usize;
pub(crate) const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

// both bitmaps are u32
const_assert!(SL_INDEX_COUNT <= u32::BITS as usize);
const_assert!(FL_INDEX_COUNT <= u32::BITS as usize);
// small blocks are bucketed exactly
const_assert_eq!(SMALL_BLOCK_SIZE / SL_INDEX_COUNT, ALIGN_SIZE);

/// Index of the most significant set bit. `x` must be non-zero.
#[inline]
fn fls(x: usize) -> u32 {
    debug_assert_ne!(x, 0);
    usize::BITS - 1 - x.leading_zeros()
}

#[inline]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
    (x + (align - 1)) & !(align - 1)
}

#[inline]
pub(crate) const fn align_down(x: usize, align: usize) -> usize {
    x - (x & (align - 1))
}

/// Rounds a user request up to something the allocator can hand out.
///
/// Returns `0` for zero-sized and for impossibly large requests, both of which
/// the allocator refuses.
pub(crate) fn adjust_request_size(size: usize) -> usize {
    if size == 0 || size >= BLOCK_SIZE_MAX {
        return 0;
    }

    align_up(size, ALIGN_SIZE).max(BLOCK_SIZE_MIN)
}

/// The free list a block of exactly `size` bytes belongs to.
pub(crate) fn mapping_insert(size: usize) -> (usize, usize) {
    if size < SMALL_BLOCK_SIZE {
        (0, size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT))
    } else {
        let fl = fls(size);
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ (1 << SL_INDEX_COUNT_LOG2);
        ((fl - (FL_INDEX_SHIFT - 1)) as usize, sl)
    }
}

/// The first free list whose blocks are all guaranteed to satisfy a request of `size` bytes.
///
/// The request is rounded up to the next bucket boundary, so the head of the returned
/// list (or of any larger list) is always large enough. This is what makes the
/// allocator "good fit" rather than "best fit".
pub(crate) fn mapping_search(size: usize) -> (usize, usize) {
    let size = if size >= SMALL_BLOCK_SIZE {
        let round = (1 << (fls(size) - SL_INDEX_COUNT_LOG2)) - 1;
        size + round
    } else {
        size
    };

    mapping_insert(size)
}

/// The largest request that a free block of `size` bytes is guaranteed to satisfy.
///
/// Because searches round requests up to the next bucket boundary, a free block can only
/// serve requests up to the start of its own bucket.
#[must_use]
pub fn fit_size(size: usize) -> usize {
    if size == 0 {
        return 0;
    }

    if size < SMALL_BLOCK_SIZE {
        return align_down(size, ALIGN_SIZE);
    }

    let interval = 1_usize << (fls(size) - SL_INDEX_COUNT_LOG2);
    size & !(interval - 1)
}
