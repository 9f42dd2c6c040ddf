// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-band block headers.
//!
//! Every block is preceded by a header of four machine words:
//!
//! | word | field        | valid                              |
//! |------|--------------|------------------------------------|
//! | 0    | `prev_phys`  | only while the *previous* block is free |
//! | 1    | `size`       | always, low two bits are flags     |
//! | 2    | `next_free`  | only while this block is free      |
//! | 3    | `prev_free`  | only while this block is free      |
//!
//! The payload starts right after the `size` word, so a used block only pays one word of
//! overhead: `prev_phys` lives in the last word of the previous block's payload and the two
//! free-list links overlap the block's own payload.

use core::ptr::NonNull;

use crate::mapping::FL_INDEX_MAX;

const WORD: usize = size_of::<usize>();

const PREV_PHYS: usize = 0;
const SIZE: usize = 1;
const NEXT_FREE: usize = 2;
const PREV_FREE: usize = 3;

const FREE_BIT: usize = 1 << 0;
const PREV_FREE_BIT: usize = 1 << 1;
const FLAG_BITS: usize = FREE_BIT | PREV_FREE_BIT;

/// Bookkeeping bytes paid by every used block.
pub(crate) const BLOCK_HEADER_OVERHEAD: usize = WORD;
/// Offset from the header to the payload.
pub(crate) const BLOCK_START_OFFSET: usize = 2 * WORD;
pub(crate) const BLOCK_HEADER_SIZE: usize = 4 * WORD;
/// A free block must be able to hold its free-list links and the next block's `prev_phys`.
pub(crate) const BLOCK_SIZE_MIN: usize = BLOCK_HEADER_SIZE - WORD;
pub(crate) const BLOCK_SIZE_MAX: usize = 1 << FL_INDEX_MAX;

/// A pointer to a block header living inside a pool.
///
/// All accessors are `unsafe`: the caller guarantees the header words they touch belong to
/// the pool the block was carved from and that the pool is exclusively owned by the
/// allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(NonNull<usize>);

impl Block {
    /// The block whose header starts at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and word aligned.
    pub(crate) unsafe fn at(ptr: *mut u8) -> Self {
        debug_assert!(ptr.cast::<usize>().is_aligned());
        // Safety: ensured by caller
        Self(unsafe { NonNull::new_unchecked(ptr.cast::<usize>()) })
    }

    /// The block owning the payload `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Block::payload`].
    pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> Self {
        // Safety: ensured by caller
        unsafe { Self::at(ptr.as_ptr().wrapping_byte_sub(BLOCK_START_OFFSET)) }
    }

    fn word(self, index: usize) -> *mut usize {
        self.0.as_ptr().wrapping_add(index)
    }

    pub(crate) fn payload(self) -> NonNull<u8> {
        let ptr = self.0.as_ptr().cast::<u8>().wrapping_add(BLOCK_START_OFFSET);
        // Safety: the header address is non-null and the payload lies above it
        unsafe { NonNull::new_unchecked(ptr) }
    }

    unsafe fn raw_size(self) -> usize {
        // Safety: ensured by caller
        unsafe { self.word(SIZE).read() }
    }

    unsafe fn set_raw_size(self, raw: usize) {
        // Safety: ensured by caller
        unsafe { self.word(SIZE).write(raw) }
    }

    /// Writes a fresh `size` word with all flags cleared.
    pub(crate) unsafe fn init(self, size: usize) {
        debug_assert_eq!(size & FLAG_BITS, 0);
        // Safety: ensured by caller
        unsafe { self.set_raw_size(size) }
    }

    pub(crate) unsafe fn size(self) -> usize {
        // Safety: ensured by caller
        unsafe { self.raw_size() & !FLAG_BITS }
    }

    pub(crate) unsafe fn set_size(self, size: usize) {
        debug_assert_eq!(size & FLAG_BITS, 0);
        // Safety: ensured by caller
        unsafe { self.set_raw_size(size | (self.raw_size() & FLAG_BITS)) }
    }

    /// The zero-sized sentinel terminating every pool.
    pub(crate) unsafe fn is_last(self) -> bool {
        // Safety: ensured by caller
        unsafe { self.size() == 0 }
    }

    pub(crate) unsafe fn is_free(self) -> bool {
        // Safety: ensured by caller
        unsafe { self.raw_size() & FREE_BIT != 0 }
    }

    pub(crate) unsafe fn set_free(self) {
        // Safety: ensured by caller
        unsafe { self.set_raw_size(self.raw_size() | FREE_BIT) }
    }

    pub(crate) unsafe fn set_used(self) {
        // Safety: ensured by caller
        unsafe { self.set_raw_size(self.raw_size() & !FREE_BIT) }
    }

    pub(crate) unsafe fn is_prev_free(self) -> bool {
        // Safety: ensured by caller
        unsafe { self.raw_size() & PREV_FREE_BIT != 0 }
    }

    pub(crate) unsafe fn set_prev_free(self) {
        // Safety: ensured by caller
        unsafe { self.set_raw_size(self.raw_size() | PREV_FREE_BIT) }
    }

    pub(crate) unsafe fn set_prev_used(self) {
        // Safety: ensured by caller
        unsafe { self.set_raw_size(self.raw_size() & !PREV_FREE_BIT) }
    }

    unsafe fn read_link(self, index: usize) -> Option<Block> {
        // Safety: ensured by caller
        let ptr = unsafe { self.word(index).cast::<*mut usize>().read() };
        NonNull::new(ptr).map(Block)
    }

    unsafe fn write_link(self, index: usize, block: Option<Block>) {
        let ptr = block.map_or(core::ptr::null_mut(), |block| block.0.as_ptr());
        // Safety: ensured by caller
        unsafe { self.word(index).cast::<*mut usize>().write(ptr) }
    }

    /// The physically preceding block. Only valid while it is free.
    pub(crate) unsafe fn prev_phys(self) -> Block {
        debug_assert!(unsafe { self.is_prev_free() }, "previous block must be free");
        // Safety: ensured by caller
        let prev = unsafe { self.read_link(PREV_PHYS) };
        debug_assert!(prev.is_some(), "free predecessor without back link");
        // Safety: prev_phys is always written before the flag is set
        unsafe { prev.unwrap_unchecked() }
    }

    pub(crate) unsafe fn free_next(self) -> Option<Block> {
        // Safety: ensured by caller
        unsafe { self.read_link(NEXT_FREE) }
    }

    pub(crate) unsafe fn free_prev(self) -> Option<Block> {
        // Safety: ensured by caller
        unsafe { self.read_link(PREV_FREE) }
    }

    pub(crate) unsafe fn set_free_next(self, block: Option<Block>) {
        // Safety: ensured by caller
        unsafe { self.write_link(NEXT_FREE, block) }
    }

    pub(crate) unsafe fn set_free_prev(self, block: Option<Block>) {
        // Safety: ensured by caller
        unsafe { self.write_link(PREV_FREE, block) }
    }

    /// The physically following block.
    pub(crate) unsafe fn next(self) -> Block {
        // Safety: ensured by caller
        let size = unsafe { self.size() };
        debug_assert_ne!(size, 0, "the sentinel has no successor");
        let header = self
            .payload()
            .as_ptr()
            .wrapping_add(size - BLOCK_HEADER_OVERHEAD);
        // Safety: payloads are word aligned and sizes are multiples of the alignment
        unsafe { Block::at(header) }
    }

    /// Points the physically following block back at this one and returns it.
    pub(crate) unsafe fn link_next(self) -> Block {
        // Safety: ensured by caller
        unsafe {
            let next = self.next();
            next.write_link(PREV_PHYS, Some(self));
            next
        }
    }

    pub(crate) unsafe fn mark_as_free(self) {
        // Safety: ensured by caller
        unsafe {
            let next = self.link_next();
            next.set_prev_free();
            self.set_free();
        }
    }

    pub(crate) unsafe fn mark_as_used(self) {
        // Safety: ensured by caller
        unsafe {
            let next = self.next();
            next.set_prev_used();
            self.set_used();
        }
    }

    pub(crate) unsafe fn can_split(self, size: usize) -> bool {
        // Safety: ensured by caller
        unsafe { self.size() >= BLOCK_HEADER_SIZE + size }
    }

    /// Splits off everything past the first `size` payload bytes into a new free block.
    pub(crate) unsafe fn split(self, size: usize) -> Block {
        // Safety: ensured by caller, `can_split` guarantees the remainder is at least
        // `BLOCK_SIZE_MIN` bytes and lies within this block
        unsafe {
            let remaining = Block::at(
                self.payload()
                    .as_ptr()
                    .wrapping_add(size - BLOCK_HEADER_OVERHEAD),
            );
            let remaining_size = self.size() - (size + BLOCK_HEADER_OVERHEAD);
            debug_assert!(remaining_size >= BLOCK_SIZE_MIN);

            remaining.init(remaining_size);
            self.set_size(size);
            remaining.mark_as_free();

            remaining
        }
    }

    /// Merges the physically following block `next` into this one.
    pub(crate) unsafe fn absorb(self, next: Block) -> Block {
        // Safety: ensured by caller
        unsafe {
            debug_assert!(!self.is_last(), "the sentinel cannot absorb");
            self.set_raw_size(self.raw_size() + next.size() + BLOCK_HEADER_OVERHEAD);
            self.link_next();
        }
        self
    }
}
