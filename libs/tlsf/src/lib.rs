// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A two-level segregated fit (TLSF) allocator over a single, fixed memory pool.
//!
//! Free blocks are kept in size-class buckets: a first level of power-of-two classes, each
//! split linearly into a second level of buckets. Two bitmaps record which buckets are
//! non-empty, so finding a suitable block, freeing (with immediate coalescing) and
//! resizing all take a bounded number of steps that does not depend on how many blocks
//! the pool currently holds.
//!
//! The allocator performs no locking of its own, callers serialize access.

#![cfg_attr(not(test), no_std)]

mod block;
mod mapping;

use core::fmt;
use core::ops::Range;
use core::ptr::{self, NonNull};

use block::{BLOCK_HEADER_OVERHEAD, BLOCK_SIZE_MAX, BLOCK_SIZE_MIN, Block};
use mapping::{
    FL_INDEX_COUNT, SL_INDEX_COUNT, adjust_request_size, align_down, mapping_insert,
    mapping_search,
};

pub use mapping::{ALIGN_SIZE, fit_size};

/// Bytes of every pool that are lost to the first block's header and the trailing sentinel.
pub const POOL_OVERHEAD: usize = 2 * BLOCK_HEADER_OVERHEAD;

/// Errors returned when handing a pool to the allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The pool does not start at an [`ALIGN_SIZE`] boundary.
    Misaligned { addr: usize },
    /// The pool cannot hold a single minimally sized block.
    PoolTooSmall { size: usize },
    /// The pool is larger than the largest block the size classes can describe.
    PoolTooLarge { size: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Misaligned { addr } => {
                write!(f, "pool at {addr:#x} is not aligned to {ALIGN_SIZE} bytes")
            }
            Error::PoolTooSmall { size } => write!(f, "pool of {size} bytes is too small"),
            Error::PoolTooLarge { size } => write!(
                f,
                "pool of {size} bytes exceeds the maximum of {BLOCK_SIZE_MAX} bytes"
            ),
        }
    }
}

impl core::error::Error for Error {}

/// A block visited by [`Tlsf::walk`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub ptr: NonNull<u8>,
    /// Usable payload bytes, excluding the block header.
    pub size: usize,
    pub used: bool,
}

#[derive(Debug)]
struct Pool {
    first: Block,
    range: Range<usize>,
}

pub struct Tlsf {
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    blocks: [[Option<Block>; SL_INDEX_COUNT]; FL_INDEX_COUNT],
    pool: Option<Pool>,
}

// Safety: the allocator exclusively owns its pool, the raw block pointers never alias memory
// owned by anything else.
unsafe impl Send for Tlsf {}

impl fmt::Debug for Tlsf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tlsf")
            .field("pool", &self.pool.as_ref().map(|pool| &pool.range))
            .field("fl_bitmap", &format_args!("{:#034b}", self.fl_bitmap))
            .finish_non_exhaustive()
    }
}

impl Default for Tlsf {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlsf {
    /// Creates an allocator without a pool. All allocations fail.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            blocks: [[None; SL_INDEX_COUNT]; FL_INDEX_COUNT],
            pool: None,
        }
    }

    /// Creates an allocator serving allocations out of `[mem, mem + bytes)`.
    ///
    /// [`POOL_OVERHEAD`] bytes of the pool are used for bookkeeping and the usable size is
    /// truncated to a multiple of [`ALIGN_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns an error if `mem` is not aligned to [`ALIGN_SIZE`] or the pool is too small or
    /// too large to be described by the size classes.
    ///
    /// # Safety
    ///
    /// The memory range must be valid for reads and writes, must not be used by anything
    /// else, and must stay valid for as long as the allocator (or any allocation handed out by
    /// it) is alive.
    pub unsafe fn with_pool(mem: NonNull<u8>, bytes: usize) -> Result<Self, Error> {
        let mut this = Self::new();
        // Safety: ensured by caller
        unsafe { this.claim_pool(mem, bytes)? };
        Ok(this)
    }

    unsafe fn claim_pool(&mut self, mem: NonNull<u8>, bytes: usize) -> Result<(), Error> {
        let addr = mem.addr().get();
        if addr % ALIGN_SIZE != 0 {
            return Err(Error::Misaligned { addr });
        }

        let pool_bytes = bytes
            .checked_sub(POOL_OVERHEAD)
            .map(|usable| align_down(usable, ALIGN_SIZE))
            .ok_or(Error::PoolTooSmall { size: bytes })?;

        if pool_bytes < BLOCK_SIZE_MIN {
            return Err(Error::PoolTooSmall { size: bytes });
        }
        if pool_bytes >= BLOCK_SIZE_MAX {
            return Err(Error::PoolTooLarge { size: bytes });
        }

        // The first header starts one word before the pool. Its `prev_phys` word is never
        // touched because the first block has no predecessor.
        //
        // Safety: ensured by caller, the `size` word and everything after it lies inside the pool
        unsafe {
            let block = Block::at(mem.as_ptr().wrapping_byte_sub(BLOCK_HEADER_OVERHEAD));
            block.init(pool_bytes);
            block.set_free();
            self.insert_block(block);

            let sentinel = block.link_next();
            sentinel.init(0);
            sentinel.set_prev_free();

            self.pool = Some(Pool {
                first: block,
                range: addr..addr + bytes,
            });
        }

        log::trace!("claimed pool {addr:#x}..{:#x} ({pool_bytes} usable bytes)", addr + bytes);

        Ok(())
    }

    /// The address range handed to [`Tlsf::with_pool`], if any.
    pub fn pool_range(&self) -> Option<Range<usize>> {
        self.pool.as_ref().map(|pool| pool.range.clone())
    }

    /// Whether `ptr` points into this allocator's pool.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.pool
            .as_ref()
            .is_some_and(|pool| pool.range.contains(&ptr.addr().get()))
    }

    /// Allocates at least `size` bytes aligned to [`ALIGN_SIZE`].
    ///
    /// Returns `None` for zero-sized requests and when no free block is large enough.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let adjusted = adjust_request_size(size);
        let block = self.locate_free(adjusted)?;
        // Safety: the block was just taken off a free list of our own pool
        Some(unsafe { self.prepare_used(block, adjusted) })
    }

    /// Returns the allocation at `ptr` to the pool, coalescing it with free neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not been freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Safety: ensured by caller
        unsafe {
            let block = Block::from_payload(ptr);
            debug_assert!(!block.is_free(), "double free of {ptr:?}");

            block.mark_as_free();
            let block = self.merge_prev(block);
            let block = self.merge_next(block);
            self.insert_block(block);
        }
    }

    /// Resizes the allocation at `ptr` to `size` bytes, preserving its contents up to the
    /// smaller of the old and new size.
    ///
    /// The block is grown or shrunk in place whenever possible, otherwise a new block is
    /// allocated, the contents are copied and the old block is freed. A `None` pointer
    /// behaves like [`Tlsf::allocate`] and a `size` of zero frees the allocation.
    ///
    /// Returns `None` if the request cannot be satisfied, in which case the original
    /// allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr`, if any, must have been returned by this allocator and not been freed since.
    pub unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(size);
        };

        if size == 0 {
            // Safety: ensured by caller
            unsafe { self.free(ptr) };
            return None;
        }

        let adjusted = adjust_request_size(size);
        if adjusted == 0 {
            return None;
        }

        // Safety: ensured by caller
        unsafe {
            let block = Block::from_payload(ptr);
            debug_assert!(!block.is_free(), "resize of freed block {ptr:?}");

            let next = block.next();
            let current = block.size();
            let combined = current + next.size() + BLOCK_HEADER_OVERHEAD;

            if adjusted > current && (!next.is_free() || adjusted > combined) {
                let new = self.allocate(size)?;
                ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), current.min(size));
                self.free(ptr);
                Some(new)
            } else {
                if adjusted > current {
                    self.merge_next(block);
                    block.mark_as_used();
                }
                self.trim_used(block, adjusted);
                Some(ptr)
            }
        }
    }

    /// The number of bytes usable through `ptr`, which may exceed the requested size.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not been freed since.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // Safety: ensured by caller
        unsafe { Block::from_payload(ptr).size() }
    }

    /// Visits every block of the pool in address order.
    pub fn walk(&self, mut f: impl FnMut(BlockInfo)) {
        let Some(pool) = &self.pool else {
            return;
        };

        // Safety: the pool is owned by us and always terminated by the sentinel block
        unsafe {
            let mut block = pool.first;
            while !block.is_last() {
                f(BlockInfo {
                    ptr: block.payload(),
                    size: block.size(),
                    used: !block.is_free(),
                });
                block = block.next();
            }
        }
    }

    /// The size of the largest request that is guaranteed to succeed right now.
    ///
    /// This is the largest free block, reduced by [`fit_size`] to account for the
    /// size-class rounding applied to requests.
    pub fn largest_free_block(&self) -> usize {
        let mut largest = 0;
        self.walk(|block| {
            if !block.used {
                largest = largest.max(block.size);
            }
        });
        fit_size(largest)
    }

    fn locate_free(&mut self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }

        let (fl, sl) = mapping_search(size);
        // the rounded request may fall off the end of the first level
        if fl >= FL_INDEX_COUNT {
            return None;
        }

        let (fl, sl) = self.find_suitable(fl, sl)?;
        let block = self.blocks[fl][sl]?;

        // Safety: the block is on one of our free lists
        unsafe {
            debug_assert!(block.size() >= size);
            self.remove_free_block(block, fl, sl);
        }

        Some(block)
    }

    fn find_suitable(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        let mut fl = fl;
        let mut sl_map = self.sl_bitmap[fl] & (u32::MAX << sl);

        if sl_map == 0 {
            // nothing in this class, take the smallest non-empty larger class
            let fl_map = self.fl_bitmap & u32::MAX.checked_shl(fl as u32 + 1).unwrap_or(0);
            if fl_map == 0 {
                return None;
            }

            fl = fl_map.trailing_zeros() as usize;
            sl_map = self.sl_bitmap[fl];
            debug_assert_ne!(sl_map, 0, "first-level bitmap out of sync");
        }

        Some((fl, sl_map.trailing_zeros() as usize))
    }

    unsafe fn remove_free_block(&mut self, block: Block, fl: usize, sl: usize) {
        // Safety: ensured by caller
        let next = unsafe {
            let prev = block.free_prev();
            let next = block.free_next();

            if let Some(next) = next {
                next.set_free_prev(prev);
            }
            if let Some(prev) = prev {
                prev.set_free_next(next);
            }

            next
        };

        if self.blocks[fl][sl] == Some(block) {
            self.blocks[fl][sl] = next;

            if self.blocks[fl][sl].is_none() {
                self.sl_bitmap[fl] &= !(1 << sl);
                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap &= !(1 << fl);
                }
            }
        }
    }

    unsafe fn insert_free_block(&mut self, block: Block, fl: usize, sl: usize) {
        let current = self.blocks[fl][sl];

        // Safety: ensured by caller
        unsafe {
            block.set_free_next(current);
            block.set_free_prev(None);
            if let Some(current) = current {
                current.set_free_prev(Some(block));
            }
        }

        self.blocks[fl][sl] = Some(block);
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
    }

    unsafe fn remove_block(&mut self, block: Block) {
        // Safety: ensured by caller
        unsafe {
            let (fl, sl) = mapping_insert(block.size());
            self.remove_free_block(block, fl, sl);
        }
    }

    unsafe fn insert_block(&mut self, block: Block) {
        // Safety: ensured by caller
        unsafe {
            let (fl, sl) = mapping_insert(block.size());
            self.insert_free_block(block, fl, sl);
        }
    }

    unsafe fn merge_prev(&mut self, block: Block) -> Block {
        // Safety: ensured by caller
        unsafe {
            if block.is_prev_free() {
                let prev = block.prev_phys();
                debug_assert!(prev.is_free(), "prev block is not free though marked as such");
                self.remove_block(prev);
                prev.absorb(block)
            } else {
                block
            }
        }
    }

    unsafe fn merge_next(&mut self, block: Block) -> Block {
        // Safety: ensured by caller
        unsafe {
            let next = block.next();
            if next.is_free() {
                self.remove_block(next);
                block.absorb(next)
            } else {
                block
            }
        }
    }

    /// Returns the tail of a free block beyond `size` bytes to the free lists.
    unsafe fn trim_free(&mut self, block: Block, size: usize) {
        // Safety: ensured by caller
        unsafe {
            if block.can_split(size) {
                let remaining = block.split(size);
                block.link_next();
                remaining.set_prev_free();
                self.insert_block(remaining);
            }
        }
    }

    /// Returns the tail of a used block beyond `size` bytes to the free lists.
    unsafe fn trim_used(&mut self, block: Block, size: usize) {
        // Safety: ensured by caller
        unsafe {
            if block.can_split(size) {
                let remaining = block.split(size);
                remaining.set_prev_used();
                let remaining = self.merge_next(remaining);
                self.insert_block(remaining);
            }
        }
    }

    unsafe fn prepare_used(&mut self, block: Block, size: usize) -> NonNull<u8> {
        // Safety: ensured by caller
        unsafe {
            self.trim_free(block, size);
            block.mark_as_used();
        }
        block.payload()
    }
}
