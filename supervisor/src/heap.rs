// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime heap: an on-die pool and an optional external (PSRAM) pool.
//!
//! Each pool is an independent [`Tlsf`] instance. On top of that sits a thin routing policy:
//! requests that do not need DMA-reachable memory go to the external pool first, everything
//! else is served from on-die RAM. The external pool always lies entirely below the on-die
//! pool, so the owner of any live pointer follows from comparing it against the on-die base.
//!
//! The heap does no locking of its own, callers serialize access.

use core::ops::Range;
use core::ptr::{self, NonNull};

use tlsf::Tlsf;

use crate::kconfig::{DEFAULT_STACK_SIZE, EXCEPTION_STACK_SIZE};
use crate::{Error, Result, ensure};

/// A contiguous region handed to the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPool {
    pub base: usize,
    pub size: usize,
    /// Whether DMA engines can reach the pool.
    pub dma_capable: bool,
}

impl MemoryPool {
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.size
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolKind {
    OnDie,
    External,
}

/// The on-die heap region: from the start of dynamic memory up to the stack limit, which
/// sits [`DEFAULT_STACK_SIZE`] + [`EXCEPTION_STACK_SIZE`] bytes below the end of dynamic
/// memory.
///
/// # Errors
///
/// Returns [`Error::StackReserveTooLarge`] if the region cannot hold the stacks.
pub fn on_die_region(dynamic_memory: Range<usize>) -> Result<Range<usize>> {
    let reserve = DEFAULT_STACK_SIZE + EXCEPTION_STACK_SIZE;
    let available = dynamic_memory.end.saturating_sub(dynamic_memory.start);

    ensure!(
        available > reserve,
        Error::StackReserveTooLarge { available, reserve }
    );

    Ok(dynamic_memory.start..dynamic_memory.end - reserve)
}

pub struct Heap {
    on_die: Tlsf,
    on_die_pool: MemoryPool,
    external: Option<(Tlsf, MemoryPool)>,
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("on_die", &self.on_die_pool)
            .field("external", &self.external.as_ref().map(|(_, pool)| pool))
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Creates the heap over `on_die` and, if given, the `external` region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OverlappingPools`] if the external region does not lie entirely below
    /// the on-die region, or [`Error::Pool`] if the allocator rejects a region.
    ///
    /// # Safety
    ///
    /// Both regions must be valid for reads and writes, unused by anything else, and stay so
    /// for the lifetime of the heap and every allocation it hands out.
    pub unsafe fn new(on_die: Range<usize>, external: Option<Range<usize>>) -> Result<Self> {
        let on_die_pool = MemoryPool {
            base: on_die.start,
            size: on_die.len(),
            dma_capable: true,
        };
        // Safety: ensured by caller
        let on_die = unsafe { claim(&on_die_pool)? };

        let external = match external {
            Some(range) => {
                ensure!(
                    range.end <= on_die_pool.base,
                    Error::OverlappingPools,
                    "external heap region must lie below the on-die region"
                );

                let pool = MemoryPool {
                    base: range.start,
                    size: range.len(),
                    dma_capable: false,
                };
                // Safety: ensured by caller
                let tlsf = unsafe { claim(&pool)? };
                Some((tlsf, pool))
            }
            None => None,
        };

        log::debug!(
            "heap: on-die {:#x}..{:#x}, external {:?}",
            on_die_pool.base,
            on_die_pool.base + on_die_pool.size,
            external.as_ref().map(|(_, pool)| pool.range())
        );

        Ok(Self {
            on_die,
            on_die_pool,
            external,
        })
    }

    pub fn on_die_pool(&self) -> &MemoryPool {
        &self.on_die_pool
    }

    pub fn external_pool(&self) -> Option<&MemoryPool> {
        self.external.as_ref().map(|(_, pool)| pool)
    }

    /// The pool a pointer handed out by this heap belongs to.
    pub fn owning_pool(&self, ptr: NonNull<u8>) -> PoolKind {
        if ptr.addr().get() < self.on_die_pool.base {
            debug_assert!(
                self.external
                    .as_ref()
                    .is_some_and(|(external, _)| external.contains(ptr)),
                "{ptr:?} is outside both pools"
            );
            PoolKind::External
        } else {
            debug_assert!(self.on_die.contains(ptr), "{ptr:?} is outside both pools");
            PoolKind::OnDie
        }
    }

    /// Allocates `size` bytes. DMA-capable requests are only ever served from on-die RAM,
    /// all others prefer the external pool when there is one.
    pub fn allocate(&mut self, size: usize, dma_capable: bool) -> Option<NonNull<u8>> {
        if !dma_capable
            && let Some((external, _)) = &mut self.external
            && let Some(ptr) = external.allocate(size)
        {
            return Some(ptr);
        }

        self.on_die.allocate(size)
    }

    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not been freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Safety: ensured by caller
        unsafe { self.pool_for(ptr).free(ptr) }
    }

    /// Resizes an allocation, preserving its contents up to the smaller of the two sizes.
    ///
    /// A `None` pointer allocates like [`Heap::allocate`] and a `size` of zero frees. External
    /// allocations stay external when possible; if the external pool cannot hold the new size
    /// they move to on-die RAM. On-die allocations never move to the external pool.
    ///
    /// Returns `None` if the request cannot be satisfied, the original allocation is then
    /// left untouched.
    ///
    /// # Safety
    ///
    /// `ptr`, if any, must have been returned by this heap and not been freed since.
    pub unsafe fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        dma_capable: bool,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(size, dma_capable);
        };

        match (self.owning_pool(ptr), &mut self.external) {
            (PoolKind::External, Some((external, _))) => {
                // Safety: ensured by caller
                unsafe {
                    if size == 0 {
                        external.free(ptr);
                        return None;
                    }
                    if let Some(new) = external.resize(Some(ptr), size) {
                        return Some(new);
                    }

                    let new = self.on_die.allocate(size)?;
                    let current = external.usable_size(ptr);
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), current.min(size));
                    external.free(ptr);
                    Some(new)
                }
            }
            // Safety: ensured by caller
            _ => unsafe { self.on_die.resize(Some(ptr), size) },
        }
    }

    /// The largest request that is guaranteed to succeed right now.
    pub fn largest_free_block(&self) -> usize {
        let external = self
            .external
            .as_ref()
            .map_or(0, |(external, _)| external.largest_free_block());

        self.on_die.largest_free_block().max(external)
    }

    fn pool_for(&mut self, ptr: NonNull<u8>) -> &mut Tlsf {
        match (self.owning_pool(ptr), &mut self.external) {
            (PoolKind::External, Some((external, _))) => external,
            _ => &mut self.on_die,
        }
    }
}

/// # Safety
///
/// See [`Heap::new`].
unsafe fn claim(pool: &MemoryPool) -> Result<Tlsf> {
    let base = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(pool.base))
        .ok_or(Error::Pool(tlsf::Error::Misaligned { addr: 0 }))?;

    // Safety: ensured by caller
    Ok(unsafe { Tlsf::with_pool(base, pool.size)? })
}
