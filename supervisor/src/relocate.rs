// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Early-boot copying of time-critical code and data from flash into tightly-coupled RAM.
//!
//! Relocation runs before any Rust-level initialization has happened, so everything here is
//! plain word-sized volatile loads and stores. In particular nothing may call into `memcpy`
//! or `memset`, those may themselves live in the region being relocated.

use core::ops::Range;

use crate::{Error, Result, ensure};

const WORD: usize = size_of::<u32>();

/// A block of words to copy from `source` to `destination`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootImage {
    pub source: usize,
    pub destination: usize,
    pub words: usize,
}

impl BootImage {
    fn destination_range(&self) -> Range<usize> {
        self.destination..self.destination + self.words * WORD
    }
}

/// A block of words to zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BssRegion {
    pub start: usize,
    pub words: usize,
}

impl BssRegion {
    fn range(&self) -> Range<usize> {
        self.start..self.start + self.words * WORD
    }
}

/// Everything that needs to happen before the runtime touches relocated code or data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RelocationPlan {
    /// Instruction memory image.
    pub itcm: BootImage,
    /// Initialized data memory image.
    pub dtcm_data: BootImage,
    /// Zero-initialized data memory.
    pub dtcm_bss: BssRegion,
    /// Added to every source address so that flash is read through the uncached alias.
    pub uncached_offset: usize,
}

impl RelocationPlan {
    /// Checks that every address is word aligned and that no two written regions overlap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MisalignedDescriptor`] or [`Error::OverlappingDescriptors`].
    pub fn validate(&self) -> Result<()> {
        for addr in [
            self.itcm.source,
            self.itcm.destination,
            self.dtcm_data.source,
            self.dtcm_data.destination,
            self.dtcm_bss.start,
        ] {
            ensure!(addr.is_multiple_of(WORD), Error::MisalignedDescriptor { addr });
        }

        let written = [
            self.itcm.destination_range(),
            self.dtcm_data.destination_range(),
            self.dtcm_bss.range(),
        ];
        for (i, a) in written.iter().enumerate() {
            for b in &written[i + 1..] {
                ensure!(
                    a.is_empty() || b.is_empty() || a.end <= b.start || b.end <= a.start,
                    Error::OverlappingDescriptors
                );
            }
        }

        Ok(())
    }

    /// Copies both images and zeroes the BSS region.
    ///
    /// # Safety
    ///
    /// The plan must be [validated](RelocationPlan::validate), every source must be readable
    /// through its uncached alias, and every destination must be writable memory nothing else
    /// is using.
    pub unsafe fn relocate(&self) {
        // Safety: ensured by caller
        unsafe {
            copy_words(&self.itcm, self.uncached_offset);
            copy_words(&self.dtcm_data, self.uncached_offset);
            zero_words(&self.dtcm_bss);
        }
    }
}

#[inline(always)]
unsafe fn copy_words(image: &BootImage, uncached_offset: usize) {
    let src = core::ptr::with_exposed_provenance::<u32>(image.source + uncached_offset);
    let dst = core::ptr::with_exposed_provenance_mut::<u32>(image.destination);

    for i in 0..image.words {
        // Safety: ensured by caller
        unsafe { dst.add(i).write_volatile(src.add(i).read_volatile()) };
    }
}

#[inline(always)]
unsafe fn zero_words(region: &BssRegion) {
    let dst = core::ptr::with_exposed_provenance_mut::<u32>(region.start);

    for i in 0..region.words {
        // Safety: ensured by caller
        unsafe { dst.add(i).write_volatile(0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(buf: &[u32]) -> usize {
        buf.as_ptr().expose_provenance()
    }

    fn plan(flash: &[u32], itcm: &mut [u32], data: &mut [u32], bss: &mut [u32]) -> RelocationPlan {
        RelocationPlan {
            itcm: BootImage {
                source: addr(flash),
                destination: addr(itcm),
                words: itcm.len(),
            },
            dtcm_data: BootImage {
                source: addr(&flash[itcm.len()..]),
                destination: addr(data),
                words: data.len(),
            },
            dtcm_bss: BssRegion {
                start: addr(bss),
                words: bss.len(),
            },
            uncached_offset: 0,
        }
    }

    #[test]
    fn copies_images_and_zeroes_bss() {
        let flash: Vec<u32> = (1..=12).collect();
        let mut itcm = vec![0u32; 8];
        let mut data = vec![0u32; 4];
        let mut bss = vec![0xdead_beefu32; 5];

        let plan = plan(&flash, &mut itcm, &mut data, &mut bss);
        plan.validate().unwrap();
        unsafe { plan.relocate() };

        assert_eq!(itcm, flash[..8]);
        assert_eq!(data, flash[8..]);
        assert!(bss.iter().all(|w| *w == 0));
    }

    #[test]
    fn empty_regions_are_noops() {
        let flash = vec![7u32; 4];
        let mut itcm = vec![0u32; 4];
        let mut data: Vec<u32> = Vec::new();
        let mut bss: Vec<u32> = Vec::new();

        let plan = plan(&flash, &mut itcm, &mut data, &mut bss);
        plan.validate().unwrap();
        unsafe { plan.relocate() };

        assert_eq!(itcm, flash);
    }

    #[test]
    fn rejects_misaligned_descriptors() {
        let mut plan = RelocationPlan {
            itcm: BootImage {
                source: 0x1000_0000,
                destination: 0x2008_0000,
                words: 16,
            },
            dtcm_data: BootImage {
                source: 0x1000_0040,
                destination: 0x2008_1000,
                words: 16,
            },
            dtcm_bss: BssRegion {
                start: 0x2008_1040,
                words: 16,
            },
            uncached_offset: 0x0400_0000,
        };
        plan.validate().unwrap();

        plan.dtcm_data.source += 2;
        assert_eq!(
            plan.validate(),
            Err(Error::MisalignedDescriptor { addr: 0x1000_0042 })
        );
    }

    #[test]
    fn rejects_overlapping_destinations() {
        let plan = RelocationPlan {
            itcm: BootImage {
                source: 0x1000_0000,
                destination: 0x2008_0000,
                words: 16,
            },
            dtcm_data: BootImage {
                source: 0x1000_0040,
                destination: 0x2008_1000,
                words: 16,
            },
            dtcm_bss: BssRegion {
                start: 0x2008_1020,
                words: 16,
            },
            uncached_offset: 0,
        };
        assert_eq!(plan.validate(), Err(Error::OverlappingDescriptors));
    }
}
