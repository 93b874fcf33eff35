// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Flat page table packing frame addresses and access flags.

use bitflags::bitflags;
use thiserror::Error;

use super::{align_down, PhysAddr, PAGE_SIZE};

/// Number of entries in the flat table.
const PT_ENTRIES: usize = 512;

/// First virtual address beyond the table's reach.
pub const MAX_VA: usize = PT_ENTRIES * PAGE_SIZE;

/// Low entry bits holding [`PageFlags`]; frame addresses are page
/// aligned, so the two ranges never collide.
const FLAG_BITS: usize = 0x1ff;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit: the frame is shared read-only and a store must
        /// duplicate it first.
        const COW = 1 << 8;
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    #[error("address not page aligned")]
    Unaligned,
    /// Address lies beyond the table's range.
    #[error("address out of range")]
    OutOfRange,
    /// Mapping violates the W^X policy.
    #[error("mapping violates W^X")]
    PermissionDenied,
    /// Mapping collides with an existing entry.
    #[error("mapping overlaps an existing entry")]
    Overlap,
    /// Flags do not describe a valid leaf entry.
    #[error("flags do not describe a valid entry")]
    InvalidFlags,
    /// No mapping is installed at the address.
    #[error("no mapping at address")]
    NotMapped,
}

/// Packs a frame address and flags into a table entry.
pub(crate) fn pack_entry(pa: PhysAddr, flags: PageFlags) -> usize {
    pa.raw() | flags.bits()
}

/// Splits an entry into frame address and flags.
pub(crate) fn unpack_entry(entry: usize) -> (PhysAddr, PageFlags) {
    (
        PhysAddr::new(entry & !FLAG_BITS),
        PageFlags::from_bits_truncate(entry & FLAG_BITS),
    )
}

/// Flat single-level page table.
///
/// Every in-range address has an entry slot; an empty slot reads zero.
/// The fault handler rewrites entries in place through [`entry_mut`],
/// which is what a hardware walk would hand it.
///
/// [`entry_mut`]: PageTable::entry_mut
pub struct PageTable {
    entries: Vec<usize>,
}

impl PageTable {
    /// Creates a table with every entry empty.
    pub fn new() -> Self {
        Self {
            entries: vec![0; PT_ENTRIES],
        }
    }

    fn index(va: usize) -> Result<usize, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if va >= MAX_VA {
            return Err(MapError::OutOfRange);
        }
        Ok(va / PAGE_SIZE)
    }

    /// Installs a mapping of `pa` at `va` with the provided flags.
    #[must_use]
    pub fn map(&mut self, va: usize, pa: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        let index = Self::index(va)?;
        if !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if !flags.contains(PageFlags::VALID) || flags.intersection(LEAF_PERMS).is_empty() {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }
        if self.entries[index] != 0 {
            return Err(MapError::Overlap);
        }
        self.entries[index] = pack_entry(pa, flags);
        Ok(())
    }

    /// Removes the mapping at `va`, returning what it pointed at.
    #[must_use]
    pub fn unmap(&mut self, va: usize) -> Result<(PhysAddr, PageFlags), MapError> {
        let index = Self::index(va)?;
        let entry = core::mem::take(&mut self.entries[index]);
        if entry == 0 {
            return Err(MapError::NotMapped);
        }
        Ok(unpack_entry(entry))
    }

    /// Returns the raw entry covering `va`, if one is installed.
    pub fn entry(&self, va: usize) -> Option<usize> {
        let index = Self::index(align_down(va)).ok()?;
        Some(self.entries[index]).filter(|entry| *entry != 0)
    }

    /// Returns the entry slot covering `va` for in-place rewriting.
    ///
    /// The slot exists for every in-range address; an empty slot reads
    /// zero.
    pub fn entry_mut(&mut self, va: usize) -> Option<&mut usize> {
        let index = Self::index(align_down(va)).ok()?;
        Some(&mut self.entries[index])
    }

    /// Frame address and flags mapped at `va`, if any.
    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PageFlags)> {
        self.entry(va).map(unpack_entry)
    }

    /// Iterates over `(va, frame, flags)` for every installed mapping.
    pub fn mappings(&self) -> impl Iterator<Item = (usize, PhysAddr, PageFlags)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| **entry != 0)
            .map(|(index, entry)| {
                let (pa, flags) = unpack_entry(*entry);
                (index * PAGE_SIZE, pa, flags)
            })
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
