// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fault resolution and lazy duplication.

use super::frames::{FrameAllocator, FrameError};
use super::page_table::{pack_entry, unpack_entry, MapError, PageFlags, PageTable, MAX_VA};
use super::{align_down, PhysAddr};

/// Outcome of a store-fault resolution attempt.
#[must_use = "fault outcomes decide whether the faulting task lives"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The store hit a copy-on-write page; the task now owns a private,
    /// writable copy and should retry the store.
    Resolved,
    /// The page is valid but not copy-on-write; another handler owns
    /// this fault.
    NotApplicable,
    /// The address is not a valid user mapping; the task should be
    /// terminated.
    InvalidFault,
}

/// Resolves a store fault at `va` against `table`.
///
/// Frame exhaustion propagates to the caller, which may terminate the
/// faulting task; it is never fatal to the kernel.
pub fn handle_store_fault(
    table: &mut PageTable,
    frames: &FrameAllocator,
    va: usize,
) -> Result<FaultOutcome, FrameError> {
    let va = align_down(va);
    if va >= MAX_VA {
        return Ok(FaultOutcome::InvalidFault);
    }
    let Some(entry) = table.entry_mut(va) else {
        return Ok(FaultOutcome::InvalidFault);
    };
    if *entry == 0 {
        return Ok(FaultOutcome::InvalidFault);
    }
    let (old_pa, flags) = unpack_entry(*entry);
    if !flags.contains(PageFlags::VALID) || !flags.contains(PageFlags::USER) {
        return Ok(FaultOutcome::InvalidFault);
    }
    if !flags.contains(PageFlags::COW) {
        return Ok(FaultOutcome::NotApplicable);
    }

    let new_pa = frames.allocate()?;
    frames.copy_page(old_pa, new_pa);
    let flags = (flags - PageFlags::COW) | PageFlags::WRITE;
    *entry = pack_entry(new_pa, flags);
    frames.free(old_pa);
    log::debug!(
        target: "mm",
        "cow: va {va:#x} copied {old_pa:?} -> {new_pa:?}"
    );
    Ok(FaultOutcome::Resolved)
}

/// Shares every user mapping of `parent` into `child` for a cheap fork.
///
/// Writable pages lose WRITE and gain COW in both tables; read-only
/// pages are shared as-is, since no store can ever land on them. Each
/// shared frame gains one reference for the child.
pub fn share_mappings(
    parent: &mut PageTable,
    child: &mut PageTable,
    frames: &FrameAllocator,
) -> Result<(), MapError> {
    let mapped: Vec<(usize, PhysAddr, PageFlags)> = parent
        .mappings()
        .filter(|(_, _, flags)| flags.contains(PageFlags::USER))
        .collect();
    for (va, pa, flags) in mapped {
        let flags = if flags.contains(PageFlags::WRITE) {
            (flags - PageFlags::WRITE) | PageFlags::COW
        } else {
            flags
        };
        // Downgrade the parent entry before the child can run, so
        // neither side stores through the shared frame.
        let entry = parent.entry_mut(va).ok_or(MapError::OutOfRange)?;
        *entry = pack_entry(pa, flags);
        child.map(va, pa, flags)?;
        frames.incr_ref(pa);
    }
    Ok(())
}
