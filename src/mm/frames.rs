// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Reference-counted physical frame allocator over an owned arena
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests in `mm/tests.rs`, property tests in `mm/tests_prop.rs`
//! PUBLIC API: FrameAllocator (allocate/free/incr_ref/page), MemoryConfig, FrameError
//! INVARIANTS: count==0 iff free-listed or never allocated; allocation sets count to exactly 1

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};
use core::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use super::{PhysAddr, PAGE_SIZE};

/// Fill byte written into every freshly allocated frame. Callers must
/// never assume zeroed memory.
pub const ALLOC_FILL: u8 = 0x05;

/// Fill byte written into a frame when its last reference drops, to
/// catch dangling access.
pub const FREE_FILL: u8 = 0x01;

type PageBytes = [u8; PAGE_SIZE];

/// Placement and size of the managed arena.
#[derive(Clone, Copy, Debug)]
pub struct MemoryConfig {
    /// Physical address of the first managed frame.
    pub base: usize,
    /// Number of frames in the arena.
    pub frames: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base: 0x8000_0000,
            frames: 128,
        }
    }
}

/// Errors returned by frame allocation.
#[must_use = "allocation failures must be handled explicitly"]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Every frame is referenced; nothing to hand out.
    #[error("physical frame pool exhausted")]
    Exhausted,
}

/// Reference-counted allocator over a fixed pool of physical frames.
///
/// The free list and the count table are guarded by separate mutexes:
/// list pushes and pops are short, while count updates must be totally
/// ordered process-wide for copy-on-write to stay exact.
pub struct FrameAllocator {
    base: usize,
    pages: Vec<Mutex<Box<PageBytes>>>,
    free: Mutex<Vec<usize>>,
    counts: Mutex<Vec<u32>>,
    #[cfg(feature = "failpoints")]
    deny_next: AtomicBool,
}

impl FrameAllocator {
    /// Builds the arena with every frame free and unreferenced.
    pub fn new(config: MemoryConfig) -> Self {
        assert!(
            config.base % PAGE_SIZE == 0,
            "arena base must be page aligned"
        );
        assert!(config.frames > 0, "arena must contain at least one frame");
        let pages = (0..config.frames)
            .map(|_| Mutex::new(Box::new([FREE_FILL; PAGE_SIZE])))
            .collect();
        let free = (0..config.frames).rev().collect();
        log::info!(
            target: "mm",
            "frame arena: {} frames at {:#x}",
            config.frames,
            config.base
        );
        Self {
            base: config.base,
            pages,
            free: Mutex::new(free),
            counts: Mutex::new(vec![0; config.frames]),
            #[cfg(feature = "failpoints")]
            deny_next: AtomicBool::new(false),
        }
    }

    fn index_of(&self, pa: PhysAddr) -> usize {
        if !pa.is_page_aligned() {
            panic!("frame {pa:?} not page aligned");
        }
        let raw = pa.raw();
        if raw < self.base || raw >= self.base + self.pages.len() * PAGE_SIZE {
            panic!("frame {pa:?} outside the managed arena");
        }
        (raw - self.base) / PAGE_SIZE
    }

    fn addr_of(&self, index: usize) -> PhysAddr {
        PhysAddr::new(self.base + index * PAGE_SIZE)
    }

    /// Hands out a frame with its reference count set to exactly 1.
    pub fn allocate(&self) -> Result<PhysAddr, FrameError> {
        #[cfg(feature = "failpoints")]
        if self.deny_next.swap(false, Ordering::SeqCst) {
            return Err(FrameError::Exhausted);
        }
        let index = {
            let mut free = self.free.lock();
            match free.pop() {
                Some(index) => index,
                None => {
                    log::warn!(target: "mm", "frame pool exhausted");
                    return Err(FrameError::Exhausted);
                }
            }
        };
        self.pages[index].lock().fill(ALLOC_FILL);
        {
            let mut counts = self.counts.lock();
            debug_assert_eq!(counts[index], 0);
            counts[index] = 1;
        }
        Ok(self.addr_of(index))
    }

    /// Drops one reference to `pa`, recycling the frame when the count
    /// reaches zero.
    ///
    /// Panics on a misaligned or out-of-range address and on freeing a
    /// frame with no references; both indicate corruption.
    pub fn free(&self, pa: PhysAddr) {
        let index = self.index_of(pa);
        {
            let mut counts = self.counts.lock();
            let count = &mut counts[index];
            if *count == 0 {
                panic!("freeing unreferenced frame {pa:?}");
            }
            *count -= 1;
            if *count > 0 {
                return;
            }
        }
        // Last owner gone: junk the payload before recycling.
        self.pages[index].lock().fill(FREE_FILL);
        self.free.lock().push(index);
    }

    /// Records an additional owner of an already-allocated frame.
    pub fn incr_ref(&self, pa: PhysAddr) {
        let index = self.index_of(pa);
        let mut counts = self.counts.lock();
        debug_assert!(counts[index] > 0, "sharing unreferenced frame {pa:?}");
        counts[index] += 1;
    }

    /// Current reference count of `pa`.
    pub fn ref_count(&self, pa: PhysAddr) -> u32 {
        self.counts.lock()[self.index_of(pa)]
    }

    /// Locked access to a frame's payload.
    pub fn page(&self, pa: PhysAddr) -> PageRef<'_> {
        PageRef(self.pages[self.index_of(pa)].lock())
    }

    /// Copies `src`'s payload into `dst`.
    pub(crate) fn copy_page(&self, src: PhysAddr, dst: PhysAddr) {
        // `dst` was just allocated by the caller and has no other owner,
        // so taking both page locks cannot deadlock.
        let src_page = self.page(src);
        let mut dst_page = self.page(dst);
        dst_page.copy_from_slice(&src_page[..]);
    }

    /// Frames in the arena.
    pub fn total_frames(&self) -> usize {
        self.pages.len()
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.free.lock().len()
    }

    /// Frames with at least one owner.
    pub fn in_use_frames(&self) -> usize {
        self.counts.lock().iter().filter(|count| **count > 0).count()
    }

    /// Forces the next [`allocate`](Self::allocate) to report exhaustion.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_allocate(&self) {
        self.deny_next.store(true, Ordering::SeqCst);
    }
}

/// Locked view of a frame's payload.
pub struct PageRef<'a>(MutexGuard<'a, Box<PageBytes>>);

impl Deref for PageRef<'_> {
    type Target = PageBytes;

    fn deref(&self) -> &PageBytes {
        &self.0
    }
}

impl DerefMut for PageRef<'_> {
    fn deref_mut(&mut self) -> &mut PageBytes {
        &mut self.0
    }
}
