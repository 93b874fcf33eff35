// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Concurrent resource-management core for the Axon teaching kernel
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit, concurrency and property tests per module (`cargo test`)
//! PUBLIC API: bcache::BufferCache, mm::{FrameAllocator, PageTable, cow}, clock::Clock, blockdev
//! DEPENDS_ON: parking_lot (blocking locks), bitflags (PTE flags), log (diagnostics)
//! INVARIANTS: Explicit contexts only (no globals); two-tier cache locking; exact frame refcounts
//! ADR: docs/adr/0001-resource-core-boundaries.md

#![forbid(clippy::unwrap_used)]

pub mod bcache;
pub mod blockdev;
pub mod clock;
pub mod mm;
pub mod sync;
