// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Block device abstraction consumed by the buffer cache
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; exercised heavily by `bcache` tests
//! PUBLIC API: BlockDevice, BlockAddr, BlockError, MemBlockDevice
//! INVARIANTS: Transfers are synchronous and whole-block; no retry logic here

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use static_assertions::const_assert;
use thiserror::Error;

/// Size of a cached disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;

const_assert!(BLOCK_SIZE.is_power_of_two());

/// Payload of a single block.
pub type BlockBytes = [u8; BLOCK_SIZE];

/// Identity of a block: backing device plus block number on that device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockAddr {
    pub dev: u32,
    pub blockno: u32,
}

impl BlockAddr {
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }
}

/// Block device error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Read/write failed.
    #[error("block transfer failed")]
    Io,
    /// Device or block index out of range.
    #[error("block address out of range")]
    OutOfRange,
}

/// Abstract synchronous block device.
///
/// Both calls block the caller until the transfer is complete. Callers
/// layer no retry logic on top; a failed transfer surfaces as-is.
pub trait BlockDevice: Send + Sync {
    /// Read one block into `buf`.
    fn read_block(&self, addr: BlockAddr, buf: &mut BlockBytes) -> Result<(), BlockError>;

    /// Write one block from `buf`.
    fn write_block(&self, addr: BlockAddr, buf: &BlockBytes) -> Result<(), BlockError>;
}

/// In-memory block device for tests and bring-up.
///
/// Keeps per-device block arrays plus transfer counters, so tests can
/// assert how many times the cache actually touched the device.
pub struct MemBlockDevice {
    devices: Vec<Mutex<Vec<BlockBytes>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockDevice {
    /// Creates `devices` zero-filled devices of `blocks` blocks each.
    pub fn new(devices: u32, blocks: u32) -> Self {
        let devices = (0..devices)
            .map(|_| Mutex::new(vec![[0u8; BLOCK_SIZE]; blocks as usize]))
            .collect();
        Self {
            devices,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Completed block reads since construction.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Completed block writes since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of a block's raw storage, bypassing the cache path.
    pub fn raw_block(&self, addr: BlockAddr) -> Result<BlockBytes, BlockError> {
        let blocks = self.blocks(addr.dev)?.lock();
        blocks
            .get(addr.blockno as usize)
            .copied()
            .ok_or(BlockError::OutOfRange)
    }

    /// Overwrite a block's raw storage, bypassing the cache path.
    pub fn patch_block(&self, addr: BlockAddr, bytes: &BlockBytes) -> Result<(), BlockError> {
        let mut blocks = self.blocks(addr.dev)?.lock();
        let block = blocks
            .get_mut(addr.blockno as usize)
            .ok_or(BlockError::OutOfRange)?;
        block.copy_from_slice(bytes);
        Ok(())
    }

    fn blocks(&self, dev: u32) -> Result<&Mutex<Vec<BlockBytes>>, BlockError> {
        self.devices.get(dev as usize).ok_or(BlockError::OutOfRange)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, addr: BlockAddr, buf: &mut BlockBytes) -> Result<(), BlockError> {
        let blocks = self.blocks(addr.dev)?.lock();
        let block = blocks
            .get(addr.blockno as usize)
            .ok_or(BlockError::OutOfRange)?;
        buf.copy_from_slice(block);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, addr: BlockAddr, buf: &BlockBytes) -> Result<(), BlockError> {
        let mut blocks = self.blocks(addr.dev)?.lock();
        let block = blocks
            .get_mut(addr.blockno as usize)
            .ok_or(BlockError::OutOfRange)?;
        block.copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let disk = MemBlockDevice::new(1, 4);
        let addr = BlockAddr::new(0, 2);
        let payload = [0xabu8; BLOCK_SIZE];
        disk.write_block(addr, &payload).expect("in range");

        let mut out = [0u8; BLOCK_SIZE];
        disk.read_block(addr, &mut out).expect("in range");
        assert_eq!(out, payload);
        assert_eq!(disk.read_count(), 1);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn out_of_range_addresses_are_rejected() {
        let disk = MemBlockDevice::new(1, 4);
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(
            disk.read_block(BlockAddr::new(1, 0), &mut buf),
            Err(BlockError::OutOfRange)
        );
        assert_eq!(
            disk.read_block(BlockAddr::new(0, 4), &mut buf),
            Err(BlockError::OutOfRange)
        );
    }
}
