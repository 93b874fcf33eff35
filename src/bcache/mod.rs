// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Sharded block buffer cache with two-tier locking
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit and concurrency tests in `bcache/tests.rs`
//! PUBLIC API: BufferCache (get/read/unpin), BufGuard (write/pin), CacheConfig
//! DEPENDS_ON: blockdev::BlockDevice, clock::Clock, sync::SleepLock
//! INVARIANTS: refcnt>0 never evicted; one exclusive holder per buffer; one cached copy per key
//! ADR: docs/adr/0001-resource-core-boundaries.md

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use core::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::blockdev::{BlockAddr, BlockBytes, BlockDevice, BlockError, BLOCK_SIZE};
use crate::clock::Clock;
use crate::sync::{SleepLock, SleepLockGuard};

#[cfg(test)]
mod tests;

/// Pool geometry for a [`BufferCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Buffers in the pool.
    pub buffers: usize,
    /// Hash shards the pool is spread over.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        // Enough buffers for a handful of concurrent file operations; a
        // prime shard count spreads consecutive block numbers.
        Self {
            buffers: 30,
            shards: 13,
        }
    }
}

/// Metadata for one pool slot, owned by whichever shard the slot
/// currently belongs to.
#[derive(Clone, Copy, Debug)]
struct BufMeta {
    slot: usize,
    addr: BlockAddr,
    refcnt: u32,
    /// Tick recorded when `refcnt` last dropped to zero; ranks eviction
    /// candidates. Membership order carries no meaning.
    stamp: u64,
}

struct Shard {
    bufs: Vec<BufMeta>,
}

struct BufSlot {
    /// Whether the payload mirrors the on-device block. Cleared when the
    /// slot is re-keyed, set under the exclusive lock once loaded.
    valid: AtomicBool,
    bytes: SleepLock<BlockBytes>,
}

/// Sharded cache over a fixed pool of block buffers.
///
/// Shard mutexes protect membership and reference counts only, so their
/// critical sections stay short; each buffer's payload sits behind its
/// own [`SleepLock`], which also serializes device I/O for that block.
/// A slow device transfer therefore never blocks unrelated metadata
/// operations. The pool is built once and recycled forever.
pub struct BufferCache {
    shards: Vec<Mutex<Shard>>,
    slots: Vec<BufSlot>,
    /// Serializes every cross-shard miss; see [`get_slow`](Self::get_slow).
    miss_lock: Mutex<()>,
    clock: Arc<Clock>,
    device: Arc<dyn BlockDevice>,
}

impl BufferCache {
    /// Builds the pool and spreads it round-robin across the shards.
    pub fn new(config: CacheConfig, clock: Arc<Clock>, device: Arc<dyn BlockDevice>) -> Self {
        assert!(config.buffers > 0, "cache needs at least one buffer");
        assert!(config.shards > 0, "cache needs at least one shard");
        let slots = (0..config.buffers)
            .map(|_| BufSlot {
                valid: AtomicBool::new(false),
                bytes: SleepLock::new([0; BLOCK_SIZE]),
            })
            .collect();
        let mut shards: Vec<Shard> = (0..config.shards)
            .map(|_| Shard { bufs: Vec::new() })
            .collect();
        for slot in 0..config.buffers {
            // Distinct never-requested identities, so no two records can
            // alias before their first claim.
            shards[slot % config.shards].bufs.push(BufMeta {
                slot,
                addr: BlockAddr::new(u32::MAX, slot as u32),
                refcnt: 0,
                stamp: 0,
            });
        }
        log::info!(
            target: "bcache",
            "pool: {} buffers across {} shards",
            config.buffers,
            config.shards
        );
        Self {
            shards: shards.into_iter().map(Mutex::new).collect(),
            slots,
            miss_lock: Mutex::new(()),
            clock,
            device,
        }
    }

    fn home_shard(&self, addr: BlockAddr) -> usize {
        addr.blockno as usize % self.shards.len()
    }

    /// Index of the idle record with the smallest recency stamp, if any.
    fn idle_victim(bufs: &[BufMeta]) -> Option<usize> {
        bufs.iter()
            .enumerate()
            .filter(|(_, meta)| meta.refcnt == 0)
            .min_by_key(|(_, meta)| meta.stamp)
            .map(|(index, _)| index)
    }

    fn lock_slot(&self, addr: BlockAddr, slot: usize) -> BufGuard<'_> {
        let bytes = self.slots[slot].bytes.lock();
        BufGuard {
            cache: self,
            slot,
            addr,
            bytes: Some(bytes),
        }
    }

    /// Returns the exclusively locked buffer for `addr`, claiming or
    /// stealing an idle slot on a miss.
    ///
    /// Panics when every buffer in the pool is held; the pool has no
    /// secondary backing store, so exhaustion is unrecoverable.
    pub fn get(&self, addr: BlockAddr) -> BufGuard<'_> {
        let home = self.home_shard(addr);
        {
            let mut shard = self.shards[home].lock();
            if let Some(index) = shard.bufs.iter().position(|meta| meta.addr == addr) {
                shard.bufs[index].refcnt += 1;
                let slot = shard.bufs[index].slot;
                drop(shard);
                return self.lock_slot(addr, slot);
            }
            // No hit: reuse this shard's idle buffer with the oldest
            // release stamp, if it has one.
            if let Some(index) = Self::idle_victim(&shard.bufs) {
                let meta = &mut shard.bufs[index];
                meta.addr = addr;
                meta.refcnt = 1;
                let slot = meta.slot;
                self.slots[slot].valid.store(false, Ordering::Release);
                drop(shard);
                return self.lock_slot(addr, slot);
            }
        }
        self.get_slow(addr, home)
    }

    /// Cross-shard miss path, serialized so racing misses for one key
    /// cannot cache it twice.
    fn get_slow(&self, addr: BlockAddr, home: usize) -> BufGuard<'_> {
        let miss = self.miss_lock.lock();

        // Another thread may have finished this path for the same key
        // while we waited; a full re-scan prevents a duplicate copy.
        for shard in &self.shards {
            let mut shard = shard.lock();
            if let Some(index) = shard.bufs.iter().position(|meta| meta.addr == addr) {
                shard.bufs[index].refcnt += 1;
                let slot = shard.bufs[index].slot;
                drop(shard);
                drop(miss);
                return self.lock_slot(addr, slot);
            }
        }

        // Steal the oldest idle buffer from the first shard after home
        // that has one. Approximate LRU by construction: the ring stops
        // at the first shard with a candidate, not the globally oldest.
        let shards = self.shards.len();
        for step in 1..shards {
            let source = (home + step) % shards;
            let mut shard = self.shards[source].lock();
            let Some(index) = Self::idle_victim(&shard.bufs) else {
                continue;
            };
            let mut meta = shard.bufs.swap_remove(index);
            self.slots[meta.slot].valid.store(false, Ordering::Release);
            meta.addr = addr;
            meta.refcnt = 1;
            // Release the source shard before locking home: shard
            // mutexes never nest.
            drop(shard);

            log::debug!(
                target: "bcache",
                "steal: slot {} from shard {source} for {addr:?}",
                meta.slot
            );
            let slot = meta.slot;
            self.shards[home].lock().bufs.push(meta);
            drop(miss);
            return self.lock_slot(addr, slot);
        }

        log::warn!(target: "bcache", "no idle buffer for {addr:?}");
        panic!("bcache: no idle buffer");
    }

    /// Returns the locked buffer for `addr` with its payload loaded
    /// from the device.
    pub fn read(&self, addr: BlockAddr) -> Result<BufGuard<'_>, BlockError> {
        let mut buf = self.get(addr);
        if !self.slots[buf.slot].valid.load(Ordering::Acquire) {
            self.device.read_block(addr, buf.bytes_mut())?;
            self.slots[buf.slot].valid.store(true, Ordering::Release);
        }
        Ok(buf)
    }

    /// Drops a reference taken with [`BufGuard::pin`].
    ///
    /// Panics if `addr` is not cached or has no outstanding references;
    /// both indicate an unbalanced pin.
    pub fn unpin(&self, addr: BlockAddr) {
        let home = self.home_shard(addr);
        let mut shard = self.shards[home].lock();
        let index = shard
            .bufs
            .iter()
            .position(|meta| meta.addr == addr)
            .unwrap_or_else(|| panic!("unpin: {addr:?} is not cached"));
        let meta = &mut shard.bufs[index];
        if meta.refcnt == 0 {
            panic!("unpin: {addr:?} has no references");
        }
        meta.refcnt -= 1;
    }
}

/// Exclusively locked buffer returned by [`BufferCache::get`] and
/// [`BufferCache::read`].
///
/// The payload derefs as a byte array. Dropping the guard releases the
/// exclusive lock, then drops the caller's reference; a buffer whose
/// count reaches zero is stamped with the current tick and becomes an
/// eviction candidate.
pub struct BufGuard<'a> {
    cache: &'a BufferCache,
    slot: usize,
    addr: BlockAddr,
    bytes: Option<SleepLockGuard<'a, BlockBytes>>,
}

impl BufGuard<'_> {
    /// Identity of the cached block.
    pub fn addr(&self) -> BlockAddr {
        self.addr
    }

    /// Writes the payload through to the device.
    ///
    /// The exclusive lock is held for as long as this guard exists, so
    /// the write cannot race another holder.
    pub fn write(&self) -> Result<(), BlockError> {
        self.cache.device.write_block(self.addr, self.bytes())
    }

    /// Takes an extra reference so the buffer stays cached after this
    /// guard is dropped. Balance with [`BufferCache::unpin`].
    pub fn pin(&self) {
        let home = self.cache.home_shard(self.addr);
        let mut shard = self.cache.shards[home].lock();
        let index = shard
            .bufs
            .iter()
            .position(|meta| meta.slot == self.slot)
            .expect("held buffer is resident in its home shard");
        shard.bufs[index].refcnt += 1;
    }

    fn bytes(&self) -> &BlockBytes {
        self.bytes.as_ref().expect("payload held until drop")
    }

    fn bytes_mut(&mut self) -> &mut BlockBytes {
        self.bytes.as_mut().expect("payload held until drop")
    }
}

impl Deref for BufGuard<'_> {
    type Target = BlockBytes;

    fn deref(&self) -> &BlockBytes {
        self.bytes()
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut BlockBytes {
        self.bytes_mut()
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Release the exclusive lock first; shard mutexes are never
        // held while a thread sleeps on a buffer.
        self.bytes = None;
        let home = self.cache.home_shard(self.addr);
        let mut shard = self.cache.shards[home].lock();
        let index = shard
            .bufs
            .iter()
            .position(|meta| meta.slot == self.slot)
            .expect("held buffer is resident in its home shard");
        let meta = &mut shard.bufs[index];
        meta.refcnt -= 1;
        if meta.refcnt == 0 {
            meta.stamp = self.cache.clock.now();
        }
    }
}
