// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unit and concurrency tests for the sharded buffer cache
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; cover hit/claim/steal paths, refcounts, eviction
//! order, pinning, racing misses and pool exhaustion.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::{BufferCache, CacheConfig};
use crate::blockdev::{BlockAddr, BlockDevice, MemBlockDevice, BLOCK_SIZE};
use crate::clock::Clock;

struct Fixture {
    clock: Arc<Clock>,
    disk: Arc<MemBlockDevice>,
    cache: BufferCache,
}

fn fixture(buffers: usize, shards: usize) -> Fixture {
    let clock = Arc::new(Clock::new());
    let disk = Arc::new(MemBlockDevice::new(2, 64));
    let cache = BufferCache::new(
        CacheConfig { buffers, shards },
        Arc::clone(&clock),
        Arc::clone(&disk) as Arc<dyn BlockDevice>,
    );
    Fixture { clock, disk, cache }
}

/// Reference count of the cached record for `addr`, if any.
fn refcnt_of(cache: &BufferCache, addr: BlockAddr) -> Option<u32> {
    cache.shards.iter().find_map(|shard| {
        shard
            .lock()
            .bufs
            .iter()
            .find(|meta| meta.addr == addr)
            .map(|meta| meta.refcnt)
    })
}

/// How many records across all shards carry `addr`.
fn records_with(cache: &BufferCache, addr: BlockAddr) -> usize {
    cache
        .shards
        .iter()
        .map(|shard| {
            shard
                .lock()
                .bufs
                .iter()
                .filter(|meta| meta.addr == addr)
                .count()
        })
        .sum()
}

fn patterned(byte: u8) -> [u8; BLOCK_SIZE] {
    [byte; BLOCK_SIZE]
}

#[test]
fn default_geometry_matches_the_teaching_kernel() {
    let config = CacheConfig::default();
    assert_eq!(config.buffers, 30);
    assert_eq!(config.shards, 13);

    let cache = BufferCache::new(
        config,
        Arc::new(Clock::new()),
        Arc::new(MemBlockDevice::new(1, 64)) as Arc<dyn BlockDevice>,
    );
    assert_eq!(cache.slots.len(), 30);
    assert_eq!(cache.shards.len(), 13);
}

#[test]
fn read_loads_block_from_device_once() {
    let f = fixture(4, 2);
    let addr = BlockAddr::new(0, 7);
    f.disk.patch_block(addr, &patterned(0x42)).expect("in range");

    let buf = f.cache.read(addr).expect("device in range");
    assert_eq!(buf[0], 0x42);
    assert_eq!(buf.addr(), addr);
    drop(buf);

    // Second read hits the cached payload.
    let buf = f.cache.read(addr).expect("device in range");
    assert_eq!(buf[BLOCK_SIZE - 1], 0x42);
    drop(buf);
    assert_eq!(f.disk.read_count(), 1);
}

#[test]
fn same_block_reuses_the_same_slot() {
    let f = fixture(4, 2);
    let addr = BlockAddr::new(0, 3);
    let first = f.cache.get(addr).slot;
    let second = f.cache.get(addr).slot;
    assert_eq!(first, second);
    assert_eq!(records_with(&f.cache, addr), 1);
}

#[test]
fn write_reaches_the_device() {
    let f = fixture(4, 2);
    let addr = BlockAddr::new(1, 9);
    let mut buf = f.cache.read(addr).expect("device in range");
    buf.fill(0x5a);
    buf.write().expect("device in range");
    drop(buf);
    assert_eq!(f.disk.raw_block(addr).expect("in range"), patterned(0x5a));
}

#[test]
fn refcnt_tracks_holders_and_pins() {
    let f = fixture(4, 2);
    let addr = BlockAddr::new(0, 5);

    let buf = f.cache.get(addr);
    assert_eq!(refcnt_of(&f.cache, addr), Some(1));

    buf.pin();
    assert_eq!(refcnt_of(&f.cache, addr), Some(2));

    drop(buf);
    assert_eq!(refcnt_of(&f.cache, addr), Some(1));

    f.cache.unpin(addr);
    assert_eq!(refcnt_of(&f.cache, addr), Some(0));
}

#[test]
fn exclusive_lock_blocks_second_holder() {
    let f = fixture(4, 2);
    let addr = BlockAddr::new(0, 11);
    let held = f.cache.get(addr);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        let cache = &f.cache;
        s.spawn(move || {
            let _second = cache.get(addr);
            tx.send(()).expect("receiver alive");
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    });
}

#[test]
fn local_reuse_picks_the_oldest_idle_buffer() {
    let f = fixture(3, 1);
    let b1 = BlockAddr::new(0, 1);
    let b2 = BlockAddr::new(0, 2);
    let b3 = BlockAddr::new(0, 3);

    // Release order sets the stamps: b2 oldest, then b3, then b1.
    let g1 = f.cache.get(b1);
    let g2 = f.cache.get(b2);
    let g3 = f.cache.get(b3);
    let victim_slot = g2.slot;
    drop(g2);
    f.clock.tick();
    drop(g3);
    f.clock.tick();
    drop(g1);

    let newcomer = f.cache.get(BlockAddr::new(0, 4));
    assert_eq!(newcomer.slot, victim_slot);
}

#[test]
fn global_miss_steals_from_a_neighbor_shard() {
    // Two buffers, two shards: one buffer per shard.
    let f = fixture(2, 2);
    let even = BlockAddr::new(0, 4); // shard 0
    let held = f.cache.get(even);

    // Shard 0's only buffer is held, so this miss steals shard 1's.
    let stolen = f.cache.get(BlockAddr::new(0, 6));
    assert_eq!(records_with(&f.cache, BlockAddr::new(0, 6)), 1);
    drop(stolen);
    drop(held);

    // Shard 1 is now empty; a miss there rings back to shard 0.
    let back = f.cache.get(BlockAddr::new(0, 7));
    assert_eq!(records_with(&f.cache, BlockAddr::new(0, 7)), 1);
    drop(back);
}

#[test]
fn racing_global_misses_cache_a_key_once() {
    let f = fixture(2, 2);
    let blocker = BlockAddr::new(0, 2); // shard 0
    let contested = BlockAddr::new(0, 8); // shard 0 as well
    f.disk
        .patch_block(contested, &patterned(0x77))
        .expect("in range");
    let held = f.cache.get(blocker);

    thread::scope(|s| {
        let cache = &f.cache;
        for _ in 0..2 {
            s.spawn(move || {
                let buf = cache.read(contested).expect("device in range");
                assert_eq!(buf[0], 0x77);
            });
        }
    });
    drop(held);

    assert_eq!(records_with(&f.cache, contested), 1);
    // Both racers observed one payload load.
    assert_eq!(f.disk.read_count(), 1);
}

#[test]
#[should_panic(expected = "no idle buffer")]
fn pool_exhaustion_is_fatal() {
    let f = fixture(3, 2);
    let held: Vec<_> = (0..3)
        .map(|blockno| f.cache.get(BlockAddr::new(0, blockno)))
        .collect();
    assert_eq!(held.len(), 3);
    let _overflow = f.cache.get(BlockAddr::new(0, 99));
}

#[test]
fn pinned_buffer_is_never_evicted() {
    let f = fixture(2, 1);
    let pinned = BlockAddr::new(0, 1);
    f.disk.patch_block(pinned, &patterned(0x11)).expect("in range");

    let buf = f.cache.read(pinned).expect("device in range");
    buf.pin();
    drop(buf);

    // Churn enough distinct blocks through the pool to recycle every
    // idle slot several times over. The tick keeps the pinned slot's
    // stamp strictly older than any of these releases.
    f.clock.tick();
    for blockno in 10..20 {
        drop(f.cache.read(BlockAddr::new(0, blockno)).expect("in range"));
    }

    let reads_before = f.disk.read_count();
    let buf = f.cache.read(pinned).expect("device in range");
    assert_eq!(buf[0], 0x11);
    drop(buf);
    assert_eq!(f.disk.read_count(), reads_before, "pinned block stayed cached");

    f.cache.unpin(pinned);
    for blockno in 20..23 {
        drop(f.cache.read(BlockAddr::new(0, blockno)).expect("in range"));
    }
    drop(f.cache.read(pinned).expect("device in range"));
    assert_eq!(
        f.disk.read_count(),
        reads_before + 4,
        "unpinned block was recycled"
    );
}

#[test]
#[should_panic(expected = "is not cached")]
fn unpin_of_uncached_block_is_fatal() {
    let f = fixture(2, 2);
    f.cache.unpin(BlockAddr::new(1, 40));
}

#[test]
fn eviction_rekeys_into_the_home_shard() {
    let f = fixture(2, 2);
    let held = f.cache.get(BlockAddr::new(0, 2)); // shard 0, pins its slot
    let moved = BlockAddr::new(0, 4); // shard 0: forces a steal from shard 1
    drop(f.cache.get(moved));
    drop(held);

    // The stolen record now answers hits from its new home shard.
    let home = f.cache.home_shard(moved);
    let shard = f.cache.shards[home].lock();
    assert!(shard.bufs.iter().any(|meta| meta.addr == moved));
}
