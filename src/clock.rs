// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Monotonic tick source and the tick-based delay primitive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Error returned by [`Clock::sleep`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SleepError {
    /// The sleeping task was killed before the delay elapsed.
    #[error("sleep interrupted by kill")]
    Killed,
}

/// Kill marker observed by interruptible waits.
///
/// Clones share the same flag, so the embedder can hand one end to the
/// task and keep the other for its termination path.
#[derive(Clone, Debug, Default)]
pub struct KillFlag(Arc<AtomicBool>);

impl KillFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the owner as killed; sleepers observe it on their next wake.
    pub fn kill(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Monotonically increasing tick counter under its own lock.
///
/// Tick delivery is the embedder's job (a hardware timer in a real
/// build); the counter never moves backwards.
pub struct Clock {
    ticks: Mutex<u64>,
    wake: Condvar,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            ticks: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        *self.ticks.lock()
    }

    /// Advances the counter by one tick and wakes sleepers.
    pub fn tick(&self) {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        self.wake.notify_all();
    }

    /// Blocks the caller until `n` ticks have elapsed.
    ///
    /// The kill flag is re-checked at every wake, so a killed sleeper
    /// returns as soon as the next tick lands.
    pub fn sleep(&self, n: u64, kill: &KillFlag) -> Result<(), SleepError> {
        let mut ticks = self.ticks.lock();
        let start = *ticks;
        while *ticks - start < n {
            if kill.is_killed() {
                return Err(SleepError::Killed);
            }
            self.wake.wait(&mut ticks);
        }
        Ok(())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
