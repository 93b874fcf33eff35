// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blocking exclusive locks for long-held resources.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

/// Exclusive lock whose acquire blocks the calling thread until the
/// current holder releases.
///
/// Meant for long critical sections such as payload mutation and device
/// I/O, where a spin-style lock would burn a core. Acquisition is not
/// interruptible: there is no timeout and no cancellation path.
pub struct SleepLock<T> {
    locked: Mutex<bool>,
    wake: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: the `locked` flag admits a single holder at a time, and the
// payload is only reachable through a guard created while holding it.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: Mutex::new(false),
            wake: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Blocks until the lock is free, then takes it.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut locked = self.locked.lock();
        while *locked {
            self.wake.wait(&mut locked);
        }
        *locked = true;
        SleepLockGuard { lock: self }
    }
}

/// Guard proving exclusive ownership of a [`SleepLock`] payload.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists, so this thread holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists, so this thread holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut locked = self.lock.locked.lock();
        *locked = false;
        self.lock.wake.notify_one();
    }
}
