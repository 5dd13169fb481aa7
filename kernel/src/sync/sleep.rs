//! Sleep locks: long-term locks whose holders may block.
//!
//! Built on a spin lock plus the sleep/wakeup rendezvous. Unlike a spin
//! lock, a sleep lock may be held across disk I/O, and the holder keeps
//! interrupts enabled. Never acquire one from interrupt context.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;

use mutex_core::Mutex;

use crate::proc;

use super::SpinLock;

struct RawSleepLock {
    held: SpinLock<bool>,
}

impl RawSleepLock {
    const fn new() -> Self {
        Self {
            held: SpinLock::new(false),
        }
    }

    fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            held = proc::sleep(ptr::from_ref(self).addr(), held);
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        drop(held);
        proc::wakeup(ptr::from_ref(self).addr());
    }
}

/// A blocking lock protecting a value.
pub struct SleepLock<T> {
    raw: RawSleepLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSleepLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.raw.acquire();
        SleepLockGuard { lock: self }
    }

    /// Raw access to the protected value.
    ///
    /// # Safety
    ///
    /// The caller must rule out concurrent access by other means, e.g.
    /// by holding the lock of a table that gates every path to this
    /// value.
    pub unsafe fn raw_get(&self) -> *mut T {
        self.value.get()
    }
}

impl<T> Mutex for SleepLock<T> {
    type Data = T;
    type Guard<'a>
        = SleepLockGuard<'a, T>
    where
        T: 'a;

    fn new(value: T) -> Self {
        Self::new(value)
    }

    fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lock()
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

unsafe impl<T> Send for SleepLockGuard<'_, T> where T: Send {}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}
