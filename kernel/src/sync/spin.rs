//! Spin locks.
//!
//! Acquire disables interrupts on the local hart (nested, via the
//! interrupt push/pop counter) before spinning, so an interrupt handler
//! can never deadlock against its own hart. Holding a spin lock across
//! any blocking operation other than [`crate::proc::sleep`] is forbidden.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mutex_core::{Condvar, Mutex};

use crate::cpu::Cpu;
use crate::{interrupt, proc};

/// The lock word itself, without data.
pub struct RawSpinLock {
    locked: AtomicBool,
    /// Hart holding the lock, for [`RawSpinLock::holding`] checks.
    owner: UnsafeCell<Option<&'static Cpu>>,
}

unsafe impl Sync for RawSpinLock {}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: UnsafeCell::new(None),
        }
    }

    /// Spins until the lock is held. Re-acquiring on the same hart is a
    /// fatal error.
    pub fn acquire(&self) {
        interrupt::push_disable();
        assert!(!self.holding(), "spinlock re-acquired by its holder");

        // Acquire ordering keeps the critical section's loads and stores
        // after this point; RISC-V gets a fence out of it.
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        unsafe {
            *self.owner.get() = Some(Cpu::current());
        }
    }

    /// Releases the lock and pops one interrupt-disable level.
    pub fn release(&self) {
        assert!(self.holding(), "spinlock released by a non-holder");
        unsafe {
            *self.owner.get() = None;
        }

        // Release ordering publishes the critical section's stores before
        // the lock is seen free.
        self.locked.store(false, Ordering::Release);

        unsafe {
            interrupt::pop_disable();
        }
    }

    /// Whether this hart holds the lock. Interrupts must be off.
    pub fn holding(&self) -> bool {
        assert!(!interrupt::is_enabled());
        self.locked.load(Ordering::Relaxed)
            && unsafe { *self.owner.get() }.is_some_and(|c| ptr::eq(c, Cpu::current()))
    }
}

/// A spin lock protecting a value.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    /// Releases a lock acquired by another kernel thread on this hart.
    /// Only the scheduler handoff needs this: a newly created process
    /// wakes up in `forkret` holding the lock the scheduler took.
    ///
    /// # Safety
    ///
    /// The lock must be held, by this hart, with no live guard.
    pub unsafe fn force_unlock(&self) {
        self.raw.release();
    }
}

impl<T> Mutex for SpinLock<T> {
    type Data = T;
    type Guard<'a>
        = SpinLockGuard<'a, T>
    where
        T: 'a;

    fn new(value: T) -> Self {
        Self::new(value)
    }

    fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard came from; used by [`crate::proc::sleep`] to
    /// reacquire after waking.
    pub(crate) fn source(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

/// A condition variable for spin-lock guards.
///
/// The wait channel is the address of the generation counter; the
/// counter itself distinguishes real notifications from spurious
/// wakeups.
pub struct SpinLockCondVar {
    generation: AtomicU64,
}

impl Default for SpinLockCondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLockCondVar {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    pub fn wait<'a, T>(&self, mut guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let seen = self.generation.load(Ordering::Relaxed);
        loop {
            guard = proc::sleep(ptr::from_ref(&self.generation).addr(), guard);
            if self.generation.load(Ordering::Relaxed) != seen {
                return guard;
            }
        }
    }

    pub fn notify(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        proc::wakeup(ptr::from_ref(&self.generation).addr());
    }
}

impl<T> Condvar<SpinLock<T>> for SpinLockCondVar {
    fn wait<'a>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T>
    where
        SpinLock<T>: 'a,
    {
        self.wait(guard)
    }

    fn notify_all(&self) {
        self.notify();
    }
}
