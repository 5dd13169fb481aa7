//! Lock abstraction for code that runs both in the kernel and on the host.
//!
//! Storage-layer crates (`block_cache`, `redo_log`) are written against
//! these traits. The kernel instantiates them with its spin and sleep
//! locks; host tests instantiate them with `std::sync` types via the
//! adapters in [`host`] (enabled by the `std` feature).

#![cfg_attr(not(feature = "std"), no_std)]

use core::ops::DerefMut;

/// A mutual-exclusion lock protecting a value of type `Data`.
pub trait Mutex {
    /// The protected data.
    type Data;

    /// RAII guard giving exclusive access to the data.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a lock around `data`.
    fn new(data: Self::Data) -> Self;

    /// Acquires the lock, blocking until it is available.
    fn lock(&self) -> Self::Guard<'_>;
}

/// A condition variable usable with mutex `M`.
///
/// Spurious wakeups are allowed; callers re-check their predicate in a
/// loop around [`Condvar::wait`].
pub trait Condvar<M: Mutex> {
    /// Atomically releases `guard`, blocks until notified, and reacquires
    /// the lock.
    fn wait<'a>(&self, guard: M::Guard<'a>) -> M::Guard<'a>
    where
        M: 'a;

    /// Wakes every thread blocked in [`Condvar::wait`] on `self`.
    fn notify_all(&self);
}

#[cfg(feature = "std")]
pub mod host {
    //! `std::sync` adapters for host-side tests.

    use std::ops::{Deref, DerefMut};
    use std::sync;

    use super::{Condvar, Mutex};

    /// [`Mutex`] backed by [`std::sync::Mutex`]. Poisoning is ignored;
    /// a panicking test fails regardless.
    pub struct HostMutex<T>(sync::Mutex<T>);

    pub struct HostGuard<'a, T>(Option<sync::MutexGuard<'a, T>>);

    impl<T> Mutex for HostMutex<T> {
        type Data = T;
        type Guard<'a>
            = HostGuard<'a, T>
        where
            T: 'a;

        fn new(data: T) -> Self {
            Self(sync::Mutex::new(data))
        }

        fn lock(&self) -> HostGuard<'_, T> {
            HostGuard(Some(self.0.lock().unwrap_or_else(|e| e.into_inner())))
        }
    }

    impl<T> Deref for HostGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            self.0.as_ref().unwrap()
        }
    }

    impl<T> DerefMut for HostGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            self.0.as_mut().unwrap()
        }
    }

    /// [`Condvar`] backed by [`std::sync::Condvar`].
    #[derive(Default)]
    pub struct HostCondvar(sync::Condvar);

    impl HostCondvar {
        #[must_use]
        pub const fn new() -> Self {
            Self(sync::Condvar::new())
        }
    }

    impl<T> Condvar<HostMutex<T>> for HostCondvar {
        fn wait<'a>(&self, mut guard: HostGuard<'a, T>) -> HostGuard<'a, T>
        where
            HostMutex<T>: 'a,
        {
            let inner = guard.0.take().unwrap();
            guard.0 = Some(self.0.wait(inner).unwrap_or_else(|e| e.into_inner()));
            guard
        }

        fn notify_all(&self) {
            self.0.notify_all();
        }
    }
}
