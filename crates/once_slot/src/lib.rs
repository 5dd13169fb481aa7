//! A cell that is written exactly once, early, and read forever after.
//!
//! Boot code initializes subsystems in a fixed order; each long-lived
//! singleton (superblock, disk cache, driver handle) lives in a
//! [`OnceSlot`] so that an out-of-order access is a loud panic instead of
//! a read of uninitialized memory.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

/// A write-once cell.
pub struct OnceSlot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T> Sync for OnceSlot<T> where T: Send + Sync {}

impl<T> Default for OnceSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for OnceSlot<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut t = f.debug_tuple("OnceSlot");
        match self.try_get() {
            Some(v) => t.field(v),
            None => t.field(&format_args!("<empty>")),
        };
        t.finish()
    }
}

impl<T> OnceSlot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores `value`, failing if the slot is already (being) filled.
    pub fn try_set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        unsafe {
            (*self.value.get()).write(value);
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Stores `value`.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already set.
    #[track_caller]
    pub fn set(&self, value: T) {
        assert!(self.try_set(value).is_ok(), "OnceSlot set twice");
    }

    /// Returns the stored value, or `None` before initialization completes.
    pub fn try_get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        Some(unsafe { (*self.value.get()).assume_init_ref() })
    }

    /// Returns the stored value.
    ///
    /// # Panics
    ///
    /// Panics if the slot has not been set.
    #[track_caller]
    pub fn get(&self) -> &T {
        self.try_get().expect("OnceSlot read before set")
    }
}

impl<T> Drop for OnceSlot<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            unsafe {
                (*self.value.get()).assume_init_drop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn set_then_get() {
        let slot = OnceSlot::new();
        slot.set(7);
        assert_eq!(*slot.get(), 7);
    }

    #[test]
    fn second_set_is_rejected() {
        let slot = OnceSlot::new();
        slot.set("a");
        assert_eq!(slot.try_set("b"), Err("b"));
        assert_eq!(*slot.get(), "a");
    }

    #[test]
    fn get_before_set() {
        let slot = OnceSlot::<u32>::new();
        assert!(slot.try_get().is_none());
    }

    #[test]
    fn debug_formatting() {
        let slot = OnceSlot::new();
        assert_eq!(format!("{slot:?}"), "OnceSlot(<empty>)");
        slot.set(3);
        assert_eq!(format!("{slot:?}"), "OnceSlot(3)");
    }

    #[test]
    fn racing_setters_agree_with_readers() {
        let slot = Arc::new(OnceSlot::new());
        let barrier = Arc::new(Barrier::new(8));

        let winners: Vec<_> = (0..8)
            .map(|i| {
                let slot = Arc::clone(&slot);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    slot.try_set(i).is_ok().then_some(i)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(*slot.get(), winners[0]);
    }

    #[test]
    fn drops_contents_once() {
        let value = Arc::new(());
        let slot = OnceSlot::new();
        slot.set(Arc::clone(&value));
        assert_eq!(Arc::strong_count(&value), 2);
        drop(slot);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
