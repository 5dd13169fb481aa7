//! Kernel locks: spinning, sleeping, and a condition variable over the
//! sleep/wakeup rendezvous.

mod sleep;
mod spin;

pub use self::sleep::{SleepLock, SleepLockGuard};
pub use self::spin::{RawSpinLock, SpinLock, SpinLockCondVar, SpinLockGuard};
