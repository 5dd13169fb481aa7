//! Timer ticks.
//!
//! Each hart rearms its own `stimecmp`; hart 0 also advances the global
//! tick count that `sleep(ticks)` and `uptime` observe.

use core::arch::asm;

use crate::cpu;
use crate::sync::{SpinLock, SpinLockCondVar};

/// About a tenth of a second of the 10 MHz qemu timebase.
const TICK_INTERVAL: u64 = 1_000_000;

pub static TICKS: SpinLock<u64> = SpinLock::new(0);
pub static TICKS_ADVANCED: SpinLockCondVar = SpinLockCondVar::new();

pub(super) fn handle_interrupt() {
    if cpu::id() == 0 {
        let mut ticks = TICKS.lock();
        *ticks += 1;
        drop(ticks);
        TICKS_ADVANCED.notify();
    }

    // Rearming stimecmp also retracts the pending interrupt.
    unsafe {
        let time: u64;
        asm!("csrr {}, time", out(reg) time);
        asm!("csrw stimecmp, {}", in(reg) time + TICK_INTERVAL);
    }
}
