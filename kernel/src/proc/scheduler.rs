//! Per-CPU scheduling and the kernel context switch.
//!
//! Each hart runs [`run`] forever: find a runnable process, switch into
//! it, and take control back when it yields. Processes never switch to
//! each other directly; every handoff goes through the hart's scheduler
//! context.

use core::arch::{asm, naked_asm};
use core::mem::offset_of;

use crate::cpu::Cpu;
use crate::interrupt;
use crate::sync::SpinLockGuard;

use super::{PROC_TABLE, ProcShared, ProcState};

/// Callee-saved registers plus return address and stack pointer: all a
/// kernel thread needs to resume.
#[repr(C)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,
    s0: u64,
    s1: u64,
    s2: u64,
    s3: u64,
    s4: u64,
    s5: u64,
    s6: u64,
    s7: u64,
    s8: u64,
    s9: u64,
    s10: u64,
    s11: u64,
}

impl Context {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }

    pub fn clear(&mut self) {
        *self = Self::zeroed();
    }
}

/// The per-hart scheduler loop. Never returns.
pub fn run() -> ! {
    let cpu = Cpu::current();
    cpu.set_proc(None);

    loop {
        // The last process to run may have left interrupts off; open
        // them so devices (and the wakeups they cause) can get through.
        interrupt::enable();

        let mut ran = false;
        for p in &PROC_TABLE {
            let mut shared = p.shared().lock();
            if shared.state != ProcState::Runnable {
                continue;
            }

            // Hand the hart to this process. It releases its own lock
            // and reacquires it before switching back.
            shared.state = ProcState::Running;
            cpu.set_proc(Some(p.into()));
            unsafe {
                switch(cpu.scheduler.get(), &raw const shared.context);
            }

            // The process is parked again; its state already says why.
            cpu.set_proc(None);
            ran = true;
            drop(shared);
        }

        if !ran {
            // Nothing runnable anywhere; sleep until an interrupt
            // changes that.
            interrupt::enable();
            unsafe {
                asm!("wfi");
            }
        }
    }
}

/// Switches from the current process back to this hart's scheduler.
///
/// The caller must hold its own shared lock — and nothing else, since
/// the next process resumes with the hart's interrupt-disable depth —
/// and must already have moved `state` off `Running`.
pub(super) fn sched(shared: &mut SpinLockGuard<'_, ProcShared>) {
    assert_eq!(interrupt::disable_depth(), 1, "sched with locks held");
    assert!(!interrupt::is_enabled());
    assert_ne!(shared.state, ProcState::Running, "sched of a running proc");

    // The remembered interrupt-enable flag belongs to this kernel
    // thread, not the hart; carry it across the switch.
    let enabled = interrupt::enabled_before_push();
    let cpu = Cpu::current();
    unsafe {
        switch(&raw mut shared.context, cpu.scheduler.get());
    }
    unsafe {
        interrupt::restore_enabled_before_push(enabled);
    }
}

/// Saves the callee-saved set into `old` and resumes from `new`.
#[unsafe(naked)]
pub(super) extern "C" fn switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "sd ra, {ra}(a0)",
        "sd sp, {sp}(a0)",
        "sd s0, {s0}(a0)",
        "sd s1, {s1}(a0)",
        "sd s2, {s2}(a0)",
        "sd s3, {s3}(a0)",
        "sd s4, {s4}(a0)",
        "sd s5, {s5}(a0)",
        "sd s6, {s6}(a0)",
        "sd s7, {s7}(a0)",
        "sd s8, {s8}(a0)",
        "sd s9, {s9}(a0)",
        "sd s10, {s10}(a0)",
        "sd s11, {s11}(a0)",
        "ld ra, {ra}(a1)",
        "ld sp, {sp}(a1)",
        "ld s0, {s0}(a1)",
        "ld s1, {s1}(a1)",
        "ld s2, {s2}(a1)",
        "ld s3, {s3}(a1)",
        "ld s4, {s4}(a1)",
        "ld s5, {s5}(a1)",
        "ld s6, {s6}(a1)",
        "ld s7, {s7}(a1)",
        "ld s8, {s8}(a1)",
        "ld s9, {s9}(a1)",
        "ld s10, {s10}(a1)",
        "ld s11, {s11}(a1)",
        "ret",
        ra = const offset_of!(Context, ra),
        sp = const offset_of!(Context, sp),
        s0 = const offset_of!(Context, s0),
        s1 = const offset_of!(Context, s1),
        s2 = const offset_of!(Context, s2),
        s3 = const offset_of!(Context, s3),
        s4 = const offset_of!(Context, s4),
        s5 = const offset_of!(Context, s5),
        s6 = const offset_of!(Context, s6),
        s7 = const offset_of!(Context, s7),
        s8 = const offset_of!(Context, s8),
        s9 = const offset_of!(Context, s9),
        s10 = const offset_of!(Context, s10),
        s11 = const offset_of!(Context, s11),
    )
}
