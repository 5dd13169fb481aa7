//! The trampoline page and the addresses of its entry points.

use core::arch::global_asm;
use core::mem::offset_of;

use crate::memory::VirtAddr;
use crate::memory::layout::{TRAMPOLINE, TRAPFRAME, image};

use super::trap::TrapFrame;

global_asm!(
    include_str!("trampoline.s"),
    trapframe = const TRAPFRAME.addr(),
    tf_kernel_satp = const offset_of!(TrapFrame, kernel_satp),
    tf_kernel_sp = const offset_of!(TrapFrame, kernel_sp),
    tf_kernel_trap = const offset_of!(TrapFrame, kernel_trap),
    tf_kernel_hartid = const offset_of!(TrapFrame, kernel_hartid),
    tf_ra = const offset_of!(TrapFrame, ra),
    tf_sp = const offset_of!(TrapFrame, sp),
    tf_gp = const offset_of!(TrapFrame, gp),
    tf_tp = const offset_of!(TrapFrame, tp),
    tf_t0 = const offset_of!(TrapFrame, t0),
    tf_t1 = const offset_of!(TrapFrame, t1),
    tf_t2 = const offset_of!(TrapFrame, t2),
    tf_t3 = const offset_of!(TrapFrame, t3),
    tf_t4 = const offset_of!(TrapFrame, t4),
    tf_t5 = const offset_of!(TrapFrame, t5),
    tf_t6 = const offset_of!(TrapFrame, t6),
    tf_s0 = const offset_of!(TrapFrame, s0),
    tf_s1 = const offset_of!(TrapFrame, s1),
    tf_s2 = const offset_of!(TrapFrame, s2),
    tf_s3 = const offset_of!(TrapFrame, s3),
    tf_s4 = const offset_of!(TrapFrame, s4),
    tf_s5 = const offset_of!(TrapFrame, s5),
    tf_s6 = const offset_of!(TrapFrame, s6),
    tf_s7 = const offset_of!(TrapFrame, s7),
    tf_s8 = const offset_of!(TrapFrame, s8),
    tf_s9 = const offset_of!(TrapFrame, s9),
    tf_s10 = const offset_of!(TrapFrame, s10),
    tf_s11 = const offset_of!(TrapFrame, s11),
    tf_a0 = const offset_of!(TrapFrame, a0),
    tf_a1 = const offset_of!(TrapFrame, a1),
    tf_a2 = const offset_of!(TrapFrame, a2),
    tf_a3 = const offset_of!(TrapFrame, a3),
    tf_a4 = const offset_of!(TrapFrame, a4),
    tf_a5 = const offset_of!(TrapFrame, a5),
    tf_a6 = const offset_of!(TrapFrame, a6),
    tf_a7 = const offset_of!(TrapFrame, a7),
);

unsafe extern "C" {
    fn uservec();
    fn userret();
}

/// Virtual address of the user trap entry, as seen through the
/// trampoline mapping.
pub fn uservec_addr() -> VirtAddr {
    TRAMPOLINE.byte_add(uservec as usize - image::trampoline())
}

/// Virtual address of the return-to-user tail.
pub fn userret_addr() -> VirtAddr {
    TRAMPOLINE.byte_add(userret as usize - image::trampoline())
}
