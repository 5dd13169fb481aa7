//! The supervisor-mode trap vector.

use core::arch::global_asm;

global_asm!(
    include_str!("kernel_vec.s"),
    trap_kernel = sym super::trap::trap_kernel,
);

unsafe extern "C" {
    pub fn kernelvec();
}
