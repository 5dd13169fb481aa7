//! Machine-mode bring-up: everything that must happen before the kernel
//! can live entirely in supervisor mode.

use core::arch::{asm, global_asm};

use osmium_params::NCPU;

use riscv::register::{
    mcounteren,
    medeleg::{self, Medeleg},
    mepc, mhartid,
    mideleg::{self, Mideleg},
    mstatus,
    satp::{self, Satp},
    scounteren, sie,
};

use crate::cpu;

/// Boot stack bytes per hart; enough for bring-up, after which every
/// kernel thread runs on its own kernel stack.
pub const BOOT_STACK_SIZE: usize = 4096;

static mut BOOT_STACK: [u8; BOOT_STACK_SIZE * NCPU] = [0; BOOT_STACK_SIZE * NCPU];

global_asm!(
    include_str!("entry.s"),
    boot_stack = sym BOOT_STACK,
    stack_size = const BOOT_STACK_SIZE,
    start = sym start,
);

/// `_entry` jumps here in machine mode, one call per hart.
extern "C" fn start() -> ! {
    // mret will drop to supervisor mode...
    unsafe {
        mstatus::set_mpp(mstatus::MPP::Supervisor);
    }

    // ...landing in main().
    unsafe {
        mepc::write(crate::main as usize);
    }

    // Paging stays off until the kernel page table exists.
    unsafe {
        satp::write(Satp::from_bits(0));
    }

    // Hand all interrupts and exceptions to supervisor mode.
    unsafe {
        medeleg::write(Medeleg::from_bits(0xffff));
        mideleg::write(Mideleg::from_bits(0xffff));
        let mut s = sie::read();
        s.set_sext(true);
        s.set_stimer(true);
        s.set_ssoft(true);
        sie::write(s);
    }

    // Open all of physical memory to supervisor mode via PMP.
    unsafe {
        riscv::register::pmpaddr0::write(0x3f_ffff_ffff_ffff);
        riscv::register::pmpcfg0::write(0xf);
    }

    timer_init();

    // Each hart keeps its id in tp; cpu::id() reads it back.
    unsafe {
        cpu::set_id(mhartid::read());
    }

    unsafe {
        asm!("mret", options(noreturn));
    }
}

/// Arranges for supervisor-mode timer interrupts via the sstc extension:
/// the kernel rearms `stimecmp` itself from then on.
fn timer_init() {
    unsafe {
        riscv::register::mie::set_stimer();
    }

    // Enable sstc (bit 63 of menvcfg)...
    unsafe {
        asm!("csrs menvcfg, {}", in(reg) 1u64 << 63);
    }

    // ...and let supervisor mode read time and write stimecmp. User mode
    // may read time for uptime-style loops.
    unsafe {
        mcounteren::set_tm();
        scounteren::set_tm();
    }

    // The first tick fires immediately.
    unsafe {
        let time: u64;
        asm!("csrr {}, time", out(reg) time);
        asm!("csrw stimecmp, {}", in(reg) time);
    }
}
