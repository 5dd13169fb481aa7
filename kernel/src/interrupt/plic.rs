//! The platform-level interrupt controller.

use core::ptr;

use crate::cpu;
use crate::memory::layout::{PLIC, UART0_IRQ, VIRTIO0_IRQ, plic_sclaim, plic_senable, plic_spriority};

unsafe fn write_u32(addr: usize, value: u32) {
    unsafe {
        ptr::with_exposed_provenance_mut::<u32>(addr).write_volatile(value);
    }
}

/// Gives our two device sources a non-zero priority; zero would leave
/// them masked board-wide.
pub fn init() {
    unsafe {
        write_u32(PLIC + UART0_IRQ as usize * 4, 1);
        write_u32(PLIC + VIRTIO0_IRQ as usize * 4, 1);
    }
}

/// Routes both sources to this hart's supervisor context and opens its
/// priority threshold.
pub fn init_hart() {
    let hart = cpu::id();
    unsafe {
        write_u32(plic_senable(hart), (1 << UART0_IRQ) | (1 << VIRTIO0_IRQ));
        write_u32(plic_spriority(hart), 0);
    }
}

/// Asks the PLIC which source interrupted; zero means none.
pub fn claim() -> u32 {
    let hart = cpu::id();
    unsafe { ptr::with_exposed_provenance::<u32>(plic_sclaim(hart)).read_volatile() }
}

/// Tells the PLIC we are done with `irq`; it may interrupt again.
pub fn complete(irq: u32) {
    let hart = cpu::id();
    unsafe {
        write_u32(plic_sclaim(hart), irq);
    }
}
