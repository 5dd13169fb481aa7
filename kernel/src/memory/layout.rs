//! Physical and virtual memory map.
//!
//! The qemu `virt` board, per its device tree:
//!
//! ```text
//! 0x0c00_0000  PLIC
//! 0x1000_0000  UART0
//! 0x1000_1000  virtio-mmio disk
//! 0x8000_0000  RAM; the boot ROM jumps here and -kernel loads here
//! ```
//!
//! The kernel identity-maps itself and the devices, and uses RAM up to
//! [`PHYS_TOP`]. The top of the virtual address space holds, in every
//! address space, the trampoline page; user spaces put the trapframe
//! just below it, and the kernel space packs one kernel stack per
//! process slot below that, each with an unmapped guard page beneath it.

use osmium_params::NPROC;

use super::{MAX_VA, PAGE_SIZE, VirtAddr};

pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: u32 = 10;

pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: u32 = 1;

pub const PLIC: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x40_0000;

pub const fn plic_senable(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}

pub const fn plic_spriority(hart: usize) -> usize {
    PLIC + 0x20_1000 + hart * 0x2000
}

pub const fn plic_sclaim(hart: usize) -> usize {
    PLIC + 0x20_1004 + hart * 0x2000
}

/// Start of RAM and of the kernel image.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// End of the RAM the kernel manages: 128 MiB.
pub const PHYS_TOP: usize = KERNEL_BASE + 128 * 1024 * 1024;

/// The trampoline page, highest page of every address space.
pub const TRAMPOLINE: VirtAddr = VirtAddr::new(MAX_VA - PAGE_SIZE);

/// Per-process trapframe page, mapped in user spaces only.
pub const TRAPFRAME: VirtAddr = TRAMPOLINE.byte_sub(PAGE_SIZE);

/// Kernel stack of process slot `i`: one mapped page, with the unmapped
/// page below it as overflow guard.
pub const fn kstack(i: usize) -> VirtAddr {
    assert!(i < NPROC);
    TRAMPOLINE.byte_sub((i + 1) * 2 * PAGE_SIZE)
}

/// Linker-provided boundaries of the kernel image.
pub mod image {
    unsafe extern "C" {
        #[link_name = "_kernel_text_end"]
        static TEXT_END: [u8; 0];
        #[link_name = "_kernel_end"]
        static KERNEL_END: [u8; 0];
        #[link_name = "_trampoline_start"]
        static TRAMPOLINE_START: [u8; 0];
    }

    /// First byte past kernel text (and the trampoline page).
    pub fn text_end() -> usize {
        unsafe { (&raw const TEXT_END).addr() }
    }

    /// First byte past the loaded kernel image.
    pub fn kernel_end() -> usize {
        unsafe { (&raw const KERNEL_END).addr() }
    }

    /// Physical address of the trampoline page.
    pub fn trampoline() -> usize {
        unsafe { (&raw const TRAMPOLINE_START).addr() }
    }
}
