//! The kernel's own address space.
//!
//! Built once on hart 0: devices and RAM identity-mapped, the trampoline
//! at the top, and one kernel stack per process slot just below it.
//! Every hart then installs the same root table.

use core::arch::asm;
use core::ptr::NonNull;

use once_slot::OnceSlot;
use osmium_params::NPROC;

use crate::memory::layout::{
    KERNEL_BASE, PHYS_TOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0, image, kstack,
};
use crate::memory::page_table::{PageTable, PteFlags};
use crate::memory::{PAGE_SIZE, PhysAddr, VirtAddr, page};

struct KernelSpace(NonNull<PageTable>);

unsafe impl Send for KernelSpace {}
unsafe impl Sync for KernelSpace {}

static KERNEL_SPACE: OnceSlot<KernelSpace> = OnceSlot::new();

fn map(pt: &mut PageTable, addr: usize, size: usize, perm: PteFlags) {
    pt.map_pages(VirtAddr::new(addr), size, PhysAddr::new(addr), perm)
        .expect("kernel map");
}

pub fn init() {
    let mut root = PageTable::alloc().expect("kernel root table");
    let pt = unsafe { root.as_mut() };

    // Device registers.
    map(pt, UART0, PAGE_SIZE, PteFlags::RW);
    map(pt, VIRTIO0, PAGE_SIZE, PteFlags::RW);
    map(pt, PLIC, PLIC_SIZE, PteFlags::RW);

    // Kernel text executes in place; everything after it (data, heap,
    // the frame pool) is plain memory.
    map(pt, KERNEL_BASE, image::text_end() - KERNEL_BASE, PteFlags::RX);
    map(
        pt,
        image::text_end(),
        PHYS_TOP - image::text_end(),
        PteFlags::RW,
    );

    // The trampoline page, also reachable at its link-time address via
    // the text mapping above.
    pt.map_page(
        TRAMPOLINE,
        PhysAddr::new(image::trampoline()),
        PteFlags::RX,
    )
    .expect("kernel map");

    // One stack page per process slot, high below the trampoline, each
    // with an unmapped guard page beneath it.
    for i in 0..NPROC {
        let frame = page::alloc_frame().expect("kernel stack frame");
        pt.map_page(
            kstack(i),
            PhysAddr::new(frame.addr().get()),
            PteFlags::RW,
        )
        .expect("kernel map");
    }

    KERNEL_SPACE.set(KernelSpace(root));
}

/// Turns paging on for this hart: one atomic satp install bracketed by
/// TLB flushes.
pub fn init_hart() {
    let satp = unsafe { KERNEL_SPACE.get().0.as_ref() }.satp();
    unsafe {
        asm!(
            "sfence.vma zero, zero",
            "csrw satp, {satp}",
            "sfence.vma zero, zero",
            satp = in(reg) satp,
        );
    }
}
