//! One process's address space.
//!
//! A [`UserSpace`] owns a root page table, every lower table page, and
//! every frame mapped below `size`. The trampoline and the process's
//! trapframe sit at the fixed top-of-space slots in every user space;
//! user addresses run from zero strictly below `size`.

use core::ptr::NonNull;
use core::slice;

use crate::error::KernelError;

use super::layout::{TRAMPOLINE, TRAPFRAME, image};
use super::page_table::{PageTable, PteFlags};
use super::{PAGE_SIZE, PhysAddr, VirtAddr, page, page_round_up};

pub struct UserSpace {
    root: NonNull<PageTable>,
    size: usize,
}

unsafe impl Send for UserSpace {}

impl UserSpace {
    /// An empty space: no user memory, but the trampoline and the given
    /// trapframe page already mapped.
    pub fn new(trapframe: PhysAddr) -> Result<Self, KernelError> {
        let mut root = PageTable::alloc()?;
        let pt = unsafe { root.as_mut() };

        // Supervisor-only on purpose: the trampoline runs with user satp
        // but in supervisor mode, so no U bit on either page.
        if let Err(e) = pt.map_page(
            TRAMPOLINE,
            PhysAddr::new(image::trampoline()),
            PteFlags::RX,
        ) {
            pt.free_children();
            unsafe {
                page::free_frame(root.cast());
            }
            return Err(e);
        }

        if let Err(e) = pt.map_page(TRAPFRAME, trapframe, PteFlags::RW) {
            pt.unmap_pages(TRAMPOLINE, 1, false);
            pt.free_children();
            unsafe {
                page::free_frame(root.cast());
            }
            return Err(e);
        }

        Ok(Self { root, size: 0 })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn satp(&self) -> usize {
        unsafe { self.root.as_ref() }.satp()
    }

    fn table(&mut self) -> &mut PageTable {
        unsafe { self.root.as_mut() }
    }

    fn table_ref(&self) -> &PageTable {
        unsafe { self.root.as_ref() }
    }

    /// Installs the embedded initcode at address zero; first process
    /// only. The image must fit one page.
    pub fn load_initcode(&mut self, code: &[u8]) {
        assert_eq!(self.size, 0);
        assert!(code.len() < PAGE_SIZE, "initcode does not fit one page");

        let frame = page::alloc_zeroed_frame().expect("initcode frame");
        unsafe {
            slice::from_raw_parts_mut(frame.as_ptr(), code.len()).copy_from_slice(code);
        }
        self.table()
            .map_page(
                VirtAddr::ZERO,
                PhysAddr::new(frame.addr().get()),
                PteFlags::URW | PteFlags::X,
            )
            .expect("initcode map");
        self.size = PAGE_SIZE;
    }

    /// Grows user memory to `new_size` bytes, mapping fresh zeroed
    /// frames readable plus `xperm`. Backs out completely on failure.
    pub fn grow(&mut self, new_size: usize, xperm: PteFlags) -> Result<(), KernelError> {
        if new_size <= self.size {
            return Ok(());
        }

        let old_size = self.size;
        let mut va = VirtAddr::new(page_round_up(self.size));
        while va.addr() < new_size {
            let frame = match page::alloc_zeroed_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    self.shrink(old_size);
                    return Err(e);
                }
            };
            if let Err(e) = self.table().map_page(
                va,
                PhysAddr::new(frame.addr().get()),
                PteFlags::UR | xperm,
            ) {
                unsafe {
                    page::free_frame(frame);
                }
                self.shrink(old_size);
                return Err(e);
            }
            self.size = va.addr() + PAGE_SIZE;
            va = va.byte_add(PAGE_SIZE);
        }
        self.size = new_size;
        Ok(())
    }

    /// Shrinks user memory to `new_size` bytes, freeing whole pages past
    /// the new end.
    pub fn shrink(&mut self, new_size: usize) {
        if new_size >= self.size {
            return;
        }
        let keep = page_round_up(new_size);
        let end = page_round_up(self.size);
        if keep < end {
            self.table()
                .unmap_pages(VirtAddr::new(keep), (end - keep) / PAGE_SIZE, true);
        }
        self.size = new_size;
    }

    /// Copies this space's entire user image into `target`, which must
    /// be empty. Used by fork.
    pub fn clone_into(&self, target: &mut UserSpace) -> Result<(), KernelError> {
        assert_eq!(target.size, 0);

        let mut va = VirtAddr::ZERO;
        while va.addr() < self.size {
            let pte = self.table_ref().find_leaf(va)?;
            let src = pte.phys_addr();
            let flags = pte.flags() & (PteFlags::RWX | PteFlags::U);

            let frame = match page::alloc_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    target.shrink(0);
                    return Err(e);
                }
            };
            unsafe {
                frame
                    .as_ptr()
                    .copy_from_nonoverlapping(src.as_ptr(), PAGE_SIZE);
            }
            if let Err(e) =
                target
                    .table()
                    .map_page(va, PhysAddr::new(frame.addr().get()), flags)
            {
                unsafe {
                    page::free_frame(frame);
                }
                target.shrink(0);
                return Err(e);
            }
            target.size = va.addr() + PAGE_SIZE;
            va = va.byte_add(PAGE_SIZE);
        }
        target.size = self.size;
        Ok(())
    }

    /// Strips the user bit from the page at `va`; exec uses this to turn
    /// the page below the stack into a guard.
    pub fn forbid_user(&mut self, va: VirtAddr) {
        let pte = self.table().walk(va, false).expect("guard page unmapped");
        assert!(pte.is_leaf());
        let flags = pte.flags() & !PteFlags::U;
        pte.set_flags(flags);
    }

    /// The mapped page containing `va`, from `va` to the page end, as a
    /// kernel slice. The loader writes segment bytes through this before
    /// the space is ever installed, so the U bit is the only requirement.
    pub fn page_slice(&mut self, va: VirtAddr) -> Result<&mut [u8], KernelError> {
        let pa = self.table_ref().translate(va.page_round_down(), PteFlags::U)?;
        let offset = va.page_offset();
        unsafe {
            Ok(slice::from_raw_parts_mut(
                pa.as_mut_ptr().add(offset),
                PAGE_SIZE - offset,
            ))
        }
    }

    /// Copies `src` into this space at `dst`.
    pub fn copy_out(&mut self, mut dst: VirtAddr, mut src: &[u8]) -> Result<(), KernelError> {
        while !src.is_empty() {
            let page_va = dst.page_round_down();
            let pa = self.table_ref().translate(page_va, PteFlags::UW)?;
            let offset = dst.page_offset();
            let n = src.len().min(PAGE_SIZE - offset);
            unsafe {
                pa.as_mut_ptr()
                    .add(offset)
                    .copy_from_nonoverlapping(src.as_ptr(), n);
            }
            src = &src[n..];
            dst = dst.byte_add(n);
        }
        Ok(())
    }

    /// Copies from this space at `src` into `dst`.
    pub fn copy_in(&self, mut dst: &mut [u8], mut src: VirtAddr) -> Result<(), KernelError> {
        while !dst.is_empty() {
            let page_va = src.page_round_down();
            let pa = self.table_ref().translate(page_va, PteFlags::UR)?;
            let offset = src.page_offset();
            let n = dst.len().min(PAGE_SIZE - offset);
            unsafe {
                dst.as_mut_ptr()
                    .copy_from_nonoverlapping(pa.as_ptr().add(offset), n);
            }
            dst = &mut dst[n..];
            src = src.byte_add(n);
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from this space into `dst`,
    /// returning its length (terminator excluded).
    pub fn copy_in_str(&self, dst: &mut [u8], mut src: VirtAddr) -> Result<usize, KernelError> {
        let mut copied = 0;
        while copied < dst.len() {
            let page_va = src.page_round_down();
            let pa = self.table_ref().translate(page_va, PteFlags::UR)?;
            let offset = src.page_offset();
            let n = (dst.len() - copied).min(PAGE_SIZE - offset);
            let bytes = unsafe { slice::from_raw_parts(pa.as_ptr().add(offset), n) };

            match bytes.iter().position(|&b| b == 0) {
                Some(nul) => {
                    dst[copied..copied + nul].copy_from_slice(&bytes[..nul]);
                    return Ok(copied + nul);
                }
                None => {
                    dst[copied..copied + n].copy_from_slice(bytes);
                    copied += n;
                    src = src.byte_add(n);
                }
            }
        }
        Err(KernelError::UnterminatedString)
    }
}

impl Drop for UserSpace {
    fn drop(&mut self) {
        let size = self.size;
        let pt = self.table();
        pt.unmap_pages(TRAMPOLINE, 1, false);
        pt.unmap_pages(TRAPFRAME, 1, false);
        if size > 0 {
            pt.unmap_pages(VirtAddr::ZERO, page_round_up(size) / PAGE_SIZE, true);
        }
        pt.free_children();
        unsafe {
            page::free_frame(self.root.cast());
        }
    }
}
