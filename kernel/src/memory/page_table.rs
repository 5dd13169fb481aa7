//! The Sv39 page-table engine.
//!
//! Three levels of 512-entry tables; a virtual address splits into three
//! 9-bit indices over a 12-bit page offset. Table pages come from the
//! frame pool and are owned by the table that references them.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::error::KernelError;

use super::{MAX_VA, PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr, page};

bitflags! {
    /// Page-table entry permission and status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        /// Entry is valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// Accessible from user mode.
        const U = 1 << 4;
        /// Global mapping.
        const G = 1 << 5;
        /// Hardware accessed bit.
        const A = 1 << 6;
        /// Hardware dirty bit.
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
    }
}

/// One page-table entry: a physical page number over ten flag bits.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    const FLAG_MASK: usize = 0x3ff;

    const fn invalid() -> Self {
        Self(0)
    }

    fn from_parts(pa: PhysAddr, flags: PteFlags) -> Self {
        Self((pa.ppn() << 10) | flags.bits())
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & Self::FLAG_MASK)
    }

    pub fn phys_addr(self) -> PhysAddr {
        PhysAddr::from_ppn(self.0 >> 10)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// A valid entry carrying any of R/W/X maps a page; without them it
    /// points at the next table level.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::RWX)
    }

    fn next_table(self) -> Option<NonNull<PageTable>> {
        (self.is_valid() && !self.is_leaf())
            .then(|| NonNull::new(self.phys_addr().as_mut_ptr()).unwrap().cast())
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !Self::FLAG_MASK) | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry table page; the same type serves all three levels.
#[repr(C, align(4096))]
pub struct PageTable([Pte; 512]);

const _: () = assert!(size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// Allocates an empty table page.
    pub fn alloc() -> Result<NonNull<PageTable>, KernelError> {
        Ok(page::alloc_zeroed_frame()?.cast())
    }

    /// The 9-bit index of `va` at the given level (2 is the root).
    fn index(level: usize, va: VirtAddr) -> usize {
        debug_assert!(level <= 2);
        (va.addr() >> (PAGE_SHIFT + 9 * level)) & 0x1ff
    }

    /// Descends to the level-0 entry for `va`, allocating and installing
    /// intermediate tables when `create` is set. Returns `None` when the
    /// path is incomplete and `create` is unset, or when a table page
    /// cannot be allocated.
    pub fn walk(&mut self, va: VirtAddr, create: bool) -> Option<&mut Pte> {
        assert!(va.addr() < MAX_VA, "walk: va out of range");

        let mut table = self;
        for level in (1..=2).rev() {
            let pte = &mut table.0[Self::index(level, va)];
            let next = match pte.next_table() {
                Some(next) => next,
                None => {
                    assert!(!pte.is_leaf(), "walk: huge page in the way");
                    if !create {
                        return None;
                    }
                    let next = Self::alloc().ok()?;
                    *pte = Pte::from_parts(
                        PhysAddr::new(next.addr().get()),
                        PteFlags::V,
                    );
                    next
                }
            };
            table = unsafe { &mut *next.as_ptr() };
        }
        Some(&mut table.0[Self::index(0, va)])
    }

    /// The level-0 entry for `va`, which must be a mapped leaf.
    pub fn find_leaf(&self, va: VirtAddr) -> Result<Pte, KernelError> {
        if va.addr() >= MAX_VA {
            return Err(KernelError::AddressOutOfRange(va));
        }
        let mut table = self;
        for level in (1..=2).rev() {
            let pte = table.0[Self::index(level, va)];
            let next = pte.next_table().ok_or(KernelError::AddressNotMapped(va))?;
            table = unsafe { &*next.as_ptr() };
        }
        let pte = table.0[Self::index(0, va)];
        if !pte.is_leaf() {
            return Err(KernelError::AddressNotMapped(va));
        }
        Ok(pte)
    }

    /// Maps the single page at `va` to `pa`. Remapping a valid entry is
    /// a fatal error.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_page_aligned(), "map_page: unaligned va {va:#x}");
        assert!(perm.intersects(PteFlags::RWX), "map_page: no permissions");

        let pte = self.walk(va, true).ok_or(KernelError::OutOfFrames)?;
        assert!(!pte.is_valid(), "remap of a mapped page: va={va:#x}");
        *pte = Pte::from_parts(pa, perm | PteFlags::V);
        Ok(())
    }

    /// Maps `size` bytes starting at `va` to the physical range at `pa`,
    /// rounding to whole pages.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        assert!(size > 0, "map_pages: empty range");
        let start = va.page_round_down();
        let end = va.byte_add(size - 1).page_round_down();

        let mut va = start;
        let mut pa = PhysAddr::new(super::page_round_down(pa.addr()));
        loop {
            self.map_page(va, pa, perm)?;
            if va == end {
                return Ok(());
            }
            va = va.byte_add(PAGE_SIZE);
            pa = pa.byte_add(PAGE_SIZE);
        }
    }

    /// Unmaps `npages` pages starting at `va`; every entry must be a
    /// mapped leaf. With `free_frames`, the backing frames return to the
    /// pool.
    pub fn unmap_pages(&mut self, va: VirtAddr, npages: usize, free_frames: bool) {
        assert!(va.is_page_aligned(), "unmap_pages: unaligned va {va:#x}");

        for i in 0..npages {
            let va = va.byte_add(i * PAGE_SIZE);
            let pte = self.walk(va, false).expect("unmap of an unmapped page");
            assert!(pte.is_leaf(), "unmap of a non-leaf entry: va={va:#x}");
            let pa = pte.phys_addr();
            pte.clear();
            if free_frames {
                unsafe {
                    page::free_frame(NonNull::new(pa.as_mut_ptr()).unwrap());
                }
            }
        }
    }

    /// Resolves `va` to a physical address, requiring `flags` on the
    /// leaf entry.
    pub fn translate(&self, va: VirtAddr, flags: PteFlags) -> Result<PhysAddr, KernelError> {
        let pte = self.find_leaf(va.page_round_down())?;
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessibleMemory(va));
        }
        Ok(pte.phys_addr())
    }

    /// Frees every table page below this one. All leaf mappings must
    /// already have been unmapped.
    pub fn free_children(&mut self) {
        for pte in &mut self.0 {
            if let Some(next) = pte.next_table() {
                unsafe {
                    (*next.as_ptr()).free_children();
                    page::free_frame(next.cast());
                }
                pte.clear();
            } else {
                assert!(!pte.is_valid(), "freeing a table with live mappings");
            }
        }
    }

    /// The satp value that installs this table: Sv39 mode over our PPN.
    pub fn satp(&self) -> usize {
        const SATP_SV39: usize = 8 << 60;
        SATP_SV39 | (PhysAddr::new(core::ptr::from_ref(self).addr()).ppn())
    }
}
