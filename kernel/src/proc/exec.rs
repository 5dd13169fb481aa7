//! exec: replace the current user image with a program from disk.

use alloc::vec::Vec;

use dataview::PodMethods as _;
use osmium_params::{MAX_ARG, USER_STACK_PAGES};

use crate::error::KernelError;
use crate::fs::{self, inode, path};
use crate::memory::page_table::PteFlags;
use crate::memory::user_space::UserSpace;
use crate::memory::{PAGE_SIZE, PhysAddr, VirtAddr, page_round_up};
use crate::proc;

use super::elf::{ELF_MAGIC, ElfHeader, PF_W, PF_X, PT_LOAD, ProgramHeader};

fn segment_perm(flags: u32) -> PteFlags {
    let mut perm = PteFlags::empty();
    if flags & PF_X != 0 {
        perm |= PteFlags::X;
    }
    if flags & PF_W != 0 {
        perm |= PteFlags::W;
    }
    perm
}

/// Replaces the current process image with the executable at `path`,
/// passing `argv`. On success returns `argc`, which the syscall layer
/// leaves in `a0`, with `a1` already pointing at the argv array; on any
/// failure the old image is untouched.
pub fn exec(path_name: &[u8], argv: &[Vec<u8>]) -> Result<usize, KernelError> {
    assert!(argv.len() <= MAX_ARG);

    let p = proc::current();
    let owned = unsafe { p.owned_mut() };

    // Load the image under one FS transaction, fully into a fresh
    // address space; nothing touches the current one yet.
    let tx = fs::log::begin();
    let ip = path::resolve(&tx, path_name)?;
    let loaded = (|| {
        let mut lip = inode::lock(&tx, ip);

        let mut elf = ElfHeader::zeroed();
        if lip.read_bytes(0, elf.as_bytes_mut())? != size_of::<ElfHeader>() {
            return Err(KernelError::InvalidExecutable);
        }
        if elf.magic != ELF_MAGIC {
            return Err(KernelError::InvalidExecutable);
        }

        let trapframe = PhysAddr::new(owned.trapframe_ptr().addr().get());
        let mut space = UserSpace::new(trapframe)?;

        for i in 0..elf.phnum as usize {
            let off = elf.phoff as usize + i * size_of::<ProgramHeader>();
            let mut ph = ProgramHeader::zeroed();
            if lip.read_bytes(off, ph.as_bytes_mut())? != size_of::<ProgramHeader>() {
                return Err(KernelError::InvalidExecutable);
            }
            if ph.ty != PT_LOAD {
                continue;
            }
            if ph.memsz < ph.filesz || ph.vaddr.checked_add(ph.memsz).is_none() {
                return Err(KernelError::InvalidExecutable);
            }
            let va = VirtAddr::new(ph.vaddr as usize);
            if !va.is_page_aligned() {
                return Err(KernelError::InvalidExecutable);
            }

            space.grow((ph.vaddr + ph.memsz) as usize, segment_perm(ph.flags))?;
            load_segment(&mut space, va, &mut lip, ph.off as usize, ph.filesz as usize)?;
        }

        Ok((space, elf.entry))
    })();

    inode::put(&tx, ip);
    drop(tx);
    let (mut space, entry) = loaded?;

    // Stack: a guard page stripped of its user bit, then the stack
    // proper, at the next page boundary past the image.
    let base = page_round_up(space.size());
    space.grow(base + (USER_STACK_PAGES + 1) * PAGE_SIZE, PteFlags::W)?;
    space.forbid_user(VirtAddr::new(base));
    let stack_base = base + PAGE_SIZE;

    let (sp, argv_ptr) = push_arguments(&mut space, stack_base, argv)?;

    // Commit. From here the old image is gone.
    if let Some(file_name) = path_name.rsplit(|&b| b == b'/').next() {
        p.shared().lock().set_name(file_name);
    }
    owned.replace_space(space);
    let tf = owned.trapframe_mut();
    tf.epc = entry;
    tf.sp = sp as u64;
    tf.a1 = argv_ptr as u64;

    Ok(argv.len())
}

/// Copies `filesz` bytes of segment content to `va`, page by page,
/// through the new (not yet installed) page table.
fn load_segment(
    space: &mut UserSpace,
    va: VirtAddr,
    lip: &mut inode::InodeGuard<'_, true>,
    file_off: usize,
    filesz: usize,
) -> Result<(), KernelError> {
    let mut done = 0;
    while done < filesz {
        let dst = space.page_slice(va.byte_add(done))?;
        let n = (filesz - done).min(dst.len());
        if lip.read_bytes(file_off + done, &mut dst[..n])? != n {
            return Err(KernelError::InvalidExecutable);
        }
        done += n;
    }
    Ok(())
}

/// Lays out argument strings and the argv pointer array on the new
/// stack, 16-byte aligned, and returns `(sp, argv)`.
fn push_arguments(
    space: &mut UserSpace,
    stack_base: usize,
    argv: &[Vec<u8>],
) -> Result<(usize, usize), KernelError> {
    let mut sp = space.size();
    let mut arg_ptrs = [0u64; MAX_ARG + 1];

    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1;
        sp -= sp % 16; // the ABI wants sp 16-byte aligned
        if sp < stack_base {
            return Err(KernelError::ArgumentListTooLong);
        }
        space.copy_out(VirtAddr::new(sp), arg)?;
        space.copy_out(VirtAddr::new(sp + arg.len()), &[0])?;
        arg_ptrs[i] = sp as u64;
    }
    arg_ptrs[argv.len()] = 0;

    let table = &arg_ptrs[..=argv.len()];
    sp -= size_of_val(table);
    sp -= sp % 16;
    if sp < stack_base {
        return Err(KernelError::ArgumentListTooLong);
    }
    let bytes =
        unsafe { core::slice::from_raw_parts(table.as_ptr().cast::<u8>(), size_of_val(table)) };
    space.copy_out(VirtAddr::new(sp), bytes)?;

    Ok((sp, sp))
}
