//! File-system-facing system calls. Every mutating call runs inside one
//! transaction, so its block writes commit atomically.

use alloc::vec;
use alloc::vec::Vec;

use dataview::PodMethods as _;
use osmium_abi::{FileKind, OpenFlags};
use osmium_params::{MAX_ARG, MAX_PATH};

use crate::error::KernelError;
use crate::file::File;
use crate::fs::{inode, log, ops, path};
use crate::memory::PAGE_SIZE;
use crate::proc::{ProcOwned, exec as proc_exec};

use super::{arg_addr, arg_int, arg_str};

/// Fetches the file-descriptor argument `n` and the open file it names.
fn arg_file(owned: &ProcOwned, n: usize) -> Result<(usize, File), KernelError> {
    let fd = arg_int(owned, n);
    let file = owned.file(fd)?;
    Ok((fd, file))
}

pub(super) fn dup(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let (_fd, f) = arg_file(owned, 0)?;
    owned.add_file(f.dup())
}

pub(super) fn read(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let (_fd, f) = arg_file(owned, 0)?;
    let dst = arg_addr(owned, 1);
    let n = arg_int(owned, 2);
    f.read(dst, n)
}

pub(super) fn write(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let (_fd, f) = arg_file(owned, 0)?;
    let src = arg_addr(owned, 1);
    let n = arg_int(owned, 2);
    f.write(src, n)
}

pub(super) fn close(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let fd = arg_int(owned, 0);
    drop(owned.take_file(fd)?);
    Ok(0)
}

pub(super) fn fstat(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let (_fd, f) = arg_file(owned, 0)?;
    let dst = arg_addr(owned, 1);
    let stat = f.stat()?;
    owned.space_mut().copy_out(dst, stat.as_bytes())?;
    Ok(0)
}

pub(super) fn open(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let mut buf = [0; MAX_PATH];
    let path_name = arg_str(owned, 0, &mut buf)?;
    let flags = OpenFlags::from_bits_retain(arg_int(owned, 1));

    let tx = log::begin();

    let (ip, mut guard) = if flags.contains(OpenFlags::CREATE) {
        ops::create(&tx, path_name, FileKind::File, 0, 0)?
    } else {
        let ip = path::resolve(&tx, path_name)?;
        (ip, inode::lock(&tx, ip))
    };

    if guard.is_dir() && flags != OpenFlags::RDONLY {
        drop(guard);
        inode::put(&tx, ip);
        return Err(KernelError::IsADirectory);
    }

    // The File takes over this reference to ip.
    let file = match guard.kind() {
        FileKind::Device => {
            File::new_device(guard.major(), ip, flags.readable(), flags.writable())
        }
        _ => File::new_inode(ip, flags.readable(), flags.writable()),
    };

    if flags.contains(OpenFlags::TRUNC) && guard.kind() == FileKind::File {
        guard.truncate();
    }
    drop(guard);
    drop(tx);

    owned.add_file(file)
}

pub(super) fn mkdir(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let mut buf = [0; MAX_PATH];
    let path_name = arg_str(owned, 0, &mut buf)?;

    let tx = log::begin();
    let (ip, guard) = ops::create(&tx, path_name, FileKind::Dir, 0, 0)?;
    drop(guard);
    inode::put(&tx, ip);
    Ok(0)
}

pub(super) fn mknod(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let mut buf = [0; MAX_PATH];
    let path_name = arg_str(owned, 0, &mut buf)?;
    let major = arg_int(owned, 1) as i16;
    let minor = arg_int(owned, 2) as i16;

    let tx = log::begin();
    let (ip, guard) = ops::create(&tx, path_name, FileKind::Device, major, minor)?;
    drop(guard);
    inode::put(&tx, ip);
    Ok(0)
}

pub(super) fn unlink(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let mut buf = [0; MAX_PATH];
    let path_name = arg_str(owned, 0, &mut buf)?;

    let tx = log::begin();
    ops::unlink(&tx, path_name)?;
    Ok(0)
}

pub(super) fn link(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let mut old_buf = [0; MAX_PATH];
    let mut new_buf = [0; MAX_PATH];
    let old = arg_str(owned, 0, &mut old_buf)?;
    let new = arg_str(owned, 1, &mut new_buf)?;

    let tx = log::begin();
    ops::link(&tx, old, new)?;
    Ok(0)
}

pub(super) fn chdir(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let mut buf = [0; MAX_PATH];
    let path_name = arg_str(owned, 0, &mut buf)?;

    let tx = log::begin();
    let ip = path::resolve(&tx, path_name)?;
    let guard = inode::lock(&tx, ip);
    if !guard.is_dir() {
        drop(guard);
        inode::put(&tx, ip);
        return Err(KernelError::NotADirectory);
    }
    drop(guard);

    let old = owned.set_cwd(ip);
    inode::put(&tx, old);
    Ok(0)
}

pub(super) fn pipe(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let fd_array = arg_addr(owned, 0);

    let (read_end, write_end) = File::new_pipe()?;
    let rfd = owned.add_file(read_end)?;
    let wfd = match owned.add_file(write_end) {
        Ok(wfd) => wfd,
        Err(e) => {
            drop(owned.take_file(rfd));
            return Err(e);
        }
    };

    let fds = [rfd as i32, wfd as i32];
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&fds[0].to_le_bytes());
    bytes[4..].copy_from_slice(&fds[1].to_le_bytes());
    if let Err(e) = owned.space_mut().copy_out(fd_array, &bytes) {
        drop(owned.take_file(rfd));
        drop(owned.take_file(wfd));
        return Err(e);
    }
    Ok(0)
}

pub(super) fn exec(owned: &mut ProcOwned) -> Result<usize, KernelError> {
    let mut buf = [0; MAX_PATH];
    let path_name = arg_str(owned, 0, &mut buf)?;
    let uargv = arg_addr(owned, 1);

    let mut argv: Vec<Vec<u8>> = Vec::new();
    loop {
        if argv.len() > MAX_ARG {
            return Err(KernelError::ArgumentListTooLong);
        }

        // argv is an array of user pointers, NULL-terminated.
        let mut ptr_bytes = [0u8; 8];
        owned
            .space()
            .copy_in(&mut ptr_bytes, uargv.byte_add(argv.len() * 8))?;
        let arg_ptr = usize::from_le_bytes(ptr_bytes);
        if arg_ptr == 0 {
            break;
        }

        let mut arg = vec![0u8; PAGE_SIZE];
        let len = owned
            .space()
            .copy_in_str(&mut arg, crate::memory::VirtAddr::new(arg_ptr))?;
        arg.truncate(len);
        argv.push(arg);
    }

    proc_exec::exec(path_name, &argv)
}
