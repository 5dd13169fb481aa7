//! Multi-inode operations: create, link, unlink.
//!
//! Lock order throughout: parent directory before child. Every function
//! runs under one write transaction, so partial failures roll back with
//! the usual crash atomicity.

use osmium_abi::FileKind;
use osmium_fs_types::NAME_LEN;

use crate::error::KernelError;

use super::inode::{self, Inode, InodeGuard};
use super::log::Tx;
use super::path;

/// Creates `path` as a file, directory or device node, or — for plain
/// files only — returns the existing inode. The returned guard is
/// locked; the caller owns one reference.
pub fn create<'t>(
    tx: &'t Tx<true>,
    path_name: &[u8],
    kind: FileKind,
    major: i16,
    minor: i16,
) -> Result<(Inode, InodeGuard<'t, true>), KernelError> {
    let (dir_ip, name) = path::resolve_parent(tx, path_name)?;
    let name = &name[..path::name_len(&name)];

    let mut dir = inode::lock(tx, dir_ip);

    if let Some((existing, _off)) = dir.dir_lookup(name) {
        drop(dir);
        inode::put(tx, dir_ip);

        let guard = inode::lock(tx, existing);
        if kind == FileKind::File
            && matches!(guard.kind(), FileKind::File | FileKind::Device)
        {
            return Ok((existing, guard));
        }
        drop(guard);
        inode::put(tx, existing);
        return Err(KernelError::AlreadyExists);
    }

    let child_ip = match inode::alloc(tx, dir_ip.dev, kind) {
        Ok(ip) => ip,
        Err(e) => {
            drop(dir);
            inode::put(tx, dir_ip);
            return Err(e);
        }
    };

    let mut child = inode::lock(tx, child_ip);
    child.set_device(major, minor);
    child.inc_nlink(); // from 0: the directory entry about to exist
    child.update();

    let linked = (|| {
        if kind == FileKind::Dir {
            // "." and ".." before the directory becomes reachable.
            child.dir_link(b".", child_ip.ino)?;
            child.dir_link(b"..", dir_ip.ino)?;
        }
        dir.dir_link(name, child_ip.ino)?;
        if kind == FileKind::Dir {
            dir.inc_nlink(); // the child's ".."
            dir.update();
        }
        Ok(())
    })();

    if let Err(e) = linked {
        // Undo the allocation; the zero-link put frees it on disk.
        child.dec_nlink();
        child.update();
        drop(child);
        inode::put(tx, child_ip);
        drop(dir);
        inode::put(tx, dir_ip);
        return Err(e);
    }

    drop(dir);
    inode::put(tx, dir_ip);
    Ok((child_ip, child))
}

/// Removes the directory entry for `path`. Directories must be empty;
/// "." and ".." cannot be unlinked.
pub fn unlink(tx: &Tx<true>, path_name: &[u8]) -> Result<(), KernelError> {
    let (dir_ip, name) = path::resolve_parent(tx, path_name)?;
    let name = &name[..path::name_len(&name)];

    let mut dir = inode::lock(tx, dir_ip);

    let result = (|| {
        if name == b"." || name == b".." {
            return Err(KernelError::InvalidPath);
        }

        let (child_ip, off) = dir.dir_lookup(name).ok_or(KernelError::NotFound)?;
        let mut child = inode::lock(tx, child_ip);
        assert!(child.nlink() > 0, "unlink: inode without links");

        if child.is_dir() && !child.dir_is_empty() {
            drop(child);
            inode::put(tx, child_ip);
            return Err(KernelError::DirectoryNotEmpty);
        }

        dir.dir_clear_entry(off);
        if child.is_dir() {
            dir.dec_nlink(); // the child's ".." is gone
            dir.update();
        }

        child.dec_nlink();
        child.update();
        drop(child);
        inode::put(tx, child_ip);
        Ok(())
    })();

    drop(dir);
    inode::put(tx, dir_ip);
    result
}

/// Creates `new_path` as another name for `old_path`. Directories
/// cannot be linked, and links stay on one device.
pub fn link(tx: &Tx<true>, old_path: &[u8], new_path: &[u8]) -> Result<(), KernelError> {
    let old_ip = path::resolve(tx, old_path)?;

    let mut old = inode::lock(tx, old_ip);
    if old.is_dir() {
        drop(old);
        inode::put(tx, old_ip);
        return Err(KernelError::IsADirectory);
    }

    // Optimistically bump the link count, then attach the name; undo on
    // any failure.
    old.inc_nlink();
    old.update();
    drop(old);

    let attached = (|| {
        let (dir_ip, name) = path::resolve_parent(tx, new_path)?;
        let name = &name[..path::name_len(&name)];

        let mut dir = inode::lock(tx, dir_ip);
        let result = if dir_ip.dev != old_ip.dev {
            Err(KernelError::CrossDeviceLink)
        } else {
            dir.dir_link(name, old_ip.ino)
        };
        drop(dir);
        inode::put(tx, dir_ip);
        result
    })();

    if attached.is_err() {
        let mut old = inode::lock(tx, old_ip);
        old.dec_nlink();
        old.update();
        drop(old);
    }

    inode::put(tx, old_ip);
    attached
}
