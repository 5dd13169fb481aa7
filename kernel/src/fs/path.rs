//! Path name resolution.

use osmium_fs_types::{InodeNo, NAME_LEN};

use crate::error::KernelError;
use crate::proc;

use super::inode::{self, Inode};
use super::log::Tx;
use super::DeviceNo;

/// Splits the first path element off `path`.
///
/// Leading slashes are skipped on both sides, so `"//a///b"` yields
/// `("a", "b")` and a bare `"///"` yields `None`.
fn first_element(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let (elem, rest) = path.split_at(end);
    let next = rest.iter().position(|&c| c != b'/').unwrap_or(rest.len());
    Some((elem, &rest[next..]))
}

/// Walks `path` from the root (absolute) or the current process's
/// working directory (relative). With `stop_at_parent`, stops one
/// element early, returning the parent directory and copying the final
/// element into `name_out`.
///
/// The returned inode is referenced but unlocked; resolution locks each
/// directory only while looking up the next element.
fn walk<const WRITE: bool>(
    tx: &Tx<WRITE>,
    path: &[u8],
    stop_at_parent: bool,
    name_out: &mut [u8; NAME_LEN],
) -> Result<Inode, KernelError> {
    let mut ip = if path.first() == Some(&b'/') {
        inode::get(DeviceNo::ROOT, InodeNo::ROOT)
    } else {
        let owned = unsafe { proc::current().owned_mut() };
        inode::dup(owned.cwd())
    };

    let mut rest = path;
    while let Some((name, after)) = first_element(rest) {
        rest = after;

        let copy = name.len().min(NAME_LEN);
        name_out[..copy].copy_from_slice(&name[..copy]);
        name_out[copy..].fill(0);

        let mut dir = inode::lock(tx, ip);
        if !dir.is_dir() {
            drop(dir);
            inode::put(tx, ip);
            return Err(KernelError::NotADirectory);
        }

        if stop_at_parent && rest.is_empty() {
            return Ok(ip);
        }

        let Some((next, _off)) = dir.dir_lookup(name) else {
            drop(dir);
            inode::put(tx, ip);
            return Err(KernelError::NotFound);
        };
        drop(dir);
        inode::put(tx, ip);
        ip = next;
    }

    if stop_at_parent {
        // Nothing but slashes: there is no final element.
        inode::put(tx, ip);
        return Err(KernelError::NotFound);
    }
    Ok(ip)
}

/// The inode named by `path`; referenced, unlocked.
pub fn resolve<const WRITE: bool>(tx: &Tx<WRITE>, path: &[u8]) -> Result<Inode, KernelError> {
    let mut name = [0; NAME_LEN];
    walk(tx, path, false, &mut name)
}

/// The parent directory of the object named by `path`, plus the final
/// path element.
pub fn resolve_parent<const WRITE: bool>(
    tx: &Tx<WRITE>,
    path: &[u8],
) -> Result<(Inode, [u8; NAME_LEN]), KernelError> {
    let mut name = [0; NAME_LEN];
    let ip = walk(tx, path, true, &mut name)?;
    Ok((ip, name))
}

/// Length of the stored element in a `resolve_parent` name buffer.
pub fn name_len(name: &[u8; NAME_LEN]) -> usize {
    name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN)
}
