//! The user/kernel contract.
//!
//! System calls pass the call number in `a7` and up to six arguments in
//! `a0..a5`, invoked with `ecall` from user mode. The result comes back in
//! `a0`; every failure is `usize::MAX` (-1).

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use dataview::Pod;
use strum::FromRepr;

/// System call numbers.
///
/// The numbering is part of the binary contract with user space and must
/// never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u64)]
pub enum SyscallCode {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
}

bitflags! {
    /// Flags for the `open` system call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct OpenFlags: usize {
        const RDONLY = 0x000;
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
    }
}

impl OpenFlags {
    /// Whether an open with these flags may read.
    #[must_use]
    pub fn readable(self) -> bool {
        !self.contains(Self::WRONLY)
    }

    /// Whether an open with these flags may write.
    #[must_use]
    pub fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// File kind reported by `fstat` and stored in on-disk inodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(i16)]
pub enum FileKind {
    Dir = 1,
    File = 2,
    Device = 3,
}

/// Result of the `fstat` system call, copied verbatim into user memory.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct Stat {
    /// Device the file lives on.
    pub dev: u32,
    /// Inode number.
    pub ino: u32,
    /// One of the [`FileKind`] discriminants.
    pub kind: i16,
    /// Number of hard links.
    pub nlink: i16,
    pub _pad: [u8; 4],
    /// File size in bytes.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_stable() {
        assert_eq!(SyscallCode::from_repr(1), Some(SyscallCode::Fork));
        assert_eq!(SyscallCode::from_repr(15), Some(SyscallCode::Open));
        assert_eq!(SyscallCode::from_repr(21), Some(SyscallCode::Close));
        assert_eq!(SyscallCode::from_repr(0), None);
        assert_eq!(SyscallCode::from_repr(22), None);
    }

    #[test]
    fn open_flag_permissions() {
        assert!(OpenFlags::RDONLY.readable());
        assert!(!OpenFlags::RDONLY.writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(OpenFlags::RDWR.readable());
        assert!(OpenFlags::RDWR.writable());
        assert!((OpenFlags::CREATE | OpenFlags::WRONLY).writable());
    }

    #[test]
    fn stat_layout_matches_abi() {
        assert_eq!(size_of::<Stat>(), 24);
        assert_eq!(core::mem::offset_of!(Stat, size), 16);
    }
}
