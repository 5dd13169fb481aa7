//! Kernel-internal error values.
//!
//! Recoverable conditions travel as `Result<_, KernelError>`; at the
//! syscall boundary they all collapse to -1 in `a0`. Invariant
//! violations panic instead.

use crate::memory::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("process table full")]
    OutOfProcesses,
    #[error("no child processes")]
    NoChildren,
    #[error("no such process")]
    NoSuchProcess,
    #[error("caller already killed")]
    Killed,
    #[error("virtual address out of range: {0:#x}")]
    AddressOutOfRange(VirtAddr),
    #[error("address not mapped: {0:#x}")]
    AddressNotMapped(VirtAddr),
    #[error("inaccessible user memory: {0:#x}")]
    InaccessibleMemory(VirtAddr),
    #[error("string argument without a terminator")]
    UnterminatedString,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("file descriptor table full")]
    TooManyOpenFiles,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("no such file or directory")]
    NotFound,
    #[error("invalid path")]
    InvalidPath,
    #[error("file or directory already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("link across devices")]
    CrossDeviceLink,
    #[error("file too large")]
    FileTooLarge,
    #[error("out of disk blocks")]
    OutOfBlocks,
    #[error("out of inodes")]
    OutOfInodes,
    #[error("no such device")]
    NoSuchDevice,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("argument list too long")]
    ArgumentListTooLong,
    #[error("invalid executable")]
    InvalidExecutable,
}
