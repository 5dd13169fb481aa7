//! Compile-time tunables.
//!
//! The kernel, the `mkfs` image builder and the host tests all read these
//! constants from one place so that a kernel and the images it mounts can
//! never disagree about table sizes.

#![no_std]

/// Maximum number of processes.
pub const NPROC: usize = 64;
/// Maximum number of CPUs (harts).
pub const NCPU: usize = 8;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;
/// Maximum major device number.
pub const NDEV: usize = 10;
/// Device number of the file system root disk.
pub const ROOT_DEV: u32 = 1;
/// Maximum number of `exec` arguments.
pub const MAX_ARG: usize = 32;
/// Maximum number of blocks any single FS syscall may write.
pub const MAX_OP_BLOCKS: usize = 10;
/// Maximum data blocks in the on-disk log.
pub const LOG_SIZE: usize = MAX_OP_BLOCKS * 3;
/// Size of the disk block cache.
pub const NBUF: usize = MAX_OP_BLOCKS * 3;
/// Size of the file system image in blocks.
pub const FS_SIZE: usize = 2000;
/// Number of inodes in a formatted image.
pub const FS_NINODES: usize = 200;
/// Maximum length of a path argument.
pub const MAX_PATH: usize = 128;
/// User stack pages handed out by `exec` (plus one guard page below).
pub const USER_STACK_PAGES: usize = 1;
