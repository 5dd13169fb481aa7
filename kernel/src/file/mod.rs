//! Open file objects.
//!
//! A [`File`] is a cheap clone handle (`dup`) onto shared per-open
//! state: permissions plus a payload — pipe end, inode with a shared
//! offset, or character device. The last handle to go closes the
//! payload: pipe ends wake their peer, inode references are put inside
//! a transaction.

use alloc::sync::Arc;

use osmium_abi::Stat;
use osmium_fs_types::BLOCK_SIZE;
use osmium_params::MAX_OP_BLOCKS;

use crate::error::KernelError;
use crate::fs::{inode, log};
use crate::memory::VirtAddr;
use crate::proc;

pub mod device;
pub mod pipe;

use self::pipe::Pipe;

/// An open file; clones share one offset and one set of permissions.
#[derive(Clone)]
pub struct File {
    data: Arc<FileData>,
}

struct FileData {
    readable: bool,
    writable: bool,
    payload: Payload,
}

enum Payload {
    Pipe { pipe: Arc<Pipe>, },
    Inode { ip: inode::Inode, offset: crate::sync::SpinLock<u32> },
    Device { major: i16, ip: inode::Inode },
}

impl Drop for FileData {
    fn drop(&mut self) {
        match &self.payload {
            Payload::Pipe { pipe } => pipe.close_end(self.writable),
            Payload::Inode { ip, .. } | Payload::Device { ip, .. } => {
                // The put may free the inode on disk, so it needs a
                // transaction of its own.
                let tx = log::begin();
                inode::put(&tx, *ip);
            }
        }
    }
}

impl File {
    /// A pipe: returns the read end and the write end.
    pub fn new_pipe() -> Result<(File, File), KernelError> {
        let pipe = Pipe::new()?;
        let read_end = File {
            data: Arc::new(FileData {
                readable: true,
                writable: false,
                payload: Payload::Pipe {
                    pipe: Arc::clone(&pipe),
                },
            }),
        };
        let write_end = File {
            data: Arc::new(FileData {
                readable: false,
                writable: true,
                payload: Payload::Pipe { pipe },
            }),
        };
        Ok((read_end, write_end))
    }

    /// A regular file over `ip`, whose reference this object now owns.
    pub fn new_inode(ip: inode::Inode, readable: bool, writable: bool) -> File {
        File {
            data: Arc::new(FileData {
                readable,
                writable,
                payload: Payload::Inode {
                    ip,
                    offset: crate::sync::SpinLock::new(0),
                },
            }),
        }
    }

    /// A device file dispatching through major number `major`.
    pub fn new_device(major: i16, ip: inode::Inode, readable: bool, writable: bool) -> File {
        File {
            data: Arc::new(FileData {
                readable,
                writable,
                payload: Payload::Device { major, ip },
            }),
        }
    }

    /// Another handle sharing this open file.
    pub fn dup(&self) -> File {
        self.clone()
    }

    /// `fstat`: metadata for inode-backed files.
    pub fn stat(&self) -> Result<Stat, KernelError> {
        match &self.data.payload {
            Payload::Inode { ip, .. } | Payload::Device { ip, .. } => {
                let tx = log::begin_read();
                let guard = inode::lock(&tx, *ip);
                let stat = guard.stat();
                drop(guard);
                Ok(stat)
            }
            Payload::Pipe { .. } => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Reads up to `n` bytes into user memory at `dst`.
    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, KernelError> {
        if !self.data.readable {
            return Err(KernelError::BadFileDescriptor);
        }

        match &self.data.payload {
            Payload::Pipe { pipe } => pipe.read(dst, n),
            Payload::Device { major, .. } => {
                let ops = device::get(*major)?;
                (ops.read)(true, dst.addr(), n)
            }
            Payload::Inode { ip, offset } => {
                let tx = log::begin_read();
                let mut guard = inode::lock(&tx, *ip);
                let off = *offset.lock();
                let read = guard.read(true, dst.addr(), off as usize, n)?;
                *offset.lock() = off + read as u32;
                Ok(read)
            }
        }
    }

    /// Writes `n` bytes from user memory at `src`.
    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, KernelError> {
        if !self.data.writable {
            return Err(KernelError::BadFileDescriptor);
        }

        match &self.data.payload {
            Payload::Pipe { pipe } => pipe.write(src, n),
            Payload::Device { major, .. } => {
                let ops = device::get(*major)?;
                (ops.write)(true, src.addr(), n)
            }
            Payload::Inode { ip, offset } => {
                // Split big writes so one transaction never exceeds the
                // per-operation log budget: data blocks, plus headroom
                // for the inode, the indirect block and bitmap blocks.
                let chunk = ((MAX_OP_BLOCKS - 4) / 2) * BLOCK_SIZE;

                let mut done = 0;
                while done < n {
                    let step = (n - done).min(chunk);

                    let tx = log::begin();
                    let mut guard = inode::lock(&tx, *ip);
                    let off = *offset.lock();
                    let wrote =
                        guard.write(true, src.addr() + done, off as usize, step)?;
                    *offset.lock() = off + wrote as u32;
                    drop(guard);
                    drop(tx);

                    done += wrote;
                    if wrote < step {
                        return Err(KernelError::OutOfBlocks);
                    }
                }
                Ok(done)
            }
        }
    }
}

/// Checks the killed flag mid-loop for the blocking paths.
pub(crate) fn caller_killed() -> bool {
    proc::current().shared().lock().is_killed()
}
