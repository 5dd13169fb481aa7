//! Pipes: a bounded byte channel between a read end and a write end.
//!
//! The ring is addressed by two monotone counters; `nwrite - nread` is
//! the fill level. Writers sleep on the `nwrite` address when full,
//! readers on the `nread` address when empty, and either end's close
//! wakes the other. The `Arc` holding the ring frees it once both ends
//! are gone.

use alloc::sync::Arc;

use crate::error::KernelError;
use crate::memory::VirtAddr;
use crate::proc;
use crate::sync::SpinLock;

const PIPE_SIZE: usize = 512;

pub struct Pipe {
    inner: SpinLock<Ring>,
}

struct Ring {
    data: [u8; PIPE_SIZE],
    /// Bytes consumed, ever; the next read comes from `data[nread %
    /// PIPE_SIZE]`.
    nread: usize,
    /// Bytes produced, ever.
    nwrite: usize,
    read_open: bool,
    write_open: bool,
}

impl Pipe {
    pub(super) fn new() -> Result<Arc<Pipe>, KernelError> {
        Ok(Arc::new(Pipe {
            inner: SpinLock::new(Ring {
                data: [0; PIPE_SIZE],
                nread: 0,
                nwrite: 0,
                read_open: true,
                write_open: true,
            }),
        }))
    }

    /// Close one end, waking anyone blocked on the other.
    pub(super) fn close_end(&self, writable: bool) {
        let mut ring = self.inner.lock();
        if writable {
            ring.write_open = false;
            proc::wakeup(core::ptr::from_ref(&ring.nread).addr());
        } else {
            ring.read_open = false;
            proc::wakeup(core::ptr::from_ref(&ring.nwrite).addr());
        }
    }

    /// Copies `n` bytes from user memory into the pipe, blocking while
    /// full. Fails once the read end closes or the caller is killed.
    pub(super) fn write(&self, src: VirtAddr, n: usize) -> Result<usize, KernelError> {
        let owned = unsafe { proc::current().owned_mut() };

        let mut ring = self.inner.lock();
        let mut done = 0;
        while done < n {
            if !ring.read_open {
                return Err(KernelError::BrokenPipe);
            }
            if super::caller_killed() {
                return Err(KernelError::Killed);
            }
            if ring.nwrite == ring.nread + PIPE_SIZE {
                // Full: let readers drain, then wait for room.
                proc::wakeup(core::ptr::from_ref(&ring.nread).addr());
                let chan = core::ptr::from_ref(&ring.nwrite).addr();
                ring = proc::sleep(chan, ring);
                continue;
            }

            let mut byte = [0u8];
            if owned.space().copy_in(&mut byte, src.byte_add(done)).is_err() {
                break;
            }
            let at = ring.nwrite % PIPE_SIZE;
            ring.data[at] = byte[0];
            ring.nwrite += 1;
            done += 1;
        }
        proc::wakeup(core::ptr::from_ref(&ring.nread).addr());
        Ok(done)
    }

    /// Copies up to `n` bytes out of the pipe into user memory,
    /// blocking while the pipe is empty and a writer remains. A drained
    /// pipe with no writer reads as end-of-file.
    pub(super) fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, KernelError> {
        let owned = unsafe { proc::current().owned_mut() };

        let mut ring = self.inner.lock();
        while ring.nread == ring.nwrite && ring.write_open {
            if super::caller_killed() {
                return Err(KernelError::Killed);
            }
            let chan = core::ptr::from_ref(&ring.nread).addr();
            ring = proc::sleep(chan, ring);
        }

        let mut done = 0;
        while done < n && ring.nread != ring.nwrite {
            let byte = [ring.data[ring.nread % PIPE_SIZE]];
            ring.nread += 1;
            if owned
                .space_mut()
                .copy_out(dst.byte_add(done), &byte)
                .is_err()
            {
                break;
            }
            done += 1;
        }
        proc::wakeup(core::ptr::from_ref(&ring.nwrite).addr());
        Ok(done)
    }
}
