//! Process-facing system calls.

use crate::error::KernelError;
use crate::interrupt::timer::{TICKS, TICKS_ADVANCED};
use crate::proc::{self, Proc, ProcOwned};

use super::{arg_addr, arg_int};

pub(super) fn fork(_owned: &ProcOwned) -> Result<usize, KernelError> {
    proc::fork().map(|pid| pid as usize)
}

pub(super) fn exit(owned: &ProcOwned) -> Result<usize, KernelError> {
    let status = arg_int(owned, 0) as i32;
    proc::exit_current(status)
}

pub(super) fn wait(owned: &ProcOwned) -> Result<usize, KernelError> {
    let status_addr = arg_addr(owned, 0);
    proc::wait(status_addr).map(|pid| pid as usize)
}

pub(super) fn kill(owned: &ProcOwned) -> Result<usize, KernelError> {
    let pid = arg_int(owned, 0) as i32;
    proc::kill(pid).map(|()| 0)
}

pub(super) fn getpid(p: &Proc) -> Result<usize, KernelError> {
    Ok(p.shared().lock().pid() as usize)
}

pub(super) fn sbrk(owned: &ProcOwned) -> Result<usize, KernelError> {
    let delta = arg_int(owned, 0) as isize;
    proc::grow_current(delta)
}

/// Sleeps for the requested number of timer ticks.
pub(super) fn sleep(owned: &ProcOwned) -> Result<usize, KernelError> {
    let span = arg_int(owned, 0) as u64;

    let mut ticks = TICKS.lock();
    let start = *ticks;
    while *ticks - start < span {
        if proc::current().shared().lock().is_killed() {
            return Err(KernelError::Killed);
        }
        ticks = TICKS_ADVANCED.wait(ticks);
    }
    Ok(0)
}

pub(super) fn uptime() -> Result<usize, KernelError> {
    Ok(*TICKS.lock() as usize)
}
