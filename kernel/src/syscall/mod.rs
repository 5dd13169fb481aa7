//! System call dispatch and argument decoding.
//!
//! The number arrives in `a7`, arguments in `a0..a5`, and the result —
//! `usize::MAX` for any failure — goes back in `a0`.

use osmium_abi::SyscallCode;
use osmium_params::MAX_PATH;

use crate::error::KernelError;
use crate::memory::VirtAddr;
use crate::proc::{Proc, ProcOwned};
use crate::println;

mod file;
mod proc;

/// The `n`-th raw syscall argument.
fn arg_raw(owned: &ProcOwned, n: usize) -> usize {
    let tf = owned.trapframe();
    (match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => unreachable!("syscall argument index"),
    }) as usize
}

fn arg_int(owned: &ProcOwned, n: usize) -> usize {
    arg_raw(owned, n)
}

fn arg_addr(owned: &ProcOwned, n: usize) -> VirtAddr {
    VirtAddr::new(arg_raw(owned, n))
}

/// Fetches the NUL-terminated string argument `n` into `buf`.
fn arg_str<'a>(
    owned: &ProcOwned,
    n: usize,
    buf: &'a mut [u8; MAX_PATH],
) -> Result<&'a [u8], KernelError> {
    let va = arg_addr(owned, n);
    let len = owned.space().copy_in_str(buf, va)?;
    Ok(&buf[..len])
}

/// Decodes and runs one system call, leaving the result in `a0`.
pub fn dispatch(p: &'static Proc, owned: &mut ProcOwned) {
    let number = owned.trapframe().a7;
    let Some(code) = SyscallCode::from_repr(number) else {
        let shared = p.shared().lock();
        println!(
            "{} {}: unknown syscall {}",
            shared.pid(),
            shared.name(),
            number
        );
        drop(shared);
        owned.trapframe_mut().a0 = u64::MAX;
        return;
    };

    let result = match code {
        SyscallCode::Fork => self::proc::fork(owned),
        SyscallCode::Exit => self::proc::exit(owned),
        SyscallCode::Wait => self::proc::wait(owned),
        SyscallCode::Pipe => self::file::pipe(owned),
        SyscallCode::Read => self::file::read(owned),
        SyscallCode::Kill => self::proc::kill(owned),
        SyscallCode::Exec => self::file::exec(owned),
        SyscallCode::Fstat => self::file::fstat(owned),
        SyscallCode::Chdir => self::file::chdir(owned),
        SyscallCode::Dup => self::file::dup(owned),
        SyscallCode::Getpid => self::proc::getpid(p),
        SyscallCode::Sbrk => self::proc::sbrk(owned),
        SyscallCode::Sleep => self::proc::sleep(owned),
        SyscallCode::Uptime => self::proc::uptime(),
        SyscallCode::Open => self::file::open(owned),
        SyscallCode::Write => self::file::write(owned),
        SyscallCode::Mknod => self::file::mknod(owned),
        SyscallCode::Unlink => self::file::unlink(owned),
        SyscallCode::Link => self::file::link(owned),
        SyscallCode::Mkdir => self::file::mkdir(owned),
        SyscallCode::Close => self::file::close(owned),
    };

    owned.trapframe_mut().a0 = match result {
        Ok(value) => value as u64,
        Err(_) => u64::MAX,
    };
}
