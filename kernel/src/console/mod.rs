//! Console: line discipline over the UART, plus the character-device
//! entry points that user processes reach through major device 1.

use core::ptr;

use crate::error::KernelError;
use crate::proc;
use crate::sync::SpinLock;

pub mod print;
pub mod uart;

const BACKSPACE: u8 = 0x08;
const CTRL_D: u8 = 0x04;
const CTRL_P: u8 = 0x10;
const CTRL_U: u8 = 0x15;

const INPUT_LEN: usize = 128;

struct Input {
    buf: [u8; INPUT_LEN],
    /// Read cursor: consumed by `read`.
    rpos: usize,
    /// Written-so-far cursor: bytes the user may still edit.
    epos: usize,
    /// Committed cursor: bytes made visible to `read` by a newline.
    wpos: usize,
}

static INPUT: SpinLock<Input> = SpinLock::new(Input {
    buf: [0; INPUT_LEN],
    rpos: 0,
    epos: 0,
    wpos: 0,
});

pub fn init() {
    uart::init();
}

fn echo(c: u8) {
    if c == BACKSPACE {
        // Rub out the glyph on screen.
        uart::putc_sync(BACKSPACE);
        uart::putc_sync(b' ');
        uart::putc_sync(BACKSPACE);
    } else {
        uart::putc_sync(c);
    }
}

/// One input byte from the UART interrupt.
pub fn handle_input(c: u8) {
    match c {
        CTRL_P => {
            proc::dump();
            return;
        }
        CTRL_U => {
            let mut input = INPUT.lock();
            while input.epos != input.wpos && input.buf[(input.epos - 1) % INPUT_LEN] != b'\n' {
                input.epos -= 1;
                echo(BACKSPACE);
            }
            return;
        }
        BACKSPACE | 0x7f => {
            let mut input = INPUT.lock();
            if input.epos != input.wpos {
                input.epos -= 1;
                echo(BACKSPACE);
            }
            return;
        }
        _ => {}
    }

    let mut input = INPUT.lock();
    if input.epos - input.rpos >= INPUT_LEN {
        return; // line buffer full; drop input
    }

    let c = if c == b'\r' { b'\n' } else { c };
    echo(c);
    let at = input.epos % INPUT_LEN;
    input.buf[at] = c;
    input.epos += 1;

    if c == b'\n' || c == CTRL_D || input.epos - input.rpos == INPUT_LEN {
        // Commit the line; readers may consume it now.
        input.wpos = input.epos;
        proc::wakeup(ptr::from_ref(&input.rpos).addr());
    }
}

/// Console read: at most one line, blocking until one is committed.
/// Returns 0 at end-of-file (ctrl-D on an empty line).
pub fn read(user_dst: bool, mut dst: usize, n: usize) -> Result<usize, KernelError> {
    let target = n;
    let mut n = n;
    let mut input = INPUT.lock();
    while n > 0 {
        while input.rpos == input.wpos {
            if proc::current().shared().lock().is_killed() {
                return Err(KernelError::Killed);
            }
            input = proc::sleep(ptr::from_ref(&input.rpos).addr(), input);
        }

        let at = input.rpos % INPUT_LEN;
        let c = input.buf[at];
        input.rpos += 1;

        if c == CTRL_D {
            if n < target {
                // Leave the EOF for the next read so this one returns
                // the partial line.
                input.rpos -= 1;
            }
            break;
        }

        proc::either_copy_out(user_dst, dst, &[c])?;
        dst += 1;
        n -= 1;

        if c == b'\n' {
            break;
        }
    }
    Ok(target - n)
}

/// Console write: bytes go out through the interrupt-driven path.
pub fn write(user_src: bool, src: usize, n: usize) -> Result<usize, KernelError> {
    for i in 0..n {
        let mut c = [0u8];
        proc::either_copy_in(&mut c, user_src, src + i)?;
        uart::putc(c[0]);
    }
    Ok(n)
}

/// UART interrupt entry, called from the trap handler with the PLIC
/// claim outstanding.
pub fn handle_interrupt() {
    uart::handle_interrupt();
}
