//! Kernel console output and the panic handler.

use core::fmt::{self, Write as _};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::SpinLock;

use super::uart;

/// Set on panic; freezes every other hart's console output so the panic
/// message survives unshredded.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

static WRITER: SpinLock<Writer> = SpinLock::new(Writer);

struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            uart::putc_sync(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    // Panic messages skip the lock: the holder may be the panicking hart.
    if PANICKED.load(Ordering::Relaxed) {
        let _ = Writer.write_fmt(args);
        return;
    }
    let _ = WRITER.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::console::print::_print(core::format_args!($($arg)*));
        $crate::print!("\n");
    }};
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    // Flagging first routes our own output around the writer lock, which
    // this hart may already hold.
    PANICKED.store(true, Ordering::Relaxed);
    crate::println!("kernel panic: {info}");
    loop {
        core::hint::spin_loop();
    }
}
