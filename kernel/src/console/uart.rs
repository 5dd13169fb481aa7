//! 16550a UART driver.
//!
//! Two transmit paths: an interrupt-driven ring for process output (may
//! block, so never callable from interrupt context) and a polled
//! synchronous path for kernel messages and echoes.

use core::hint;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::memory::layout::UART0;
use crate::sync::SpinLock;
use crate::{console, proc};

use super::print::PANICKED;

// Register offsets; several double up between read and write.
/// Receive holding (read) / transmit holding (write).
const RHR: usize = 0;
const THR: usize = 0;
/// Interrupt enable.
const IER: usize = 1;
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
/// FIFO control (write) / interrupt status (read).
const FCR: usize = 2;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1;
const ISR: usize = 2;
/// Line control.
const LCR: usize = 3;
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7;
/// Line status.
const LSR: usize = 5;
const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

unsafe fn read_reg(offset: usize) -> u8 {
    unsafe { ptr::with_exposed_provenance::<u8>(UART0 + offset).read_volatile() }
}

unsafe fn write_reg(offset: usize, value: u8) {
    unsafe {
        ptr::with_exposed_provenance_mut::<u8>(UART0 + offset).write_volatile(value);
    }
}

struct TxRing {
    buf: [u8; 32],
    /// Next write goes to `buf[wpos % len]`.
    wpos: usize,
    /// Next hardware byte comes from `buf[rpos % len]`.
    rpos: usize,
}

impl TxRing {
    fn is_full(&self) -> bool {
        self.wpos == self.rpos + self.buf.len()
    }

    fn is_empty(&self) -> bool {
        self.wpos == self.rpos
    }
}

static TX: SpinLock<TxRing> = SpinLock::new(TxRing {
    buf: [0; 32],
    wpos: 0,
    rpos: 0,
});

pub fn init() {
    unsafe {
        // Interrupts off while reprogramming.
        write_reg(IER, 0x00);

        // Baud 38.4k via the divisor latch.
        write_reg(LCR, LCR_BAUD_LATCH);
        write_reg(0, 0x03);
        write_reg(1, 0x00);

        // 8 data bits, no parity; reset FIFOs.
        write_reg(LCR, LCR_EIGHT_BITS);
        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

        write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
    }
}

/// Queues one byte of process output, sleeping while the ring is full.
pub fn putc(c: u8) {
    let mut tx = TX.lock();

    if PANICKED.load(Ordering::Relaxed) {
        loop {
            hint::spin_loop();
        }
    }

    while tx.is_full() {
        // Wait for the transmit interrupt to drain a slot.
        tx = proc::sleep(ptr::from_ref(&tx.rpos).addr(), tx);
    }
    let at = tx.wpos % tx.buf.len();
    tx.buf[at] = c;
    tx.wpos += 1;
    pump(&mut tx);
}

/// Polled output for kernel messages: spins on the transmit-idle bit and
/// never touches the ring or sleeps.
pub fn putc_sync(c: u8) {
    crate::interrupt::with_disabled(|| {
        while unsafe { read_reg(LSR) } & LSR_TX_IDLE == 0 {
            hint::spin_loop();
        }
        unsafe {
            write_reg(THR, c);
        }
    });
}

/// Feeds the hardware from the ring while it will take bytes. Caller
/// holds the ring lock; runs from both putc and the interrupt.
fn pump(tx: &mut TxRing) {
    loop {
        if tx.is_empty() {
            // Reading ISR clears a pending tx interrupt.
            unsafe {
                read_reg(ISR);
            }
            return;
        }
        if unsafe { read_reg(LSR) } & LSR_TX_IDLE == 0 {
            // Holding register full; the next interrupt resumes us.
            return;
        }
        let c = tx.buf[tx.rpos % tx.buf.len()];
        tx.rpos += 1;
        // putc may be waiting for the slot we just freed.
        proc::wakeup(ptr::from_ref(&tx.rpos).addr());
        unsafe {
            write_reg(THR, c);
        }
    }
}

fn getc() -> Option<u8> {
    unsafe { (read_reg(LSR) & LSR_RX_READY != 0).then(|| read_reg(RHR)) }
}

/// UART interrupt: drain input to the console line discipline, then keep
/// transmitting.
pub fn handle_interrupt() {
    while let Some(c) = getc() {
        console::handle_input(c);
    }

    let mut tx = TX.lock();
    pump(&mut tx);
}
