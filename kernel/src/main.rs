//! Kernel entry point and boot orchestration.
//!
//! Hart 0 brings every subsystem up in dependency order, then releases
//! the secondary harts; all harts end up in the scheduler loop and never
//! leave it.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod console;
#[cfg(target_os = "none")]
mod cpu;
#[cfg(target_os = "none")]
mod error;
#[cfg(target_os = "none")]
mod file;
#[cfg(target_os = "none")]
mod fs;
#[cfg(target_os = "none")]
mod interrupt;
#[cfg(target_os = "none")]
mod memory;
#[cfg(target_os = "none")]
mod proc;
#[cfg(target_os = "none")]
mod start;
#[cfg(target_os = "none")]
mod sync;
#[cfg(target_os = "none")]
mod syscall;

#[cfg(target_os = "none")]
mod boot {
    use core::hint;
    use core::sync::atomic::{AtomicBool, Ordering};

    use crate::{console, cpu, file, fs, interrupt, memory, println, proc};

    static STARTED: AtomicBool = AtomicBool::new(false);

    /// start() jumps here in supervisor mode on all CPUs.
    pub(super) extern "C" fn main() -> ! {
        if cpu::id() == 0 {
            console::init();
            println!();
            println!("osmium kernel is booting");
            println!();
            memory::page::init(); // physical frame pool
            memory::heap::init(); // kernel heap for Box/Arc/Vec
            memory::kernel_space::init(); // build the kernel page table
            memory::kernel_space::init_hart(); // turn on paging
            proc::init(); // process table (kernel stacks)
            interrupt::trap::init_hart(); // install the kernel trap vector
            interrupt::plic::init(); // route device interrupts
            interrupt::plic::init_hart(); // accept them on this hart
            fs::block_io::init(); // disk block cache
            fs::virtio_disk::init(); // the disk itself
            file::device::init(); // device switch (console)
            proc::spawn_init(); // the first user process

            STARTED.store(true, Ordering::Release);
        } else {
            while !STARTED.load(Ordering::Acquire) {
                hint::spin_loop();
            }
            println!("hart {} starting", cpu::id());
            memory::kernel_space::init_hart(); // turn on paging
            interrupt::trap::init_hart(); // install the kernel trap vector
            interrupt::plic::init_hart(); // accept device interrupts
        }

        proc::scheduler::run()
    }
}

#[cfg(target_os = "none")]
pub(crate) use boot::main;

// Built for the host, the kernel is an empty placeholder so that
// `cargo test --workspace` runs the library crates' suites.
#[cfg(not(target_os = "none"))]
fn main() {}
