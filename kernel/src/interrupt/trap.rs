//! Trap dispatch: user and kernel entry points, device interrupts, and
//! the return path to user mode.

use riscv::interrupt::Trap;
use riscv::interrupt::supervisor::{Exception, Interrupt};
use riscv::register::stvec::{self, Stvec, TrapMode};
use riscv::register::{satp, scause, sepc, sstatus, stval};

use crate::memory::PAGE_SIZE;
use crate::memory::layout::{UART0_IRQ, VIRTIO0_IRQ};
use crate::{console, cpu, fs, interrupt, println, proc, syscall};

use super::{kernel_vec, plic, timer, trampoline};

/// Per-process register save area, one page, mapped at the fixed
/// [`crate::memory::layout::TRAPFRAME`] slot of the owning process's
/// address space. The first four fields are written by the kernel on the
/// way out and consumed by `uservec` on the way back in.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    /// Kernel page table (satp format).
    pub kernel_satp: u64,
    /// Top of this process's kernel stack.
    pub kernel_sp: u64,
    /// Address of `trap_user`.
    pub kernel_trap: u64,
    /// Saved user program counter.
    pub epc: u64,
    /// Hart id, kept in tp while in the kernel.
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Points traps at the kernel vector; used whenever this hart runs
/// kernel code.
pub fn init_hart() {
    let mut vec = Stvec::from_bits(0);
    vec.set_address(kernel_vec::kernelvec as usize);
    vec.set_trap_mode(TrapMode::Direct);
    unsafe {
        stvec::write(vec);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntrSource {
    Timer,
    Device,
    Unknown,
}

/// Handles an interrupt, exception or system call from user mode.
/// `uservec` jumps here after switching to the kernel page table.
pub extern "C" fn trap_user() {
    assert_eq!(
        sstatus::read().spp(),
        sstatus::SPP::User,
        "trap_user: not from user mode"
    );

    // From here on traps are kernel traps.
    init_hart();

    let p = proc::current();
    let owned = unsafe { p.owned_mut() };

    owned.trapframe_mut().epc = sepc::read() as u64;

    let cause: Trap<Interrupt, Exception> = scause::read().cause().try_into().unwrap();
    let mut source = IntrSource::Unknown;
    match cause {
        Trap::Exception(Exception::UserEnvCall) => {
            if p.shared().lock().is_killed() {
                proc::exit_current(-1);
            }

            // sepc points at the ecall; resume past it.
            owned.trapframe_mut().epc += 4;

            // sepc, scause and sstatus are saved now, so interrupts may
            // come back on for the duration of the call.
            interrupt::enable();
            syscall::dispatch(p, owned);
        }
        Trap::Exception(e) => {
            let shared = p.shared().lock();
            println!(
                "usertrap: exception {:?} pid={} name={}",
                e,
                shared.pid(),
                shared.name()
            );
            println!(
                "          sepc={:#x} stval={:#x}",
                sepc::read(),
                stval::read()
            );
            drop(shared);
            p.shared().lock().kill();
        }
        Trap::Interrupt(int) => {
            source = handle_device_interrupt(int);
            if source == IntrSource::Unknown {
                let shared = p.shared().lock();
                println!(
                    "usertrap: unexpected interrupt {:?} pid={} name={}",
                    int,
                    shared.pid(),
                    shared.name()
                );
                drop(shared);
                p.shared().lock().kill();
            }
        }
    }

    if p.shared().lock().is_killed() {
        proc::exit_current(-1);
    }

    // Timer interrupts end the quantum.
    if source == IntrSource::Timer {
        proc::yield_now();
    }

    trap_user_return();
}

/// Returns to user mode through the trampoline; does not come back.
pub fn trap_user_return() -> ! {
    let p = proc::current();
    let owned = unsafe { p.owned_mut() };

    // Interrupts stay off from here: the trap destination is about to
    // become uservec, which must not run on a kernel stack.
    interrupt::disable();

    let mut vec = Stvec::from_bits(0);
    vec.set_address(trampoline::uservec_addr().addr());
    vec.set_trap_mode(TrapMode::Direct);
    unsafe {
        stvec::write(vec);
    }

    // Plant what uservec needs for the next trap.
    let kstack_top = owned.kstack().addr() + PAGE_SIZE;
    let tf = owned.trapframe_mut();
    tf.kernel_satp = satp::read().bits() as u64;
    tf.kernel_sp = kstack_top as u64;
    tf.kernel_trap = trap_user as usize as u64;
    tf.kernel_hartid = cpu::id() as u64;

    // sret will drop to user mode with interrupts on...
    unsafe {
        sstatus::set_spp(sstatus::SPP::User);
        sstatus::set_spie();
    }

    // ...resuming at the saved user pc.
    unsafe {
        sepc::write(owned.trapframe().epc as usize);
    }

    let satp = owned.space().satp();
    let userret: extern "C" fn(usize) -> ! =
        unsafe { core::mem::transmute(trampoline::userret_addr().addr()) };
    userret(satp)
}

/// Traps raised while in supervisor mode: device interrupts, or a bug.
pub extern "C" fn trap_kernel() {
    let saved_sepc = sepc::read();
    let saved_sstatus = sstatus::read();

    assert_eq!(
        saved_sstatus.spp(),
        sstatus::SPP::Supervisor,
        "trap_kernel: not from supervisor mode"
    );
    assert!(!interrupt::is_enabled());

    let cause: Trap<Interrupt, Exception> = scause::read().cause().try_into().unwrap();
    let source = match cause {
        Trap::Exception(e) => {
            println!("kerneltrap: exception {e:?}");
            println!(
                "            sepc={:#x} stval={:#x}",
                saved_sepc,
                stval::read()
            );
            panic!("unexpected kernel trap");
        }
        Trap::Interrupt(int) => {
            let source = handle_device_interrupt(int);
            assert!(
                source != IntrSource::Unknown,
                "kerneltrap: unexpected interrupt {int:?}"
            );
            source
        }
    };

    if source == IntrSource::Timer && proc::try_current().is_some() {
        proc::yield_now();
    }

    // Yielding ran other code that took traps of its own; restore the
    // registers the sret path depends on.
    unsafe {
        sepc::write(saved_sepc);
        sstatus::write(saved_sstatus);
    }
}

/// Acknowledges and dispatches one device or timer interrupt.
fn handle_device_interrupt(int: Interrupt) -> IntrSource {
    match int {
        Interrupt::SupervisorTimer => {
            timer::handle_interrupt();
            IntrSource::Timer
        }
        Interrupt::SupervisorExternal => {
            let irq = plic::claim();
            match irq {
                UART0_IRQ => console::handle_interrupt(),
                VIRTIO0_IRQ => fs::virtio_disk::handle_interrupt(),
                0 => {}
                other => println!("unexpected interrupt irq={other}"),
            }
            // One interrupt at a time per source: completing re-arms it.
            if irq != 0 {
                plic::complete(irq);
            }
            IntrSource::Device
        }
        Interrupt::SupervisorSoft => IntrSource::Unknown,
    }
}
