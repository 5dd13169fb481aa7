//! Processes: the fixed table, lifecycle operations, and the
//! sleep/wakeup rendezvous.
//!
//! Each slot splits in two. The *shared* half (state, pid, killed, saved
//! context) sits behind the slot's spin lock and may be examined by any
//! hart — the scheduler, `wait`ing parents, `kill`. The *owned* half
//! (address space, trapframe, open files, cwd) belongs to the process
//! itself; only the owning thread touches it, except for a parent
//! reaping a zombie, when no owning thread remains.
//!
//! Parent links live apart from both, guarded by one global wait lock
//! ordered before any slot lock, so exit and wait cannot miss each
//! other.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::slice;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

use arrayvec::ArrayString;
use osmium_params::{NOFILE, NPROC};

use crate::error::KernelError;
use crate::file::File;
use crate::fs::{self, DeviceNo, inode};
use crate::interrupt::trap::{self, TrapFrame};
use crate::memory::layout::kstack;
use crate::memory::page_table::PteFlags;
use crate::memory::user_space::UserSpace;
use crate::memory::{PAGE_SIZE, PhysAddr, VirtAddr, page};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::{cpu::Cpu, interrupt, println};

use self::scheduler::Context;

mod elf;
pub mod exec;
pub mod scheduler;

pub type Pid = i32;

pub(crate) static PROC_TABLE: [Proc; NPROC] = [const { Proc::new() }; NPROC];

/// The init process, adoptive parent of every orphan.
static INIT_PROC: AtomicPtr<Proc> = AtomicPtr::new(ptr::null_mut());

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Serializes use of every `parent` link; taken before any slot lock.
static WAIT_LOCK: SpinLock<()> = SpinLock::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping { chan: usize },
    Runnable,
    Running,
    Zombie { status: i32 },
}

/// The half of a process any hart may examine, under the slot lock.
pub struct ProcShared {
    pid: Pid,
    state: ProcState,
    killed: bool,
    name: ArrayString<16>,
    /// Kernel context; `switch` here resumes the process.
    pub(crate) context: Context,
}

impl ProcShared {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name.clear();
        for chunk in name.utf8_chunks() {
            for c in chunk.valid().chars() {
                if self.name.try_push(c).is_err() {
                    return;
                }
            }
            if !chunk.invalid().is_empty() {
                let _ = self.name.try_push(char::REPLACEMENT_CHARACTER);
            }
        }
    }

    pub fn kill(&mut self) {
        self.killed = true;
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }
}

/// The half only the owning thread (or a reaping parent) touches.
pub struct ProcOwned {
    /// This slot's kernel stack page.
    kstack: VirtAddr,
    space: Option<UserSpace>,
    trapframe: Option<NonNull<TrapFrame>>,
    files: [Option<File>; NOFILE],
    cwd: Option<inode::Inode>,
}

impl ProcOwned {
    const fn new() -> Self {
        Self {
            kstack: VirtAddr::ZERO,
            space: None,
            trapframe: None,
            files: [const { None }; NOFILE],
            cwd: None,
        }
    }

    pub fn kstack(&self) -> VirtAddr {
        self.kstack
    }

    pub fn space(&self) -> &UserSpace {
        self.space.as_ref().unwrap()
    }

    pub fn space_mut(&mut self) -> &mut UserSpace {
        self.space.as_mut().unwrap()
    }

    /// Swaps in a freshly built image, dropping (and thereby freeing)
    /// the old one. The exec commit point.
    pub fn replace_space(&mut self, space: UserSpace) {
        self.space = Some(space);
    }

    pub fn trapframe(&self) -> &TrapFrame {
        unsafe { self.trapframe.unwrap().as_ref() }
    }

    /// The trapframe's physical location; exec maps the same frame into
    /// the replacement address space.
    pub fn trapframe_ptr(&self) -> NonNull<TrapFrame> {
        self.trapframe.unwrap()
    }

    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        unsafe { self.trapframe.unwrap().as_mut() }
    }

    pub fn file(&self, fd: usize) -> Result<File, KernelError> {
        self.files
            .get(fd)
            .and_then(|f| f.clone())
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn add_file(&mut self, file: File) -> Result<usize, KernelError> {
        let slot = self
            .files
            .iter_mut()
            .enumerate()
            .find(|(_, f)| f.is_none())
            .ok_or(KernelError::TooManyOpenFiles)?;
        *slot.1 = Some(file);
        Ok(slot.0)
    }

    pub fn take_file(&mut self, fd: usize) -> Result<File, KernelError> {
        self.files
            .get_mut(fd)
            .and_then(|f| f.take())
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn cwd(&self) -> inode::Inode {
        self.cwd.unwrap()
    }

    pub fn set_cwd(&mut self, cwd: inode::Inode) -> inode::Inode {
        self.cwd.replace(cwd).unwrap()
    }
}

/// One process-table slot.
pub struct Proc {
    shared: SpinLock<ProcShared>,
    /// Guarded by [`WAIT_LOCK`], not the slot lock.
    parent: UnsafeCell<Option<&'static Proc>>,
    owned: UnsafeCell<ProcOwned>,
}

unsafe impl Sync for Proc {}

impl Proc {
    const fn new() -> Self {
        Self {
            shared: SpinLock::new(ProcShared {
                pid: 0,
                state: ProcState::Unused,
                killed: false,
                name: ArrayString::new_const(),
                context: Context::zeroed(),
            }),
            parent: UnsafeCell::new(None),
            owned: UnsafeCell::new(ProcOwned::new()),
        }
    }

    pub fn shared(&self) -> &SpinLock<ProcShared> {
        &self.shared
    }

    /// The owned half.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this — or a parent holding the
    /// slot lock of a `Zombie` child, which has no owning thread.
    #[expect(clippy::mut_from_ref)]
    pub unsafe fn owned_mut(&self) -> &mut ProcOwned {
        unsafe { &mut *self.owned.get() }
    }

    fn parent_of(&self, _wait: &SpinLockGuard<'_, ()>) -> Option<&'static Proc> {
        unsafe { *self.parent.get() }
    }

    fn set_parent(&self, parent: Option<&'static Proc>, _wait: &mut SpinLockGuard<'_, ()>) {
        unsafe {
            *self.parent.get() = parent;
        }
    }
}

/// Records each slot's kernel stack address; the stacks themselves were
/// mapped when the kernel address space was built.
pub fn init() {
    for (i, p) in PROC_TABLE.iter().enumerate() {
        unsafe { p.owned_mut() }.kstack = kstack(i);
    }
}

/// The process running on this hart, if any.
pub fn try_current() -> Option<&'static Proc> {
    let p = interrupt::with_disabled(|| Cpu::current().proc())?;
    Some(unsafe { p.as_ref() })
}

/// The process running on this hart.
#[track_caller]
pub fn current() -> &'static Proc {
    try_current().expect("no current process")
}

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Claims an unused slot and equips it to run in the kernel: trapframe
/// page, empty user space, context aimed at `forkret`. Returns with the
/// slot lock held and the state `Used`.
fn alloc() -> Result<(&'static Proc, SpinLockGuard<'static, ProcShared>), KernelError> {
    let (p, mut shared) = PROC_TABLE
        .iter()
        .find_map(|p| {
            let shared = p.shared.lock();
            (shared.state == ProcState::Unused).then_some((p, shared))
        })
        .ok_or(KernelError::OutOfProcesses)?;

    shared.pid = alloc_pid();
    shared.state = ProcState::Used;
    let owned = unsafe { p.owned_mut() };

    let res: Result<(), KernelError> = (|| {
        let tf = page::alloc_frame()?;
        owned.trapframe = Some(tf.cast());
        owned.space = Some(UserSpace::new(PhysAddr::new(tf.addr().get()))?);

        // First scheduling lands in forkret on a fresh kernel stack.
        shared.context.clear();
        shared.context.ra = forkret as usize as u64;
        shared.context.sp = (owned.kstack.addr() + PAGE_SIZE) as u64;
        Ok(())
    })();

    if let Err(e) = res {
        free(p, &mut shared);
        drop(shared);
        return Err(e);
    }

    Ok((p, shared))
}

/// Returns a slot to `Unused`, releasing the trapframe and address
/// space. Open files and the cwd must already be gone.
fn free(p: &Proc, shared: &mut SpinLockGuard<'_, ProcShared>) {
    let owned = unsafe { p.owned_mut() };
    if let Some(tf) = owned.trapframe.take() {
        unsafe {
            page::free_frame(tf.cast());
        }
    }
    owned.space = None;
    unsafe {
        *p.parent.get() = None;
    }
    shared.pid = 0;
    shared.killed = false;
    shared.name.clear();
    shared.state = ProcState::Unused;
}

/// A user program that calls `exec("/init", argv)`, hand-assembled so
/// the kernel needs no ELF until the real init loads.
static INIT_CODE: [u8; 64] = [
    0x17, 0x05, 0x00, 0x00, // auipc a0, 0
    0x13, 0x05, 0x45, 0x02, // addi  a0, a0, 36   ; "/init"
    0x97, 0x05, 0x00, 0x00, // auipc a1, 0
    0x93, 0x85, 0x35, 0x02, // addi  a1, a1, 35   ; argv
    0x93, 0x08, 0x70, 0x00, // li    a7, 7        ; exec
    0x73, 0x00, 0x00, 0x00, // ecall
    0x93, 0x08, 0x20, 0x00, // li    a7, 2        ; exit
    0x73, 0x00, 0x00, 0x00, // ecall
    0xef, 0xf0, 0x9f, 0xff, // jal   backward     ; keep exiting
    0x2f, 0x69, 0x6e, 0x69, // "/ini"
    0x74, 0x00, 0x00, 0x24, // "t\0", argv[0] = 36
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, // argv[1] = 0
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
];

/// Creates the first user process, which execs `/init`.
pub fn spawn_init() {
    let (p, mut shared) = alloc().expect("first process");
    INIT_PROC.store(ptr::from_ref(p).cast_mut(), Ordering::Release);

    let owned = unsafe { p.owned_mut() };
    owned.space_mut().load_initcode(&INIT_CODE);

    // The very first return-to-user starts at address zero with the
    // stack at the top of the initcode page.
    let tf = owned.trapframe_mut();
    tf.epc = 0;
    tf.sp = PAGE_SIZE as u64;

    // The root inode handle needs no disk I/O, so it is safe to take
    // before the file system is mounted.
    owned.cwd = Some(inode::get(DeviceNo::ROOT, osmium_fs_types::InodeNo::ROOT));

    shared.name = ArrayString::from("initcode").unwrap();
    shared.state = ProcState::Runnable;
    drop(shared);
}

/// First landing of every new process, still holding the slot lock the
/// scheduler acquired.
extern "C" fn forkret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    let p = current();
    unsafe {
        p.shared.force_unlock();
    }

    if FIRST.swap(false, Ordering::AcqRel) {
        // Mounting reads the superblock and replays the log, which
        // sleeps on disk I/O; that is why it happens here, in process
        // context, rather than in main().
        fs::mount(DeviceNo::ROOT);
    }

    trap::trap_user_return()
}

/// Grows (or shrinks, for negative `delta`) the current process's
/// memory. Returns the old break.
pub fn grow_current(delta: isize) -> Result<usize, KernelError> {
    let owned = unsafe { current().owned_mut() };
    let space = owned.space_mut();
    let old = space.size();

    if delta > 0 {
        space.grow(old + delta as usize, PteFlags::W)?;
    } else if delta < 0 {
        space.shrink(old.saturating_sub(delta.unsigned_abs()));
    }
    Ok(old)
}

/// Forks the current process; returns the child pid in the parent.
pub fn fork() -> Result<Pid, KernelError> {
    let p = current();
    let owned = unsafe { p.owned_mut() };

    let (child, mut child_shared) = alloc()?;
    let child_owned = unsafe { child.owned_mut() };

    // Duplicate the whole user image.
    if let Err(e) = owned.space().clone_into(child_owned.space_mut()) {
        free(child, &mut child_shared);
        drop(child_shared);
        return Err(e);
    }

    // Same registers, except the child sees 0 from fork.
    *child_owned.trapframe_mut() = *owned.trapframe();
    child_owned.trapframe_mut().a0 = 0;

    for (ours, theirs) in owned.files.iter().zip(&mut child_owned.files) {
        *theirs = ours.clone();
    }
    child_owned.cwd = Some(inode::dup(owned.cwd()));

    let name = p.shared.lock().name;
    child_shared.name = name;
    let pid = child_shared.pid;
    drop(child_shared);

    let mut wait = WAIT_LOCK.lock();
    child.set_parent(Some(p), &mut wait);
    drop(wait);

    child.shared.lock().state = ProcState::Runnable;

    Ok(pid)
}

/// Hands `p`'s children to init. Caller holds the wait lock.
fn reparent(p: &Proc, wait: &mut SpinLockGuard<'_, ()>) {
    let init = INIT_PROC.load(Ordering::Acquire);
    for child in &PROC_TABLE {
        if child
            .parent_of(wait)
            .is_some_and(|pp| ptr::eq(pp, p))
        {
            child.set_parent(Some(unsafe { &*init }), wait);
            wakeup(init.addr());
        }
    }
}

/// Terminates the current process with `status`. Never returns; the
/// slot lingers as a zombie until the parent reaps it.
pub fn exit_current(status: i32) -> ! {
    let p = current();
    assert!(
        !ptr::eq(p, INIT_PROC.load(Ordering::Acquire)),
        "init exiting"
    );

    let owned = unsafe { p.owned_mut() };

    // Closing drops each File, which releases pipes and inodes.
    for f in &mut owned.files {
        drop(f.take());
    }

    let tx = fs::log::begin();
    inode::put(&tx, owned.cwd.take().unwrap());
    drop(tx);

    let mut wait = WAIT_LOCK.lock();
    reparent(p, &mut wait);

    // The parent may be blocked in wait().
    if let Some(parent) = p.parent_of(&wait) {
        wakeup(ptr::from_ref(parent).addr());
    }

    let mut shared = p.shared.lock();
    shared.state = ProcState::Zombie { status };
    drop(wait);

    scheduler::sched(&mut shared);
    unreachable!("zombie scheduled again");
}

/// Waits for any child to exit; reaps it and returns its pid, copying
/// the exit status to `status_addr` when non-null.
pub fn wait(status_addr: VirtAddr) -> Result<Pid, KernelError> {
    let p = current();
    let owned = unsafe { p.owned_mut() };
    let mut wait = WAIT_LOCK.lock();

    loop {
        let mut have_children = false;
        for child in &PROC_TABLE {
            if !child.parent_of(&wait).is_some_and(|pp| ptr::eq(pp, p)) {
                continue;
            }

            // The slot lock makes sure the child is done with exit().
            let mut child_shared = child.shared.lock();
            have_children = true;

            if let ProcState::Zombie { status } = child_shared.state {
                let pid = child_shared.pid;
                if status_addr.addr() != 0
                    && owned
                        .space_mut()
                        .copy_out(status_addr, &status.to_le_bytes())
                        .is_err()
                {
                    return Err(KernelError::AddressOutOfRange(status_addr));
                }
                free(child, &mut child_shared);
                return Ok(pid);
            }
            drop(child_shared);
        }

        if !have_children {
            return Err(KernelError::NoChildren);
        }
        if p.shared.lock().is_killed() {
            return Err(KernelError::Killed);
        }

        // Sleep on our own slot address; exiting children wake it.
        wait = sleep(ptr::from_ref(p).addr(), wait);
    }
}

/// Yields the hart at the end of a timer quantum.
pub fn yield_now() {
    let p = current();
    let mut shared = p.shared.lock();
    shared.state = ProcState::Runnable;
    scheduler::sched(&mut shared);
}

/// Atomically releases `guard` and parks the current process on `chan`;
/// reacquires the lock once woken. Wakeups may be spurious — callers
/// loop on their predicate.
pub fn sleep<'a, T>(chan: usize, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let p = current();

    // Holding our slot lock across the release closes the window: a
    // waker must take the slot lock to move us, so it cannot run until
    // we are fully parked.
    let mut shared = p.shared.lock();
    let source = guard.source();
    drop(guard);

    shared.state = ProcState::Sleeping { chan };
    scheduler::sched(&mut shared);

    drop(shared);
    source.lock()
}

/// Makes every process sleeping on `chan` runnable.
pub fn wakeup(chan: usize) {
    let me = try_current();
    for p in &PROC_TABLE {
        if me.is_some_and(|me| ptr::eq(me, p)) {
            continue;
        }
        let mut shared = p.shared.lock();
        if shared.state == (ProcState::Sleeping { chan }) {
            shared.state = ProcState::Runnable;
        }
    }
}

/// Flags `pid` as killed. A sleeping victim is roused so it can notice
/// on its way back to user mode.
pub fn kill(pid: Pid) -> Result<(), KernelError> {
    for p in &PROC_TABLE {
        let mut shared = p.shared.lock();
        if shared.pid == pid && shared.state != ProcState::Unused {
            shared.killed = true;
            if matches!(shared.state, ProcState::Sleeping { .. }) {
                shared.state = ProcState::Runnable;
            }
            return Ok(());
        }
    }
    Err(KernelError::NoSuchProcess)
}

/// Copies to a user address of the current process, or to a kernel
/// address, as `user_dst` says.
pub fn either_copy_out(user_dst: bool, dst: usize, src: &[u8]) -> Result<(), KernelError> {
    if user_dst {
        let owned = unsafe { current().owned_mut() };
        owned.space_mut().copy_out(VirtAddr::new(dst), src)
    } else {
        unsafe {
            slice::from_raw_parts_mut(ptr::with_exposed_provenance_mut::<u8>(dst), src.len())
                .copy_from_slice(src);
        }
        Ok(())
    }
}

/// Copies from a user address of the current process, or from a kernel
/// address, as `user_src` says.
pub fn either_copy_in(dst: &mut [u8], user_src: bool, src: usize) -> Result<(), KernelError> {
    if user_src {
        let owned = unsafe { current().owned_mut() };
        owned.space().copy_in(dst, VirtAddr::new(src))
    } else {
        unsafe {
            dst.copy_from_slice(slice::from_raw_parts(
                ptr::with_exposed_provenance::<u8>(src),
                dst.len(),
            ));
        }
        Ok(())
    }
}

/// Console ^P: one line per live process.
pub fn dump() {
    println!();
    for p in &PROC_TABLE {
        let shared = p.shared.lock();
        let (pid, state, name) = (shared.pid, shared.state, shared.name);
        drop(shared);

        let state = match state {
            ProcState::Unused => continue,
            ProcState::Used => "used",
            ProcState::Sleeping { .. } => "sleep",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Zombie { .. } => "zombie",
        };
        println!("{pid:5} {state:<8} {name}");
    }
}
