//! In-memory inodes.
//!
//! A fixed arena of [`osmium_params::NINODE`] slots caches on-disk
//! inodes. Slot keys and reference counts live behind one spin lock;
//! each slot's cached [`DiskInode`] sits behind its own sleep lock,
//! loaded from disk on first lock. At most one slot ever holds a given
//! (device, inode) pair, and a non-zero reference count pins the slot.
//!
//! The handle type [`Inode`] is a plain copyable value; references are
//! managed explicitly with [`get`]/[`dup`]/[`put`], and content access
//! goes through the RAII [`InodeGuard`] from [`lock`]. A typical
//! sequence:
//!
//! ```text
//! let ip = path::resolve(&tx, b"/some/file")?;
//! let mut guard = inode::lock(&tx, ip);
//! ... read or write through the guard ...
//! drop(guard);
//! inode::put(&tx, ip);
//! ```
//!
//! Dropping the guard before `put` matters: `put` of a last reference
//! takes the slot's sleep lock to decide whether the on-disk inode must
//! be freed. All `put`s run inside a transaction for the same reason.

use osmium_abi::{FileKind, Stat};
use osmium_fs_types::{
    BLOCK_SIZE, BlockNo, DIR_ENTRY_SIZE, DirEntry, DiskInode, IndirectBlock, InodeBlock, InodeNo,
    MAX_FILE_BLOCKS, NDIRECT, NINDIRECT,
};
use osmium_params::NINODE;

use dataview::PodMethods as _;

use crate::error::KernelError;
use crate::proc;
use crate::sync::{SleepLock, SleepLockGuard, SpinLock};

use super::log::Tx;
use super::{DeviceNo, block_free};

#[derive(Clone, Copy)]
struct Meta {
    dev: u32,
    ino: u32,
    refs: u32,
}

const FREE_META: Meta = Meta {
    dev: 0,
    ino: 0,
    refs: 0,
};

static META: SpinLock<[Meta; NINODE]> = SpinLock::new([FREE_META; NINODE]);

/// Cached on-disk inodes, one sleep lock each; `None` until first lock.
static BODIES: [SleepLock<Option<DiskInode>>; NINODE] =
    [const { SleepLock::new(None) }; NINODE];

/// A counted reference to an inode-table slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    idx: usize,
    pub dev: DeviceNo,
    pub ino: InodeNo,
}

/// Finds or claims the table slot for (`dev`, `ino`) and takes a
/// reference. Touches no disk.
pub fn get(dev: DeviceNo, ino: InodeNo) -> Inode {
    let mut meta = META.lock();

    let mut empty = None;
    for (i, m) in meta.iter_mut().enumerate() {
        if m.refs > 0 && m.dev == dev.value() && m.ino == ino.value() {
            m.refs += 1;
            return Inode { idx: i, dev, ino };
        }
        if empty.is_none() && m.refs == 0 {
            empty = Some(i);
        }
    }

    let idx = empty.expect("inode table overflow");
    meta[idx] = Meta {
        dev: dev.value(),
        ino: ino.value(),
        refs: 1,
    };
    // A previous tenant may have left its cached copy behind. No handle
    // to this slot can exist while we hold the table lock at refs 0, so
    // resetting without the sleep lock is sound.
    unsafe {
        *BODIES[idx].raw_get() = None;
    }
    Inode { idx, dev, ino }
}

/// Takes another reference to `ip`.
pub fn dup(ip: Inode) -> Inode {
    META.lock()[ip.idx].refs += 1;
    ip
}

/// Drops one reference. If it was the last and the inode has no links,
/// the inode and its content are freed on disk — hence the transaction;
/// under a read-only transaction the on-disk free is skipped (no caller
/// drops a zero-link inode without a write transaction).
pub fn put<const WRITE: bool>(tx: &Tx<WRITE>, ip: Inode) {
    let mut meta = META.lock();
    assert!(meta[ip.idx].refs > 0);

    if meta[ip.idx].refs == 1 {
        // Last reference: nobody else can hold or take the sleep lock,
        // so this acquire cannot block.
        let mut body = BODIES[ip.idx].lock();
        drop(meta);

        if let Some(inode) = body.as_mut() {
            if inode.nlink == 0 {
                if let Some(wtx) = tx.writable() {
                    truncate_body(wtx, ip, inode);
                    inode.kind = 0;
                    write_back(wtx, ip, inode);
                }
                *body = None;
            }
        }
        drop(body);
        meta = META.lock();
    }

    meta[ip.idx].refs -= 1;
}

/// Allocates a fresh on-disk inode of the given kind and returns a
/// referenced handle to it.
pub fn alloc(tx: &Tx<true>, dev: DeviceNo, kind: FileKind) -> Result<Inode, KernelError> {
    let sb = super::super_block();
    for ino in 1..sb.ninodes {
        let ino = InodeNo::new(ino);
        let handle = tx.block(dev, sb.inode_block(ino));
        let mut guard = handle.lock();
        let Ok(()) = guard.read();

        let slot = guard.as_view_mut::<InodeBlock>().get_mut(ino);
        if slot.is_free() {
            slot.allocate(kind);
            tx.record(&handle);
            drop(guard);
            return Ok(get(dev, ino));
        }
    }
    crate::println!("fs: out of inodes");
    Err(KernelError::OutOfInodes)
}

/// Locks `ip`'s content, reading it from disk on first use.
pub fn lock<'t, const WRITE: bool>(tx: &'t Tx<WRITE>, ip: Inode) -> InodeGuard<'t, WRITE> {
    let mut body = BODIES[ip.idx].lock();

    if body.is_none() {
        let sb = super::super_block();
        let handle = tx.block(ip.dev, sb.inode_block(ip.ino));
        let mut guard = handle.lock();
        let Ok(()) = guard.read();
        let inode = *guard.as_view::<InodeBlock>().get(ip.ino);
        assert!(!inode.is_free(), "lock of a free inode");
        *body = Some(inode);
    }

    InodeGuard { ip, body, tx }
}

/// Flushes the cached copy to the on-disk inode.
fn write_back<const WRITE: bool>(tx: &Tx<WRITE>, ip: Inode, inode: &DiskInode) {
    let wtx = tx.writable().expect("inode write-back without a write tx");
    let sb = super::super_block();
    let handle = wtx.block(ip.dev, sb.inode_block(ip.ino));
    let mut guard = handle.lock();
    let Ok(()) = guard.read();
    *guard.as_view_mut::<InodeBlock>().get_mut(ip.ino) = *inode;
    wtx.record(&handle);
}

/// Frees every content block, direct and indirect.
fn truncate_body(tx: &Tx<true>, ip: Inode, inode: &mut DiskInode) {
    for addr in &mut inode.addrs[..NDIRECT] {
        let bn = core::mem::take(addr);
        if bn != 0 {
            block_free(tx, ip.dev, BlockNo::new(bn));
        }
    }

    let indirect = core::mem::take(&mut inode.addrs[NDIRECT]);
    if indirect != 0 {
        let indirect = BlockNo::new(indirect);
        let handle = tx.block(ip.dev, indirect);
        let mut guard = handle.lock();
        let Ok(()) = guard.read();
        for bn in guard.as_view_mut::<IndirectBlock>().take_all() {
            block_free(tx, ip.dev, bn);
        }
        drop(guard);
        block_free(tx, ip.dev, indirect);
    }

    inode.size = 0;
    write_back(tx, ip, inode);
}

/// Exclusive, possibly-blocking access to an inode's content.
pub struct InodeGuard<'t, const WRITE: bool> {
    ip: Inode,
    body: SleepLockGuard<'static, Option<DiskInode>>,
    tx: &'t Tx<WRITE>,
}

impl<'t, const WRITE: bool> InodeGuard<'t, WRITE> {
    pub fn inode(&self) -> Inode {
        self.ip
    }

    fn body(&self) -> &DiskInode {
        self.body.as_ref().unwrap()
    }

    fn body_mut(&mut self) -> &mut DiskInode {
        self.body.as_mut().unwrap()
    }

    pub fn kind(&self) -> FileKind {
        self.body().kind().expect("inode with invalid kind")
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Dir
    }

    pub fn size(&self) -> u32 {
        self.body().size
    }

    pub fn nlink(&self) -> i16 {
        self.body().nlink
    }

    pub fn major(&self) -> i16 {
        self.body().major
    }

    pub fn stat(&self) -> Stat {
        let body = self.body();
        Stat {
            dev: self.ip.dev.value(),
            ino: self.ip.ino.value(),
            kind: body.kind,
            nlink: body.nlink,
            _pad: [0; 4],
            size: u64::from(body.size),
        }
    }

    /// The disk block backing file block `fbn`, allocating (under a
    /// write transaction) when absent.
    fn block_of(&mut self, fbn: usize) -> Result<BlockNo, KernelError> {
        let dev = self.ip.dev;

        if fbn < NDIRECT {
            if self.body().addrs[fbn] == 0 {
                let wtx = self.tx.writable().ok_or(KernelError::OutOfBlocks)?;
                let bn = super::block_alloc(wtx, dev)?;
                self.body_mut().addrs[fbn] = bn.value();
            }
            return Ok(BlockNo::new(self.body().addrs[fbn]));
        }

        let fbn = fbn - NDIRECT;
        assert!(fbn < NINDIRECT, "file block index out of range");

        if self.body().addrs[NDIRECT] == 0 {
            let wtx = self.tx.writable().ok_or(KernelError::OutOfBlocks)?;
            let bn = super::block_alloc(wtx, dev)?;
            self.body_mut().addrs[NDIRECT] = bn.value();
        }
        let indirect = BlockNo::new(self.body().addrs[NDIRECT]);

        let handle = self.tx.block(dev, indirect);
        let mut guard = handle.lock();
        let Ok(()) = guard.read();
        if let Some(bn) = guard.as_view::<IndirectBlock>().get(fbn) {
            return Ok(bn);
        }

        let wtx = self.tx.writable().ok_or(KernelError::OutOfBlocks)?;
        let bn = super::block_alloc(wtx, dev)?;
        guard.as_view_mut::<IndirectBlock>().set(fbn, bn);
        wtx.record(&handle);
        Ok(bn)
    }

    /// Reads up to `n` bytes at `off` into a user or kernel address.
    /// Short reads happen only at end of file.
    pub fn read(
        &mut self,
        user_dst: bool,
        dst: usize,
        off: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let size = self.size() as usize;
        if off > size || off.checked_add(n).is_none() {
            return Ok(0);
        }
        let n = n.min(size - off);

        let mut done = 0;
        while done < n {
            let off = off + done;
            let bn = self.block_of(off / BLOCK_SIZE)?;
            let handle = self.tx.block(self.ip.dev, bn);
            let mut guard = handle.lock();
            let Ok(()) = guard.read();

            let frag = (n - done).min(BLOCK_SIZE - off % BLOCK_SIZE);
            proc::either_copy_out(
                user_dst,
                dst + done,
                &guard.bytes()[off % BLOCK_SIZE..][..frag],
            )?;
            done += frag;
        }
        Ok(done)
    }

    /// Kernel-buffer convenience wrapper around [`InodeGuard::read`].
    pub fn read_bytes(&mut self, off: usize, dst: &mut [u8]) -> Result<usize, KernelError> {
        self.read(false, dst.as_mut_ptr().addr(), off, dst.len())
    }

    /// Looks `name` up in this directory; returns the referenced inode
    /// and the entry's byte offset.
    pub fn dir_lookup(&mut self, name: &[u8]) -> Option<(Inode, usize)> {
        assert!(self.is_dir(), "dir_lookup on a non-directory");

        for off in (0..self.size() as usize).step_by(DIR_ENTRY_SIZE) {
            let mut entry = DirEntry::zeroed();
            let n = self.read_bytes(off, entry.as_bytes_mut()).unwrap();
            assert_eq!(n, DIR_ENTRY_SIZE, "truncated directory");

            let Some(ino) = entry.ino() else { continue };
            if entry.name_matches(name) {
                return Some((get(self.ip.dev, ino), off));
            }
        }
        None
    }
}

impl<const WRITE: bool> InodeGuard<'_, WRITE> {
    /// Persists header changes (size, links, addresses) made through
    /// the guard.
    pub fn update(&mut self) {
        let body = *self.body();
        write_back(self.tx, self.ip, &body);
    }
}

impl InodeGuard<'_, true> {
    /// Discards the file's content.
    pub fn truncate(&mut self) {
        let mut body = *self.body();
        truncate_body(self.tx, self.ip, &mut body);
        *self.body_mut() = body;
    }

    pub fn set_device(&mut self, major: i16, minor: i16) {
        self.body_mut().major = major;
        self.body_mut().minor = minor;
    }

    pub fn inc_nlink(&mut self) {
        self.body_mut().nlink += 1;
    }

    pub fn dec_nlink(&mut self) {
        assert!(self.body().nlink > 0);
        self.body_mut().nlink -= 1;
    }

    /// Writes `n` bytes at `off` from a user or kernel address, growing
    /// the file as needed. A short count means a copy fault or a full
    /// disk partway through.
    pub fn write(
        &mut self,
        user_src: bool,
        src: usize,
        off: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let size = self.size() as usize;
        if off > size || off.checked_add(n).is_none() {
            return Err(KernelError::AddressOutOfRange(crate::memory::VirtAddr::new(
                src,
            )));
        }
        if off + n > MAX_FILE_BLOCKS * BLOCK_SIZE {
            return Err(KernelError::FileTooLarge);
        }

        let mut done = 0;
        while done < n {
            let off = off + done;
            let bn = self.block_of(off / BLOCK_SIZE)?;
            let handle = self.tx.block(self.ip.dev, bn);
            let mut guard = handle.lock();
            let Ok(()) = guard.read();

            let frag = (n - done).min(BLOCK_SIZE - off % BLOCK_SIZE);
            proc::either_copy_in(
                &mut guard.bytes_mut()[off % BLOCK_SIZE..][..frag],
                user_src,
                src + done,
            )?;
            self.tx.record(&handle);
            done += frag;
        }

        if off + done > size {
            self.body_mut().size = (off + done) as u32;
        }
        // The loop may have grown the address lists even if the size
        // did not move.
        self.update();
        Ok(done)
    }

    /// Kernel-buffer convenience wrapper around [`InodeGuard::write`].
    pub fn write_bytes(&mut self, off: usize, src: &[u8]) -> Result<usize, KernelError> {
        self.write(false, src.as_ptr().addr(), off, src.len())
    }

    /// Adds (`name`, `ino`) to this directory; refuses duplicates.
    pub fn dir_link(&mut self, name: &[u8], ino: InodeNo) -> Result<(), KernelError> {
        assert!(self.is_dir(), "dir_link on a non-directory");

        if let Some((existing, _off)) = self.dir_lookup(name) {
            put(self.tx, existing);
            return Err(KernelError::AlreadyExists);
        }

        // First free slot, or the end of the directory.
        let size = self.size() as usize;
        assert_eq!(size % DIR_ENTRY_SIZE, 0, "misaligned directory size");
        let mut target = size;
        for off in (0..size).step_by(DIR_ENTRY_SIZE) {
            let mut entry = DirEntry::zeroed();
            self.read_bytes(off, entry.as_bytes_mut())?;
            if entry.ino().is_none() {
                target = off;
                break;
            }
        }

        let mut entry = DirEntry::zeroed();
        entry.set_ino(ino);
        entry.set_name(name);
        let n = self.write_bytes(target, entry.as_bytes())?;
        assert_eq!(n, DIR_ENTRY_SIZE);
        Ok(())
    }

    /// Clears the directory entry at `off` (for unlink).
    pub fn dir_clear_entry(&mut self, off: usize) {
        let entry = DirEntry::zeroed();
        let n = self.write_bytes(off, entry.as_bytes()).unwrap();
        assert_eq!(n, DIR_ENTRY_SIZE);
    }

    /// Whether this directory holds nothing besides "." and "..".
    pub fn dir_is_empty(&mut self) -> bool {
        assert!(self.is_dir());
        for off in (2 * DIR_ENTRY_SIZE..self.size() as usize).step_by(DIR_ENTRY_SIZE) {
            let mut entry = DirEntry::zeroed();
            self.read_bytes(off, entry.as_bytes_mut()).unwrap();
            if entry.ino().is_some() {
                return false;
            }
        }
        true
    }
}
