//! Transactions over the write-ahead log.
//!
//! The log machinery itself lives in the `redo_log` crate; this module
//! instantiates it over the disk cache and wraps each file-system
//! operation in a [`Tx`] so the begin/end bracketing is enforced by
//! scope. A `Tx<true>` reserves log space and commits on drop; a
//! `Tx<false>` is a read-only view that skips the reservation and
//! cannot stage writes.

use once_slot::OnceSlot;
use osmium_fs_types::{BlockNo, SuperBlock};
use osmium_params::MAX_OP_BLOCKS;
use redo_log::{LogState, RedoLog};

use crate::sync::{SleepLock, SpinLock, SpinLockCondVar};

use super::block_io::{self, DiskHandle, VirtioDisk};
use super::DeviceNo;

pub type DiskLog = RedoLog<
    'static,
    VirtioDisk,
    SpinLock<block_cache::Table>,
    SleepLock<[u8; osmium_fs_types::BLOCK_SIZE]>,
    SpinLock<LogState>,
    SpinLockCondVar,
>;

static LOG: OnceSlot<DiskLog> = OnceSlot::new();

/// Builds the log from the superblock geometry and replays whatever a
/// crash left behind.
pub(super) fn init(dev: DeviceNo, sb: &SuperBlock) {
    assert_eq!(dev, DeviceNo::ROOT);
    LOG.set(DiskLog::new(
        block_io::cache(),
        sb.log_header(),
        sb.nlog as usize,
        MAX_OP_BLOCKS,
        SpinLockCondVar::new(),
    ));
    LOG.get().recover();
}

/// A file-system operation. `WRITE` operations hold a log reservation
/// from construction to drop; every mutated block goes through
/// [`Tx::record`] instead of a bare write.
pub struct Tx<const WRITE: bool> {
    _not_send: core::marker::PhantomData<*mut ()>,
}

/// Opens a mutating operation, blocking until the log can take it.
pub fn begin() -> Tx<true> {
    LOG.get().begin();
    Tx {
        _not_send: core::marker::PhantomData,
    }
}

/// Opens a read-only operation: no reservation, no staging rights.
pub fn begin_read() -> Tx<false> {
    Tx {
        _not_send: core::marker::PhantomData,
    }
}

impl<const WRITE: bool> Drop for Tx<WRITE> {
    fn drop(&mut self) {
        if WRITE {
            LOG.get().end();
        }
    }
}

impl<const WRITE: bool> Tx<WRITE> {
    /// A cache handle for `bn`, usable for reads under any transaction.
    pub fn block(&self, dev: DeviceNo, bn: BlockNo) -> DiskHandle {
        block_io::get(dev, bn)
    }

    /// This transaction, if it can write.
    pub fn writable(&self) -> Option<&Tx<true>> {
        WRITE.then(|| unsafe { &*core::ptr::from_ref(self).cast::<Tx<true>>() })
    }
}

impl Tx<true> {
    /// Stages `handle`'s block for the commit; the in-place replacement
    /// for writing it home.
    pub fn record(&self, handle: &DiskHandle) {
        LOG.get().record(handle);
    }
}
