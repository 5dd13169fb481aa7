//! The disk block cache, instantiated over the virtio driver.
//!
//! Table bookkeeping sits behind a spin lock; each block's payload
//! behind a sleep lock, since filling or flushing it waits on the disk.

use core::convert::Infallible;

use block_cache::{BlockCache, BlockDevice};
use once_slot::OnceSlot;
use osmium_fs_types::{BLOCK_SIZE, BlockNo};
use osmium_params::NBUF;

use crate::sync::{SleepLock, SpinLock};

use super::{DeviceNo, virtio_disk};

/// The one disk, as the cache sees it.
pub struct VirtioDisk;

impl BlockDevice<BLOCK_SIZE> for VirtioDisk {
    type Error = Infallible;

    fn read(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Infallible> {
        virtio_disk::read(index, buf);
        Ok(())
    }

    fn write(&self, index: usize, buf: &[u8; BLOCK_SIZE]) -> Result<(), Infallible> {
        virtio_disk::write(index, buf);
        Ok(())
    }
}

pub type DiskCache =
    BlockCache<VirtioDisk, SpinLock<block_cache::Table>, SleepLock<[u8; BLOCK_SIZE]>, BLOCK_SIZE>;

pub type DiskHandle = block_cache::BlockHandle<
    'static,
    VirtioDisk,
    SpinLock<block_cache::Table>,
    SleepLock<[u8; BLOCK_SIZE]>,
    BLOCK_SIZE,
>;

pub type DiskGuard<'h> = block_cache::BlockGuard<
    'static,
    'h,
    VirtioDisk,
    SpinLock<block_cache::Table>,
    SleepLock<[u8; BLOCK_SIZE]>,
    BLOCK_SIZE,
>;

static CACHE: OnceSlot<DiskCache> = OnceSlot::new();

pub fn init() {
    CACHE.set(DiskCache::new(VirtioDisk, NBUF));
}

pub(super) fn cache() -> &'static DiskCache {
    CACHE.get()
}

/// A referenced cache slot for `bn`. Pure cache traffic; the disk is
/// only touched once the caller locks and reads or writes.
pub fn get(dev: DeviceNo, bn: BlockNo) -> DiskHandle {
    assert_eq!(dev, DeviceNo::ROOT, "unknown device {}", dev.value());
    cache().get(bn.index())
}
