//! The file system.
//!
//! Five layers, bottom up: the virtio disk driver, the block cache, the
//! write-ahead log (transactions), inodes (files, directories, the
//! allocation bitmap), and path names. The higher-level file objects
//! and the system calls sit on top, under `crate::file` and
//! `crate::syscall`.

use once_slot::OnceSlot;
use osmium_fs_types::{BITS_PER_BLOCK, BlockNo, SuperBlock};
use osmium_params::ROOT_DEV;

use crate::error::KernelError;
use crate::println;

pub mod block_io;
pub mod inode;
pub mod log;
pub mod ops;
pub mod path;
pub mod virtio;
pub mod virtio_disk;

/// A disk device number. Exactly one device — the root disk — exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNo(u32);

impl DeviceNo {
    pub const ROOT: Self = Self(ROOT_DEV);

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

static SUPER_BLOCK: OnceSlot<SuperBlock> = OnceSlot::new();

pub(crate) fn super_block() -> &'static SuperBlock {
    SUPER_BLOCK.get()
}

/// Mounts the root file system: reads the superblock and replays the
/// log. Runs in process context (the first process's first return path)
/// because the disk reads sleep.
pub fn mount(dev: DeviceNo) {
    assert_eq!(dev, DeviceNo::ROOT);

    let sb = {
        let handle = block_io::get(dev, BlockNo::SUPER);
        let mut guard = handle.lock();
        let Ok(()) = guard.read();
        *guard.as_view::<SuperBlock>()
    };
    assert_eq!(sb.magic, SuperBlock::MAGIC, "bad file system magic");
    SUPER_BLOCK.set(sb);

    log::init(dev, SUPER_BLOCK.get());
    println!("fs: mounted dev {} ({} blocks)", dev.value(), sb.size);
}

/// Allocates a zeroed data block: first clear bitmap bit, set and zeroed
/// under the transaction.
pub(crate) fn block_alloc(tx: &log::Tx<true>, dev: DeviceNo) -> Result<BlockNo, KernelError> {
    let sb = super_block();
    for base in (0..sb.size as usize).step_by(BITS_PER_BLOCK) {
        let handle = tx.block(dev, sb.bitmap_block(base));
        let mut guard = handle.lock();
        let Ok(()) = guard.read();

        let limit = BITS_PER_BLOCK.min(sb.size as usize - base);
        let Some(bit) = guard.as_view::<osmium_fs_types::BitmapBlock>().first_clear(limit) else {
            continue;
        };

        guard
            .as_view_mut::<osmium_fs_types::BitmapBlock>()
            .set(bit);
        tx.record(&handle);
        drop(guard);

        let bn = BlockNo::new((base + bit) as u32);
        let data = tx.block(dev, bn);
        let mut data_guard = data.lock();
        data_guard.zero();
        tx.record(&data);
        return Ok(bn);
    }
    println!("fs: out of blocks");
    Err(KernelError::OutOfBlocks)
}

/// Returns a data block to the bitmap. Freeing a free block is fatal.
pub(crate) fn block_free(tx: &log::Tx<true>, dev: DeviceNo, bn: BlockNo) {
    let sb = super_block();
    let handle = tx.block(dev, sb.bitmap_block(bn.index()));
    let mut guard = handle.lock();
    let Ok(()) = guard.read();

    let bit = bn.index() % BITS_PER_BLOCK;
    let bitmap = guard.as_view_mut::<osmium_fs_types::BitmapBlock>();
    assert!(bitmap.is_set(bit), "freeing a free block");
    bitmap.clear(bit);
    tx.record(&handle);
}
