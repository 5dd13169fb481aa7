//! On-disk file system format.
//!
//! Disk layout, fixed when the image is formatted:
//!
//! | blocks                        | content                                  |
//! |-------------------------------|------------------------------------------|
//! | 0                             | boot block (unused by the kernel)        |
//! | 1                             | [`SuperBlock`]                           |
//! | `sb.log_start ..`             | log header + `sb.nlog` log body blocks   |
//! | `sb.inode_start ..`           | inode table, [`INODES_PER_BLOCK`] each   |
//! | `sb.bitmap_start ..`          | free bitmap, [`BITS_PER_BLOCK`] each     |
//! | remainder                     | data blocks                              |
//!
//! Everything here is `Pod` so the kernel and `mkfs` view raw block bytes
//! through the same structs. All fields are little-endian; RISC-V and the
//! hosts we build images on agree, which `mkfs` asserts in its tests.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use dataview::{Pod, PodMethods as _};
use osmium_abi::FileKind;

/// Size of a disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 12;

/// Block pointers in the singly-indirect block.
pub const NINDIRECT: usize = BLOCK_SIZE / size_of::<u32>();

/// Largest file, in blocks.
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT;

/// On-disk inodes per inode block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<DiskInode>();

/// Free-bitmap bits per bitmap block.
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

/// Bytes in a directory entry name.
pub const NAME_LEN: usize = 14;

/// A block number on a device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Pod)]
#[repr(transparent)]
pub struct BlockNo(u32);

impl fmt::Debug for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockNo({})", self.0)
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl BlockNo {
    pub const SUPER: Self = Self(1);

    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// An inode number on a device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Pod)]
#[repr(transparent)]
pub struct InodeNo(u32);

impl fmt::Debug for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeNo({})", self.0)
    }
}

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl InodeNo {
    /// The root directory.
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Block 1 of every file system.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct SuperBlock {
    /// Must be [`SuperBlock::MAGIC`].
    pub magic: u32,
    /// Total image size in blocks.
    pub size: u32,
    /// Number of data blocks.
    pub ndata: u32,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log body blocks (the header is extra).
    pub nlog: u32,
    /// First log block (the header).
    pub log_start: u32,
    /// First inode-table block.
    pub inode_start: u32,
    /// First free-bitmap block.
    pub bitmap_start: u32,
}

impl SuperBlock {
    /// `"osm1"`, little-endian.
    pub const MAGIC: u32 = 0x316d_736f;

    /// Block holding the on-disk copy of `ino`.
    #[must_use]
    pub fn inode_block(&self, ino: InodeNo) -> BlockNo {
        BlockNo::new(self.inode_start + (ino.index() / INODES_PER_BLOCK) as u32)
    }

    /// Bitmap block holding the free bit for data block `bn`.
    #[must_use]
    pub fn bitmap_block(&self, bn: usize) -> BlockNo {
        BlockNo::new(self.bitmap_start + (bn / BITS_PER_BLOCK) as u32)
    }

    /// The log header block.
    #[must_use]
    pub fn log_header(&self) -> BlockNo {
        BlockNo::new(self.log_start)
    }

    /// The `i`-th log body block.
    #[must_use]
    pub fn log_body(&self, i: usize) -> BlockNo {
        debug_assert!(i < self.nlog as usize);
        BlockNo::new(self.log_start + 1 + i as u32)
    }
}

/// Entries the log header block can hold.
pub const LOG_HEADER_SLOTS: usize = BLOCK_SIZE / size_of::<u32>() - 1;

/// The log header block: a count and the home addresses of the logged
/// blocks. A non-zero count read back after a crash is a committed
/// transaction awaiting installation.
#[derive(Pod)]
#[repr(C)]
pub struct LogHeader {
    count: u32,
    home: [u32; LOG_HEADER_SLOTS],
}

const _: () = assert!(size_of::<LogHeader>() == BLOCK_SIZE);

impl LogHeader {
    #[must_use]
    pub fn count(&self) -> usize {
        self.count as usize
    }

    pub fn set_count(&mut self, n: usize) {
        self.count = u32::try_from(n).unwrap();
    }

    #[must_use]
    pub fn home(&self, i: usize) -> BlockNo {
        debug_assert!(i < self.count());
        BlockNo::new(self.home[i])
    }

    pub fn set_home(&mut self, i: usize, bn: BlockNo) {
        self.home[i] = bn.value();
    }
}

/// An on-disk inode. Type 0 marks a free slot.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct DiskInode {
    /// [`FileKind`] discriminant, or 0 when free.
    pub kind: i16,
    /// Major device number (devices only).
    pub major: i16,
    /// Minor device number (devices only).
    pub minor: i16,
    /// Hard links to this inode.
    pub nlink: i16,
    /// File size in bytes.
    pub size: u32,
    /// `NDIRECT` direct pointers, then one singly-indirect pointer.
    /// Zero means unallocated.
    pub addrs: [u32; NDIRECT + 1],
}

impl DiskInode {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind == 0
    }

    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_repr(self.kind)
    }

    /// Claims a free slot for a new inode of the given kind.
    pub fn allocate(&mut self, kind: FileKind) {
        debug_assert!(self.is_free());
        *self = Self::zeroed();
        self.kind = kind as i16;
    }
}

/// A whole inode-table block.
#[derive(Pod)]
#[repr(transparent)]
pub struct InodeBlock([DiskInode; INODES_PER_BLOCK]);

const _: () = assert!(size_of::<InodeBlock>() == BLOCK_SIZE);

impl InodeBlock {
    #[must_use]
    pub fn get(&self, ino: InodeNo) -> &DiskInode {
        &self.0[ino.index() % INODES_PER_BLOCK]
    }

    pub fn get_mut(&mut self, ino: InodeNo) -> &mut DiskInode {
        &mut self.0[ino.index() % INODES_PER_BLOCK]
    }
}

/// A whole free-bitmap block. Bit set = block in use.
#[derive(Pod)]
#[repr(transparent)]
pub struct BitmapBlock([u8; BLOCK_SIZE]);

const _: () = assert!(size_of::<BitmapBlock>() == BLOCK_SIZE);

impl BitmapBlock {
    #[must_use]
    pub fn is_set(&self, bit: usize) -> bool {
        debug_assert!(bit < BITS_PER_BLOCK);
        self.0[bit / 8] & (1 << (bit % 8)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < BITS_PER_BLOCK);
        self.0[bit / 8] |= 1 << (bit % 8);
    }

    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < BITS_PER_BLOCK);
        self.0[bit / 8] &= !(1 << (bit % 8));
    }

    /// First clear bit below `limit`, if any.
    #[must_use]
    pub fn first_clear(&self, limit: usize) -> Option<usize> {
        (0..limit.min(BITS_PER_BLOCK)).find(|&bit| !self.is_set(bit))
    }
}

/// The singly-indirect block: [`NINDIRECT`] block pointers.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; NINDIRECT]);

const _: () = assert!(size_of::<IndirectBlock>() == BLOCK_SIZE);

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<BlockNo> {
        (self.0[i] != 0).then(|| BlockNo::new(self.0[i]))
    }

    pub fn set(&mut self, i: usize, bn: BlockNo) {
        debug_assert_eq!(self.0[i], 0);
        self.0[i] = bn.value();
    }

    /// Takes every pointer out, leaving the block empty.
    pub fn take_all(&mut self) -> impl Iterator<Item = BlockNo> + '_ {
        self.0.iter_mut().filter_map(|slot| {
            let bn = core::mem::take(slot);
            (bn != 0).then(|| BlockNo::new(bn))
        })
    }
}

/// A directory entry: an inode number and a [`NAME_LEN`]-byte name,
/// zero-padded but not necessarily NUL-terminated. Inode 0 marks a free
/// slot.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct DirEntry {
    ino: u16,
    name: [u8; NAME_LEN],
}

pub const DIR_ENTRY_SIZE: usize = size_of::<DirEntry>();

const _: () = assert!(BLOCK_SIZE % DIR_ENTRY_SIZE == 0);

impl DirEntry {
    #[must_use]
    pub fn ino(&self) -> Option<InodeNo> {
        (self.ino != 0).then(|| InodeNo::new(self.ino.into()))
    }

    pub fn set_ino(&mut self, ino: InodeNo) {
        debug_assert_ne!(ino.value(), 0);
        self.ino = u16::try_from(ino.value()).unwrap();
    }

    /// The stored name, without padding.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        &self.name[..len]
    }

    /// Compares against `name`, honoring the [`NAME_LEN`] truncation rule.
    #[must_use]
    pub fn name_matches(&self, name: &[u8]) -> bool {
        self.name() == &name[..name.len().min(NAME_LEN)]
    }

    /// Stores `name`, truncated to [`NAME_LEN`] bytes and zero-padded.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(NAME_LEN);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> SuperBlock {
        // Geometry of a 2000-block image with 30 log bodies and 200 inodes.
        SuperBlock {
            magic: SuperBlock::MAGIC,
            size: 2000,
            ndata: 2000 - (2 + 31 + 13 + 1),
            ninodes: 200,
            nlog: 30,
            log_start: 2,
            inode_start: 33,
            bitmap_start: 46,
        }
    }

    #[test]
    fn superblock_locates_inodes() {
        let sb = sample_superblock();
        assert_eq!(sb.inode_block(InodeNo::ROOT).value(), 33);
        assert_eq!(sb.inode_block(InodeNo::new(15)).value(), 33);
        assert_eq!(sb.inode_block(InodeNo::new(16)).value(), 34);
    }

    #[test]
    fn superblock_locates_log_blocks() {
        let sb = sample_superblock();
        assert_eq!(sb.log_header().value(), 2);
        assert_eq!(sb.log_body(0).value(), 3);
        assert_eq!(sb.log_body(29).value(), 32);
    }

    #[test]
    fn superblock_locates_bitmap() {
        let sb = sample_superblock();
        assert_eq!(sb.bitmap_block(0).value(), 46);
        assert_eq!(sb.bitmap_block(BITS_PER_BLOCK - 1).value(), 46);
        assert_eq!(sb.bitmap_block(BITS_PER_BLOCK).value(), 47);
    }

    #[test]
    fn bitmap_bit_ops() {
        let mut bm = BitmapBlock::zeroed();
        assert_eq!(bm.first_clear(BITS_PER_BLOCK), Some(0));
        bm.set(0);
        bm.set(9);
        assert!(bm.is_set(0));
        assert!(!bm.is_set(1));
        assert!(bm.is_set(9));
        assert_eq!(bm.first_clear(BITS_PER_BLOCK), Some(1));
        bm.clear(0);
        assert_eq!(bm.first_clear(BITS_PER_BLOCK), Some(0));
    }

    #[test]
    fn bitmap_first_clear_respects_limit() {
        let mut bm = BitmapBlock::zeroed();
        for bit in 0..10 {
            bm.set(bit);
        }
        assert_eq!(bm.first_clear(10), None);
        assert_eq!(bm.first_clear(11), Some(10));
    }

    #[test]
    fn dirent_names_without_nul() {
        // Exactly NAME_LEN bytes: stored without a terminator.
        let mut de = DirEntry::zeroed();
        de.set_name(b"fourteen-bytes");
        assert_eq!(de.name(), b"fourteen-bytes");
        assert!(de.name_matches(b"fourteen-bytes"));
        // Lookups compare only the first NAME_LEN bytes, like the store.
        assert!(de.name_matches(b"fourteen-bytesX"));
        assert!(!de.name_matches(b"fourteen-byteZ"));
    }

    #[test]
    fn dirent_short_names() {
        let mut de = DirEntry::zeroed();
        de.set_name(b"a");
        assert_eq!(de.name(), b"a");
        assert!(de.name_matches(b"a"));
        assert!(!de.name_matches(b"ab"));
    }

    #[test]
    fn dirent_free_slot() {
        let mut de = DirEntry::zeroed();
        assert!(de.ino().is_none());
        de.set_ino(InodeNo::new(3));
        assert_eq!(de.ino(), Some(InodeNo::new(3)));
    }

    #[test]
    fn indirect_block_take_all() {
        let mut ind = IndirectBlock::zeroed();
        ind.set(0, BlockNo::new(100));
        ind.set(7, BlockNo::new(200));
        let taken: Vec<_> = ind.take_all().collect();
        assert_eq!(taken, vec![BlockNo::new(100), BlockNo::new(200)]);
        assert!(ind.get(0).is_none());
        assert!(ind.get(7).is_none());
    }

    #[test]
    fn log_header_round_trip() {
        let mut lh = LogHeader::zeroed();
        assert_eq!(lh.count(), 0);
        lh.set_home(0, BlockNo::new(77));
        lh.set_count(1);
        assert_eq!(lh.count(), 1);
        assert_eq!(lh.home(0), BlockNo::new(77));
    }

    #[test]
    fn sixteen_inodes_per_block() {
        assert_eq!(size_of::<DiskInode>(), 64);
        assert_eq!(INODES_PER_BLOCK, 16);
    }
}
