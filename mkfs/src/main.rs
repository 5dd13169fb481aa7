//! Builds a formatted disk image.
//!
//! `mkfs fs.img [file...]` writes an empty file system of
//! [`osmium_params::FS_SIZE`] blocks and copies each named host file into
//! the root directory. The kernel and this tool share every layout
//! constant through `osmium_fs_types`, so an image and the kernel that
//! mounts it cannot disagree.

// Keeps `cargo build --workspace` for the kernel target happy: on a
// bare-metal target this tool compiles to an empty no_std crate.
#![cfg_attr(target_os = "none", no_std)]
#![cfg(not(target_os = "none"))]

use std::fs::File;
use std::io::{self, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::Path;
use std::{env, process};

use dataview::{Pod, PodMethods as _};
use osmium_abi::FileKind;
use osmium_fs_types::{
    BITS_PER_BLOCK, BLOCK_SIZE, BitmapBlock, BlockNo, DirEntry, DiskInode, INODES_PER_BLOCK,
    InodeBlock, InodeNo, MAX_FILE_BLOCKS, NAME_LEN, NDIRECT, NINDIRECT, SuperBlock,
};
use osmium_params::{FS_NINODES, FS_SIZE, LOG_SIZE};

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some((image, contents)) = args[1..].split_first() else {
        eprintln!("usage: {} fs.img [file...]", args[0]);
        process::exit(1);
    };

    let mut fs = ImageBuilder::create(Path::new(image))?;

    let root = fs.add_directory()?;
    assert_eq!(root, InodeNo::ROOT);

    for name in contents {
        let mut data = Vec::new();
        File::open(name)?.read_to_end(&mut data)?;
        let ino = fs.add_file(&data)?;

        // Strip any host directory prefix; the image has one flat root.
        let base = Path::new(name).file_name().unwrap().to_str().unwrap();
        fs.add_dir_entry(root, ino, base.as_bytes())?;
    }

    fs.finish()
}

/// Image geometry: boot block, superblock, log (header + bodies), inode
/// table, bitmap, data.
fn layout() -> SuperBlock {
    let nlog = LOG_SIZE as u32;
    let ninode_blocks = (FS_NINODES / INODES_PER_BLOCK + 1) as u32;
    let nbitmap = (FS_SIZE / BITS_PER_BLOCK + 1) as u32;
    let nmeta = 2 + (nlog + 1) + ninode_blocks + nbitmap;

    SuperBlock {
        magic: SuperBlock::MAGIC,
        size: FS_SIZE as u32,
        ndata: FS_SIZE as u32 - nmeta,
        ninodes: FS_NINODES as u32,
        nlog,
        log_start: 2,
        inode_start: 2 + nlog + 1,
        bitmap_start: 2 + nlog + 1 + ninode_blocks,
    }
}

/// First block past the metadata, where file data starts.
fn first_data_block(sb: &SuperBlock) -> u32 {
    sb.bitmap_start + (FS_SIZE / BITS_PER_BLOCK + 1) as u32
}

struct ImageBuilder {
    img: File,
    sb: SuperBlock,
    next_inode: u32,
    next_block: u32,
}

impl ImageBuilder {
    fn create(path: &Path) -> io::Result<Self> {
        // The kernel reads these structs straight off the disk; fields
        // are little-endian, so the build host must be too.
        assert_eq!(1u32.to_le(), 1, "mkfs must run on a little-endian host");

        let sb = layout();
        let first_data = first_data_block(&sb);
        eprintln!(
            "mkfs: {} meta blocks ({} log, {} inode, {} bitmap), {} data, {} total",
            first_data,
            sb.nlog + 1,
            sb.bitmap_start - sb.inode_start,
            first_data - sb.bitmap_start,
            sb.ndata,
            sb.size,
        );

        let img = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut fs = Self {
            img,
            sb,
            next_inode: 1,
            next_block: first_data,
        };

        let zero = [0u8; BLOCK_SIZE];
        for bn in 0..FS_SIZE {
            fs.write_block(BlockNo::new(bn as u32), &zero)?;
        }

        let mut block = [0u8; BLOCK_SIZE];
        block[..size_of::<SuperBlock>()].copy_from_slice(fs.sb.as_bytes());
        fs.write_block(BlockNo::SUPER, &block)?;

        Ok(fs)
    }

    fn write_block<T>(&mut self, bn: BlockNo, data: &T) -> io::Result<()>
    where
        T: Pod + ?Sized,
    {
        let bytes = data.as_bytes();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        self.img
            .seek(SeekFrom::Start(bn.index() as u64 * BLOCK_SIZE as u64))?;
        self.img.write_all(bytes)
    }

    fn read_block<T>(&mut self, bn: BlockNo, data: &mut T) -> io::Result<()>
    where
        T: Pod + ?Sized,
    {
        let bytes = data.as_bytes_mut();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        self.img
            .seek(SeekFrom::Start(bn.index() as u64 * BLOCK_SIZE as u64))?;
        self.img.read_exact(bytes)
    }

    fn read_inode(&mut self, ino: InodeNo) -> io::Result<DiskInode> {
        let mut block = InodeBlock::zeroed();
        self.read_block(self.sb.inode_block(ino), &mut block)?;
        Ok(*block.get(ino))
    }

    fn write_inode(&mut self, ino: InodeNo, inode: &DiskInode) -> io::Result<()> {
        let bn = self.sb.inode_block(ino);
        let mut block = InodeBlock::zeroed();
        self.read_block(bn, &mut block)?;
        *block.get_mut(ino) = *inode;
        self.write_block(bn, &block)
    }

    fn alloc_inode(&mut self, kind: FileKind) -> io::Result<InodeNo> {
        let ino = InodeNo::new(self.next_inode);
        self.next_inode += 1;
        assert!(self.next_inode <= self.sb.ninodes);

        let mut inode = DiskInode::zeroed();
        inode.kind = kind as i16;
        inode.nlink = 1;
        self.write_inode(ino, &inode)?;
        Ok(ino)
    }

    fn alloc_block(&mut self) -> u32 {
        let bn = self.next_block;
        self.next_block += 1;
        assert!(bn < self.sb.size, "image full");
        bn
    }

    /// A fresh directory linked to itself via "." and "..". The root's
    /// ".." also points at itself.
    fn add_directory(&mut self) -> io::Result<InodeNo> {
        let ino = self.alloc_inode(FileKind::Dir)?;
        self.add_dir_entry(ino, ino, b".")?;
        self.add_dir_entry(ino, ino, b"..")?;
        Ok(ino)
    }

    fn add_file(&mut self, data: &[u8]) -> io::Result<InodeNo> {
        let ino = self.alloc_inode(FileKind::File)?;
        self.append(ino, data)?;
        Ok(ino)
    }

    fn add_dir_entry(&mut self, dir: InodeNo, ino: InodeNo, name: &[u8]) -> io::Result<()> {
        assert!(name.len() <= NAME_LEN);
        let mut entry = DirEntry::zeroed();
        entry.set_ino(ino);
        entry.set_name(name);
        self.append(dir, entry.as_bytes())
    }

    /// Appends `data` at the inode's current size, allocating direct and
    /// indirect blocks as the file grows.
    fn append(&mut self, ino: InodeNo, mut data: &[u8]) -> io::Result<()> {
        let mut inode = self.read_inode(ino)?;
        let mut off = inode.size as usize;

        while !data.is_empty() {
            let fbn = off / BLOCK_SIZE;
            assert!(fbn < MAX_FILE_BLOCKS, "input file too large");

            let bn = if fbn < NDIRECT {
                if inode.addrs[fbn] == 0 {
                    inode.addrs[fbn] = self.alloc_block();
                }
                inode.addrs[fbn]
            } else {
                if inode.addrs[NDIRECT] == 0 {
                    inode.addrs[NDIRECT] = self.alloc_block();
                }
                let ind_bn = BlockNo::new(inode.addrs[NDIRECT]);
                let mut ind = [0u32; NINDIRECT];
                self.read_block(ind_bn, &mut ind)?;
                if ind[fbn - NDIRECT] == 0 {
                    ind[fbn - NDIRECT] = self.alloc_block();
                    self.write_block(ind_bn, &ind)?;
                }
                ind[fbn - NDIRECT]
            };

            let mut block = [0u8; BLOCK_SIZE];
            self.read_block(BlockNo::new(bn), &mut block)?;
            let begin = off % BLOCK_SIZE;
            let n = data.len().min(BLOCK_SIZE - begin);
            block[begin..begin + n].copy_from_slice(&data[..n]);
            self.write_block(BlockNo::new(bn), &block)?;

            off += n;
            data = &data[n..];
        }

        inode.size = off as u32;
        self.write_inode(ino, &inode)
    }

    /// Writes the allocation bitmap covering every block handed out so
    /// far (all meta blocks included) and flushes the image.
    fn finish(mut self) -> io::Result<()> {
        let used = self.next_block as usize;
        eprintln!("mkfs: {used} blocks in use");
        assert!(used < BITS_PER_BLOCK, "bitmap spills into a second block");

        let mut bitmap = BitmapBlock::zeroed();
        for bn in 0..used {
            bitmap.set(bn);
        }
        self.write_block(BlockNo::new(self.sb.bitmap_start), &bitmap)?;
        self.img.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use osmium_fs_types::DIR_ENTRY_SIZE;

    use super::*;

    fn temp_image(name: &str) -> PathBuf {
        let mut path = env::temp_dir();
        path.push(format!("osmium-mkfs-test-{name}-{}", process::id()));
        path
    }

    fn read_block_at(img: &mut File, bn: u32) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        img.seek(SeekFrom::Start(bn as u64 * BLOCK_SIZE as u64))
            .unwrap();
        img.read_exact(&mut buf).unwrap();
        buf
    }

    fn read_inode_at(img: &mut File, sb: &SuperBlock, ino: InodeNo) -> DiskInode {
        let block = read_block_at(img, sb.inode_block(ino).value());
        let mut inodes = InodeBlock::zeroed();
        inodes.as_bytes_mut().copy_from_slice(&block);
        *inodes.get(ino)
    }

    fn build(name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = temp_image(name);
        let mut fs = ImageBuilder::create(&path).unwrap();
        let root = fs.add_directory().unwrap();
        for (fname, data) in files {
            let ino = fs.add_file(data).unwrap();
            fs.add_dir_entry(root, ino, fname.as_bytes()).unwrap();
        }
        fs.finish().unwrap();
        path
    }

    #[test]
    fn superblock_round_trips() {
        let path = build("sb", &[]);
        let mut img = File::open(&path).unwrap();

        let block = read_block_at(&mut img, 1);
        let mut sb = SuperBlock::zeroed();
        sb.as_bytes_mut()
            .copy_from_slice(&block[..size_of::<SuperBlock>()]);

        assert_eq!(sb.magic, SuperBlock::MAGIC);
        assert_eq!(sb.size as usize, FS_SIZE);
        assert_eq!(sb.nlog as usize, LOG_SIZE);
        assert_eq!(sb.log_start, 2);
        assert!(sb.inode_start > sb.log_start);
        assert!(sb.bitmap_start > sb.inode_start);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn root_directory_lists_its_files() {
        let path = build("root", &[("hello.txt", b"hello, disk")]);
        let mut img = File::open(&path).unwrap();
        let sb = layout();

        let root = read_inode_at(&mut img, &sb, InodeNo::ROOT);
        assert_eq!(root.kind, FileKind::Dir as i16);
        assert_eq!(root.size as usize, 3 * DIR_ENTRY_SIZE);

        let dir_block = read_block_at(&mut img, root.addrs[0]);
        let mut names = Vec::new();
        for i in 0..3 {
            let mut de = DirEntry::zeroed();
            de.as_bytes_mut()
                .copy_from_slice(&dir_block[i * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE]);
            assert!(de.ino().is_some());
            names.push(de.name().to_vec());
        }
        assert_eq!(
            names,
            vec![b".".to_vec(), b"..".to_vec(), b"hello.txt".to_vec()]
        );

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn file_contents_survive_the_trip() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let path = build("contents", &[("data.bin", &payload)]);
        let mut img = File::open(&path).unwrap();
        let sb = layout();

        // Inode 1 is the root directory; the first file gets inode 2.
        let inode = read_inode_at(&mut img, &sb, InodeNo::new(2));
        assert_eq!(inode.kind, FileKind::File as i16);
        assert_eq!(inode.size as usize, payload.len());

        let mut out = Vec::new();
        for fbn in 0..payload.len().div_ceil(BLOCK_SIZE) {
            let bn = inode.addrs[fbn];
            assert_ne!(bn, 0);
            out.extend_from_slice(&read_block_at(&mut img, bn));
        }
        out.truncate(payload.len());
        assert_eq!(out, payload);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn large_files_use_the_indirect_block() {
        let payload = vec![0x5au8; (NDIRECT + 3) * BLOCK_SIZE];
        let path = build("indirect", &[("big.bin", &payload)]);
        let mut img = File::open(&path).unwrap();
        let sb = layout();

        let inode = read_inode_at(&mut img, &sb, InodeNo::new(2));
        assert_eq!(inode.size as usize, payload.len());
        assert_ne!(inode.addrs[NDIRECT], 0);

        let ind_block = read_block_at(&mut img, inode.addrs[NDIRECT]);
        let mut ind = osmium_fs_types::IndirectBlock::zeroed();
        ind.as_bytes_mut().copy_from_slice(&ind_block);
        for i in 0..3 {
            let bn = ind.get(i).unwrap();
            assert!(
                read_block_at(&mut img, bn.value())
                    .iter()
                    .all(|&b| b == 0x5a)
            );
        }

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn bitmap_covers_exactly_the_used_blocks() {
        let path = build("bitmap", &[("f", b"x")]);
        let mut img = File::open(&path).unwrap();
        let sb = layout();

        let bm_block = read_block_at(&mut img, sb.bitmap_start);
        let mut bm = BitmapBlock::zeroed();
        bm.as_bytes_mut().copy_from_slice(&bm_block);

        // Every meta block is marked used.
        let first_data = first_data_block(&sb) as usize;
        for bn in 0..first_data {
            assert!(bm.is_set(bn), "meta block {bn} not marked");
        }
        // Root dir block + one data block for "f", then free space.
        assert!(bm.is_set(first_data));
        assert!(bm.is_set(first_data + 1));
        assert!(!bm.is_set(first_data + 2));

        std::fs::remove_file(path).unwrap();
    }
}
