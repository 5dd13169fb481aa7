//! The slice of ELF64 that the loader needs.

use dataview::Pod;

pub const ELF_MAGIC: u32 = 0x464c_457f; // "\x7fELF", little-endian

/// A loadable segment.
pub const PT_LOAD: u32 = 1;

/// Segment permission bits in `ProgramHeader::flags`.
pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;

#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct ElfHeader {
    pub magic: u32,
    pub ident: [u8; 12],
    pub ty: u16,
    pub machine: u16,
    pub version: u32,
    /// Initial program counter.
    pub entry: u64,
    /// File offset of the program header table.
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    /// Number of program headers.
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct ProgramHeader {
    pub ty: u32,
    pub flags: u32,
    /// File offset of the segment bytes.
    pub off: u64,
    pub vaddr: u64,
    pub paddr: u64,
    /// Bytes present in the file.
    pub filesz: u64,
    /// Bytes in memory; the tail past `filesz` is zero (bss).
    pub memsz: u64,
    pub align: u64,
}
