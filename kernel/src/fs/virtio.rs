//! virtio-mmio and virtio-blk definitions: register offsets, status and
//! feature bits, and the split-virtqueue ring structures shared with the
//! device.

use core::sync::atomic::AtomicU16;

use bitflags::bitflags;

/// Queue depth; the device model requires a power of two.
pub const QUEUE_LEN: usize = 8;

/// virtio-blk sector size; our file system blocks are two sectors.
pub const SECTOR_SIZE: usize = 512;

/// MMIO control registers, as byte offsets from the device base.
#[derive(Debug, Clone, Copy)]
#[repr(usize)]
pub enum MmioReg {
    /// Reads 0x74726976 ("virt").
    MagicValue = 0x000,
    /// Device model version; 2 is the modern interface.
    Version = 0x004,
    /// 2 means block device.
    DeviceId = 0x008,
    /// 0x554d4551 ("QEMU").
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    QueueSel = 0x030,
    QueueNumMax = 0x034,
    QueueNum = 0x038,
    QueueReady = 0x044,
    QueueNotify = 0x050,
    InterruptStatus = 0x060,
    InterruptAck = 0x064,
    Status = 0x070,
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    DriverDescLow = 0x090,
    DriverDescHigh = 0x094,
    DeviceDescLow = 0x0a0,
    DeviceDescHigh = 0x0a4,
}

bitflags! {
    /// Device status handshake bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1 << 0;
        const DRIVER = 1 << 1;
        const DRIVER_OK = 1 << 2;
        const FEATURES_OK = 1 << 3;
    }
}

bitflags! {
    /// Feature bits we care about; all of the optional ones get cleared
    /// during negotiation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const BLK_RO = 1 << 5;
        const BLK_SCSI = 1 << 7;
        const BLK_CONFIG_WCE = 1 << 11;
        const BLK_MQ = 1 << 12;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct DescFlags: u16 {
        /// Chain continues at `next`.
        const NEXT = 1;
        /// Device writes into this buffer (a read, from our side).
        const WRITE = 2;
    }
}

/// One descriptor: a buffer the device should read or write.
#[derive(Default, Clone, Copy)]
#[repr(C)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlags,
    pub next: u16,
}

/// The driver-owned ring of available descriptor chains. `idx` counts
/// submissions forever; the device consumes `ring[idx % QUEUE_LEN]`.
#[repr(C)]
pub struct AvailRing {
    pub flags: u16,
    pub idx: AtomicU16,
    pub ring: [u16; QUEUE_LEN],
    pub unused: u16,
}

/// One completion: the head of a finished chain.
#[derive(Default, Clone, Copy)]
#[repr(C)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

/// The device-owned ring of completions; `idx` advances as the device
/// finishes chains.
#[repr(C)]
pub struct UsedRing {
    pub flags: u16,
    pub idx: AtomicU16,
    pub ring: [UsedElem; QUEUE_LEN],
}

/// Request types in a [`BlkRequest`] header.
pub const BLK_IN: u32 = 0; // read
pub const BLK_OUT: u32 = 1; // write

/// The header descriptor of every block request, followed by the data
/// buffer and a one-byte status the device fills in (zero on success).
#[derive(Clone, Copy)]
#[repr(C)]
pub struct BlkRequest {
    pub ty: u32,
    pub reserved: u32,
    pub sector: u64,
}
