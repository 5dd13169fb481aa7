//! virtio-blk driver: the producer side of one split virtqueue.
//!
//! Every request is a three-descriptor chain — header, data, status —
//! published through the available ring. The submitter sleeps on its
//! chain's completion condvar; the interrupt handler drains the used
//! ring and wakes submitters. Fences around the ring index updates
//! match the device's acquire/release expectations.

use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

use once_slot::OnceSlot;
use osmium_fs_types::BLOCK_SIZE;

use crate::memory::layout::VIRTIO0;
use crate::memory::page;
use crate::sync::{SpinLock, SpinLockCondVar, SpinLockGuard};

use super::virtio::{
    AvailRing, BLK_IN, BLK_OUT, BlkRequest, Desc, DescFlags, DeviceStatus, Features, MmioReg,
    QUEUE_LEN, SECTOR_SIZE, UsedRing,
};

const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;

fn read_reg(reg: MmioReg) -> u32 {
    unsafe { ptr::with_exposed_provenance::<u32>(VIRTIO0 + reg as usize).read_volatile() }
}

fn write_reg(reg: MmioReg, value: u32) {
    unsafe {
        ptr::with_exposed_provenance_mut::<u32>(VIRTIO0 + reg as usize).write_volatile(value);
    }
}

/// An in-flight chain, indexed by its head descriptor.
struct Inflight {
    /// The device stores 0 here on success.
    status: u8,
    in_progress: bool,
}

struct Disk {
    /// The descriptor table, available ring and used ring, each in its
    /// own frame as the device expects physically contiguous memory.
    desc: NonNull<[Desc; QUEUE_LEN]>,
    avail: NonNull<AvailRing>,
    used: NonNull<UsedRing>,

    /// Which descriptors are ours to hand out.
    free: [bool; QUEUE_LEN],
    /// Where we have drained the used ring to.
    used_idx: u16,

    inflight: [Inflight; QUEUE_LEN],
    /// Request headers, one per descriptor, so their addresses are
    /// stable while the device reads them.
    requests: [BlkRequest; QUEUE_LEN],
}

unsafe impl Send for Disk {}

static DISK: OnceSlot<SpinLock<Disk>> = OnceSlot::new();
static DESC_FREED: SpinLockCondVar = SpinLockCondVar::new();
static COMPLETED: [SpinLockCondVar; QUEUE_LEN] = [const { SpinLockCondVar::new() }; QUEUE_LEN];

pub fn init() {
    assert_eq!(read_reg(MmioReg::MagicValue), 0x7472_6976, "not virtio");
    assert_eq!(read_reg(MmioReg::Version), 2, "not modern virtio-mmio");
    assert_eq!(read_reg(MmioReg::DeviceId), 2, "not a block device");
    assert_eq!(read_reg(MmioReg::VendorId), 0x554d_4551, "unexpected vendor");

    let mut status = DeviceStatus::empty();
    write_reg(MmioReg::Status, status.bits()); // reset

    status |= DeviceStatus::ACKNOWLEDGE;
    write_reg(MmioReg::Status, status.bits());
    status |= DeviceStatus::DRIVER;
    write_reg(MmioReg::Status, status.bits());

    // Take the mandatory feature set and nothing optional.
    let mut features = Features::from_bits_retain(read_reg(MmioReg::DeviceFeatures));
    features.remove(Features::BLK_RO);
    features.remove(Features::BLK_SCSI);
    features.remove(Features::BLK_CONFIG_WCE);
    features.remove(Features::BLK_MQ);
    features.remove(Features::ANY_LAYOUT);
    features.remove(Features::RING_EVENT_IDX);
    features.remove(Features::RING_INDIRECT_DESC);
    write_reg(MmioReg::DriverFeatures, features.bits());

    status |= DeviceStatus::FEATURES_OK;
    write_reg(MmioReg::Status, status.bits());

    // The device must accept the negotiation.
    let confirmed = DeviceStatus::from_bits_retain(read_reg(MmioReg::Status));
    assert!(
        confirmed.contains(DeviceStatus::FEATURES_OK),
        "virtio feature negotiation failed"
    );

    // Queue 0: size, then the three ring areas.
    write_reg(MmioReg::QueueSel, 0);
    assert_eq!(read_reg(MmioReg::QueueReady), 0, "queue already live");
    let max = read_reg(MmioReg::QueueNumMax);
    assert!(max != 0, "queue 0 missing");
    assert!(max as usize >= QUEUE_LEN, "queue 0 too small");
    write_reg(MmioReg::QueueNum, QUEUE_LEN as u32);

    let desc: NonNull<[Desc; QUEUE_LEN]> =
        page::alloc_zeroed_frame().expect("virtqueue").cast();
    let avail: NonNull<AvailRing> = page::alloc_zeroed_frame().expect("virtqueue").cast();
    let used: NonNull<UsedRing> = page::alloc_zeroed_frame().expect("virtqueue").cast();

    let addr = |p: usize| (p as u64 & 0xffff_ffff) as u32;
    let addr_hi = |p: usize| (p as u64 >> 32) as u32;
    write_reg(MmioReg::QueueDescLow, addr(desc.addr().get()));
    write_reg(MmioReg::QueueDescHigh, addr_hi(desc.addr().get()));
    write_reg(MmioReg::DriverDescLow, addr(avail.addr().get()));
    write_reg(MmioReg::DriverDescHigh, addr_hi(avail.addr().get()));
    write_reg(MmioReg::DeviceDescLow, addr(used.addr().get()));
    write_reg(MmioReg::DeviceDescHigh, addr_hi(used.addr().get()));

    write_reg(MmioReg::QueueReady, 1);

    status |= DeviceStatus::DRIVER_OK;
    write_reg(MmioReg::Status, status.bits());

    DISK.set(SpinLock::new(Disk {
        desc,
        avail,
        used,
        free: [true; QUEUE_LEN],
        used_idx: 0,
        inflight: [const {
            Inflight {
                status: 0,
                in_progress: false,
            }
        }; QUEUE_LEN],
        requests: [const {
            BlkRequest {
                ty: BLK_IN,
                reserved: 0,
                sector: 0,
            }
        }; QUEUE_LEN],
    }));
}

impl Disk {
    fn desc_table(&mut self) -> &mut [Desc; QUEUE_LEN] {
        unsafe { self.desc.as_mut() }
    }

    fn avail_ring(&self) -> &AvailRing {
        unsafe { self.avail.as_ref() }
    }

    fn avail_slots(&mut self) -> &mut [u16; QUEUE_LEN] {
        unsafe { &mut self.avail.as_mut().ring }
    }

    fn used_ring(&self) -> &UsedRing {
        unsafe { self.used.as_ref() }
    }

    fn take_desc(&mut self) -> Option<usize> {
        let i = self.free.iter().position(|&f| f)?;
        self.free[i] = false;
        Some(i)
    }

    fn release_desc(&mut self, i: usize) {
        assert!(!self.free[i], "double free of a descriptor");
        self.desc_table()[i] = Desc::default();
        self.free[i] = true;
        DESC_FREED.notify();
    }

    fn release_chain(&mut self, head: usize) {
        let mut i = head;
        loop {
            let desc = self.desc_table()[i];
            self.release_desc(i);
            if !desc.flags.contains(DescFlags::NEXT) {
                break;
            }
            i = desc.next as usize;
        }
    }

    /// Three descriptors or none.
    fn take_chain(&mut self) -> Option<[usize; 3]> {
        let mut taken = [0; 3];
        for i in 0..3 {
            match self.take_desc() {
                Some(d) => taken[i] = d,
                None => {
                    for &d in &taken[..i] {
                        self.release_desc(d);
                    }
                    return None;
                }
            }
        }
        Some(taken)
    }

    /// Builds and publishes the chain for one block transfer.
    fn submit(&mut self, chain: [usize; 3], block: usize, data: *const u8, write: bool) {
        let [head, body, tail] = chain;

        self.requests[head] = BlkRequest {
            ty: if write { BLK_OUT } else { BLK_IN },
            reserved: 0,
            sector: (block * SECTORS_PER_BLOCK) as u64,
        };
        let request_addr = ptr::from_ref(&self.requests[head]).addr() as u64;

        self.inflight[head].status = 0xff; // device writes 0 on success
        self.inflight[head].in_progress = true;
        let status_addr = ptr::from_ref(&self.inflight[head].status).addr() as u64;

        self.desc_table()[head] = Desc {
            addr: request_addr,
            len: size_of::<BlkRequest>() as u32,
            flags: DescFlags::NEXT,
            next: body as u16,
        };

        self.desc_table()[body] = Desc {
            addr: data.addr() as u64,
            len: BLOCK_SIZE as u32,
            // On a read the device writes the buffer; on a write it
            // only reads it.
            flags: if write {
                DescFlags::NEXT
            } else {
                DescFlags::NEXT | DescFlags::WRITE
            },
            next: tail as u16,
        };

        self.desc_table()[tail] = Desc {
            addr: status_addr,
            len: 1,
            flags: DescFlags::WRITE,
            next: 0,
        };

        // Publish the head, then bump the index with release ordering so
        // the device observes the slot before the new index.
        let idx = self.avail_ring().idx.load(Ordering::Relaxed);
        self.avail_slots()[idx as usize % QUEUE_LEN] = head as u16;
        self.avail_ring().idx.fetch_add(1, Ordering::AcqRel);

        write_reg(MmioReg::QueueNotify, 0);
    }
}

fn transfer(block: usize, data: *const u8, write: bool) {
    let mut disk: SpinLockGuard<'_, Disk> = DISK.get().lock();

    let chain = loop {
        match disk.take_chain() {
            Some(chain) => break chain,
            None => disk = DESC_FREED.wait(disk),
        }
    };

    disk.submit(chain, block, data, write);

    // The interrupt handler clears in_progress and signals us.
    let head = chain[0];
    while disk.inflight[head].in_progress {
        disk = COMPLETED[head].wait(disk);
    }
    assert_eq!(disk.inflight[head].status, 0, "disk request failed");

    disk.release_chain(head);
}

/// Reads file-system block `block` into `data`. Sleeps until done.
pub fn read(block: usize, data: &mut [u8; BLOCK_SIZE]) {
    transfer(block, data.as_ptr(), false);
}

/// Writes `data` to file-system block `block`. Sleeps until durable.
pub fn write(block: usize, data: &[u8; BLOCK_SIZE]) {
    transfer(block, data.as_ptr(), true);
}

/// Completion interrupt: acknowledge, then drain the used ring.
pub fn handle_interrupt() {
    let mut disk = DISK.get().lock();

    // Acknowledging first may race with the device appending more
    // completions; we would then drain them now and find nothing at the
    // next interrupt, which is harmless.
    write_reg(
        MmioReg::InterruptAck,
        read_reg(MmioReg::InterruptStatus) & 0x3,
    );

    while disk.used_idx != disk.used_ring().idx.load(Ordering::Acquire) {
        let slot = disk.used_idx as usize % QUEUE_LEN;
        let head = disk.used_ring().ring[slot].id as usize;

        assert!(disk.inflight[head].in_progress, "spurious completion");
        disk.inflight[head].in_progress = false;
        COMPLETED[head].notify();

        disk.used_idx += 1;
    }
}
