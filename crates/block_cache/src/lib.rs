//! Buffer cache for disk blocks.
//!
//! A fixed arena of block-sized slots fronts the device. Reference counts
//! and the LRU ordering live in one table behind a single lock; each
//! slot's payload sits behind its own lock so block I/O on different
//! blocks proceeds in parallel. The LRU chain is kept as prev/next arena
//! indices rather than owning pointers, and both ends are tracked: hits
//! and releases touch the head, eviction scans from the tail.
//!
//! Invariants:
//!
//! * at most one slot holds any given block number;
//! * a slot is recycled only when its reference count is zero, and the
//!   least recently used such slot is taken first;
//! * when every slot is referenced, [`BlockCache::get`] panics — callers
//!   must bound their concurrent pins below the cache size.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use dataview::Pod;
use mutex_core::Mutex;

/// The disk interface the cache multiplexes.
pub trait BlockDevice<const BLOCK_SIZE: usize> {
    type Error: core::fmt::Debug;

    /// Reads block `index` into `buf`, blocking until complete.
    fn read(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;

    /// Writes `buf` to block `index`, blocking until durable.
    fn write(&self, index: usize, buf: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
}

const NONE: usize = usize::MAX;

/// Bookkeeping for one arena slot; protected by the table lock.
struct Entry {
    /// Cached block number, if any.
    block: Option<usize>,
    /// Live handles plus log pins. Non-zero keeps the slot resident.
    refs: u32,
    /// Neighbors in the recency chain (arena indices).
    prev: usize,
    next: usize,
}

/// The recency chain and per-slot bookkeeping.
pub struct Table {
    entries: Box<[Entry]>,
    head: usize,
    tail: usize,
}

impl Table {
    fn new(len: usize) -> Self {
        assert!(len > 0);
        let entries = (0..len)
            .map(|i| Entry {
                block: None,
                refs: 0,
                prev: if i == 0 { NONE } else { i - 1 },
                next: if i + 1 == len { NONE } else { i + 1 },
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entries,
            head: 0,
            tail: len - 1,
        }
    }

    fn unlink(&mut self, i: usize) {
        let Entry { prev, next, .. } = self.entries[i];
        match prev {
            NONE => self.head = next,
            p => self.entries[p].next = next,
        }
        match next {
            NONE => self.tail = prev,
            n => self.entries[n].prev = prev,
        }
    }

    fn push_front(&mut self, i: usize) {
        self.entries[i].prev = NONE;
        self.entries[i].next = self.head;
        match self.head {
            NONE => self.tail = i,
            h => self.entries[h].prev = i,
        }
        self.head = i;
    }

    /// Most-recently-used first.
    fn iter_recent(&self) -> impl Iterator<Item = usize> + '_ {
        let mut i = self.head;
        core::iter::from_fn(move || {
            let cur = i;
            (cur != NONE).then(|| {
                i = self.entries[cur].next;
                cur
            })
        })
    }

    /// Least-recently-used first.
    fn iter_stale(&self) -> impl Iterator<Item = usize> + '_ {
        let mut i = self.tail;
        core::iter::from_fn(move || {
            let cur = i;
            (cur != NONE).then(|| {
                i = self.entries[cur].prev;
                cur
            })
        })
    }
}

struct Slot<BM> {
    /// Whether the payload reflects the on-disk block. Readable without
    /// the payload lock; written only while holding it (or during
    /// eviction, when no handle exists).
    valid: AtomicBool,
    data: BM,
}

/// The cache proper.
pub struct BlockCache<D, TM, BM, const BLOCK_SIZE: usize> {
    device: D,
    table: TM,
    slots: Box<[Slot<BM>]>,
}

impl<D, TM, BM, const BLOCK_SIZE: usize> BlockCache<D, TM, BM, BLOCK_SIZE>
where
    D: BlockDevice<BLOCK_SIZE>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]>,
{
    /// Creates a cache of `len` slots in front of `device`.
    pub fn new(device: D, len: usize) -> Self {
        let slots = (0..len)
            .map(|_| Slot {
                valid: AtomicBool::new(false),
                data: BM::new([0; BLOCK_SIZE]),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            device,
            table: TM::new(Table::new(len)),
            slots,
        }
    }

    /// Returns a handle for `block`, reusing the cached slot when present
    /// and recycling the least recently used free slot otherwise.
    ///
    /// Returns `None` when every slot is referenced.
    pub fn try_get(&self, block: usize) -> Option<BlockHandle<'_, D, TM, BM, BLOCK_SIZE>> {
        let mut table = self.table.lock();

        let found = table
            .iter_recent()
            .find(|&i| table.entries[i].block == Some(block));
        if let Some(i) = found {
            table.entries[i].refs += 1;
            return Some(BlockHandle {
                cache: self,
                index: i,
                block,
            });
        }

        let i = table.iter_stale().find(|&i| table.entries[i].refs == 0)?;
        table.entries[i].block = Some(block);
        table.entries[i].refs = 1;
        self.slots[i].valid.store(false, Ordering::Release);
        Some(BlockHandle {
            cache: self,
            index: i,
            block,
        })
    }

    /// Like [`BlockCache::try_get`], but panics when every slot is
    /// referenced.
    #[track_caller]
    pub fn get(&self, block: usize) -> BlockHandle<'_, D, TM, BM, BLOCK_SIZE> {
        self.try_get(block).expect("block cache exhausted")
    }

    /// The device behind the cache.
    pub fn device(&self) -> &D {
        &self.device
    }
}

/// A counted reference to a cached block.
///
/// Dropping the handle releases the reference and promotes the slot to
/// most-recently-used.
pub struct BlockHandle<'c, D, TM, BM, const BLOCK_SIZE: usize>
where
    D: BlockDevice<BLOCK_SIZE>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]>,
{
    cache: &'c BlockCache<D, TM, BM, BLOCK_SIZE>,
    index: usize,
    block: usize,
}

impl<D, TM, BM, const BLOCK_SIZE: usize> Drop for BlockHandle<'_, D, TM, BM, BLOCK_SIZE>
where
    D: BlockDevice<BLOCK_SIZE>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]>,
{
    fn drop(&mut self) {
        let mut table = self.cache.table.lock();
        let entry = &mut table.entries[self.index];
        assert!(entry.refs > 0);
        entry.refs -= 1;
        table.unlink(self.index);
        table.push_front(self.index);
    }
}

impl<'c, D, TM, BM, const BLOCK_SIZE: usize> BlockHandle<'c, D, TM, BM, BLOCK_SIZE>
where
    D: BlockDevice<BLOCK_SIZE>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]>,
{
    /// The block number this handle refers to.
    #[must_use]
    pub fn block(&self) -> usize {
        self.block
    }

    /// Adds a reference so the slot survives this handle, keeping the
    /// block resident for the log across a commit.
    pub fn pin(&self) {
        let mut table = self.cache.table.lock();
        let entry = &mut table.entries[self.index];
        entry.refs = entry.refs.checked_add(1).unwrap();
    }

    /// Releases a [`BlockHandle::pin`].
    ///
    /// # Safety
    ///
    /// The caller must have pinned this block and not yet unpinned it;
    /// otherwise the slot can be recycled under a live handle.
    pub unsafe fn unpin(&self) {
        let mut table = self.cache.table.lock();
        let entry = &mut table.entries[self.index];
        assert!(entry.refs > 1, "unpin without pin");
        entry.refs -= 1;
    }

    /// Locks the payload for exclusive access. May block.
    pub fn lock(&self) -> BlockGuard<'c, '_, D, TM, BM, BLOCK_SIZE> {
        let slot = &self.cache.slots[self.index];
        BlockGuard {
            handle: self,
            data: slot.data.lock(),
        }
    }
}

/// Exclusive access to a cached block's payload.
pub struct BlockGuard<'c, 'h, D, TM, BM, const BLOCK_SIZE: usize>
where
    D: BlockDevice<BLOCK_SIZE>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]> + 'c,
{
    handle: &'h BlockHandle<'c, D, TM, BM, BLOCK_SIZE>,
    data: BM::Guard<'h>,
}

impl<D, TM, BM, const BLOCK_SIZE: usize> BlockGuard<'_, '_, D, TM, BM, BLOCK_SIZE>
where
    D: BlockDevice<BLOCK_SIZE>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]>,
{
    fn slot(&self) -> &Slot<BM> {
        &self.handle.cache.slots[self.handle.index]
    }

    /// Whether the payload currently mirrors the disk.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.slot().valid.load(Ordering::Acquire)
    }

    /// Fills the payload from the device unless it is already valid.
    pub fn read(&mut self) -> Result<(), D::Error> {
        if !self.is_valid() {
            let block = self.handle.block;
            self.handle.cache.device.read(block, &mut self.data)?;
            self.slot().valid.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Writes the payload through to the device.
    ///
    /// # Panics
    ///
    /// Panics if the payload was never filled.
    pub fn write(&mut self) -> Result<(), D::Error> {
        assert!(self.is_valid(), "writing a block that was never filled");
        self.handle
            .cache
            .device
            .write(self.handle.block, &self.data)
    }

    /// Overwrites the whole payload, making it valid.
    pub fn fill(&mut self, bytes: &[u8; BLOCK_SIZE]) {
        self.data.copy_from_slice(bytes);
        self.slot().valid.store(true, Ordering::Release);
    }

    /// Zeroes the whole payload, making it valid.
    pub fn zero(&mut self) {
        self.data.fill(0);
        self.slot().valid.store(true, Ordering::Release);
    }

    /// The payload bytes.
    ///
    /// # Panics
    ///
    /// Panics if the payload was never filled.
    #[must_use]
    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        assert!(self.is_valid(), "reading a block that was never filled");
        &self.data
    }

    /// The payload bytes, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the payload was never filled.
    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        assert!(self.is_valid(), "reading a block that was never filled");
        &mut self.data
    }

    /// The payload viewed as a `Pod` structure.
    #[must_use]
    pub fn as_view<T: Pod>(&self) -> &T {
        use dataview::PodMethods as _;
        self.bytes().as_data_view().get(0)
    }

    /// The payload viewed as a mutable `Pod` structure.
    pub fn as_view_mut<T: Pod>(&mut self) -> &mut T {
        use dataview::PodMethods as _;
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mutex_core::host::HostMutex;

    use super::*;

    const BS: usize = 512;

    #[derive(Clone, Default)]
    struct MockDisk {
        blocks: Arc<std::sync::Mutex<std::collections::HashMap<usize, [u8; BS]>>>,
        reads: Arc<AtomicUsize>,
        writes: Arc<AtomicUsize>,
    }

    impl BlockDevice<BS> for MockDisk {
        type Error = core::convert::Infallible;

        fn read(&self, index: usize, buf: &mut [u8; BS]) -> Result<(), Self::Error> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            *buf = *self.blocks.lock().unwrap().entry(index).or_insert([0; BS]);
            Ok(())
        }

        fn write(&self, index: usize, buf: &[u8; BS]) -> Result<(), Self::Error> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.blocks.lock().unwrap().insert(index, *buf);
            Ok(())
        }
    }

    type Cache = BlockCache<MockDisk, HostMutex<Table>, HostMutex<[u8; BS]>, BS>;

    fn cache(slots: usize) -> (MockDisk, Cache) {
        let disk = MockDisk::default();
        (disk.clone(), Cache::new(disk, slots))
    }

    #[test]
    fn get_does_not_touch_the_device() {
        let (disk, cache) = cache(4);
        let _h = cache.get(7);
        assert_eq!(disk.reads.load(Ordering::Relaxed), 0);
        assert_eq!(disk.writes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let (disk, cache) = cache(4);
        for _ in 0..3 {
            let h = cache.get(7);
            let mut g = h.lock();
            g.read().unwrap();
        }
        assert_eq!(disk.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn at_most_one_slot_per_block() {
        let (disk, cache) = cache(4);

        // Two live handles to the same block share one slot: a write
        // staged through the first is visible through the second without
        // another device read.
        let h1 = cache.get(3);
        let h2 = cache.get(3);
        {
            let mut g = h1.lock();
            g.read().unwrap();
            g.bytes_mut()[0] = 0xaa;
        }
        {
            let mut g = h2.lock();
            g.read().unwrap();
            assert_eq!(g.bytes()[0], 0xaa);
        }
        assert_eq!(disk.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn write_goes_through_to_the_device() {
        let (disk, cache) = cache(2);
        {
            let h = cache.get(5);
            let mut g = h.lock();
            g.zero();
            g.bytes_mut()[..4].copy_from_slice(b"data");
            g.write().unwrap();
        }
        assert_eq!(&disk.blocks.lock().unwrap()[&5][..4], b"data");
    }

    #[test]
    fn eviction_takes_the_least_recently_used() {
        let (disk, cache) = cache(3);
        for block in 0..3 {
            cache.get(block).lock().read().unwrap();
        }
        // Touch 0 so 1 becomes the stalest.
        cache.get(0).lock().read().unwrap();
        cache.get(9).lock().read().unwrap(); // evicts 1

        cache.get(0).lock().read().unwrap(); // still cached
        cache.get(2).lock().read().unwrap(); // still cached
        assert_eq!(disk.reads.load(Ordering::Relaxed), 4);

        cache.get(1).lock().read().unwrap(); // must re-read
        assert_eq!(disk.reads.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn referenced_slots_are_never_evicted() {
        let (_disk, cache) = cache(2);
        let h0 = cache.get(0);
        let h1 = cache.get(1);
        assert!(cache.try_get(2).is_none());
        drop(h1);
        assert!(cache.try_get(2).is_some());
        drop(h0);
    }

    #[test]
    #[should_panic(expected = "block cache exhausted")]
    fn exhaustion_panics() {
        let (_disk, cache) = cache(1);
        let _h = cache.get(0);
        let _ = cache.get(1);
    }

    #[test]
    fn pin_keeps_a_block_resident() {
        let (disk, cache) = cache(2);
        {
            let h = cache.get(0);
            h.lock().read().unwrap();
            h.pin();
        }
        // Churn through enough blocks to evict anything unpinned.
        for block in 10..14 {
            cache.get(block).lock().read().unwrap();
        }
        {
            let h = cache.get(0);
            h.lock().read().unwrap();
            unsafe {
                h.unpin();
            }
        }
        // Block 0 was read exactly once: the pin held it in the cache.
        let zero_reads = disk.reads.load(Ordering::Relaxed) - 4;
        assert_eq!(zero_reads, 1);
    }

    #[test]
    fn recycled_slots_forget_their_old_contents() {
        let (disk, cache) = cache(1);
        {
            let h = cache.get(0);
            let mut g = h.lock();
            g.zero();
            g.bytes_mut()[0] = 7;
            g.write().unwrap();
        }
        cache.get(1).lock().read().unwrap();
        {
            let h = cache.get(0);
            let mut g = h.lock();
            g.read().unwrap();
            assert_eq!(g.bytes()[0], 7);
        }
        assert_eq!(disk.reads.load(Ordering::Relaxed), 2);
    }
}
