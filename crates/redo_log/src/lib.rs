//! Write-ahead log with group commit.
//!
//! Every file-system mutation happens inside an operation bracketed by
//! [`RedoLog::begin`] / [`RedoLog::end`]. Mutated blocks are staged with
//! [`RedoLog::record`] instead of being written home. When the last
//! outstanding operation ends, the whole batch commits:
//!
//! 1. copy each staged block from the cache to its log slot,
//! 2. write the header block with a non-zero count — the commit point,
//! 3. copy log slots to their home blocks,
//! 4. zero the header count.
//!
//! Every step is a synchronous block write, so the on-disk commit order is
//! the program order. A crash before step 2 leaves the disk untouched; a
//! crash after it leaves a committed transaction that [`RedoLog::recover`]
//! replays at the next boot. Recovery is idempotent.
//!
//! [`RedoLog::begin`] reserves worst-case space: an operation may write at
//! most `max_op_blocks` blocks, and begin blocks while the staged count
//! plus the reservations of every live operation could overflow the log.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::convert::Infallible;

use block_cache::{BlockCache, BlockDevice, BlockHandle, Table};
use mutex_core::{Condvar, Mutex};
use osmium_fs_types::{BLOCK_SIZE, BlockNo, LogHeader};

/// Shared operation bookkeeping; protected by the log mutex.
pub struct LogState {
    /// Operations between `begin` and `end`.
    outstanding: usize,
    /// A commit is running; new operations must wait.
    committing: bool,
    /// Home addresses of the staged blocks, in log-slot order.
    staged: Vec<BlockNo>,
}

/// The log itself. `'c` is the cache it stages through.
pub struct RedoLog<'c, D, TM, BM, LM, CV>
where
    D: BlockDevice<BLOCK_SIZE>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]>,
    LM: Mutex<Data = LogState>,
    CV: Condvar<LM>,
{
    cache: &'c BlockCache<D, TM, BM, BLOCK_SIZE>,
    /// The header block; body slots follow it.
    header: BlockNo,
    /// Body slots available.
    capacity: usize,
    /// Per-operation write budget.
    max_op_blocks: usize,
    state: LM,
    /// Signaled when space frees up or a commit finishes.
    space: CV,
}

impl<'c, D, TM, BM, LM, CV> RedoLog<'c, D, TM, BM, LM, CV>
where
    D: BlockDevice<BLOCK_SIZE, Error = Infallible>,
    TM: Mutex<Data = Table>,
    BM: Mutex<Data = [u8; BLOCK_SIZE]>,
    LM: Mutex<Data = LogState>,
    CV: Condvar<LM>,
{
    /// Creates a log over `capacity` body blocks following `header`.
    pub fn new(
        cache: &'c BlockCache<D, TM, BM, BLOCK_SIZE>,
        header: BlockNo,
        capacity: usize,
        max_op_blocks: usize,
        space: CV,
    ) -> Self {
        assert!(capacity <= osmium_fs_types::LOG_HEADER_SLOTS);
        assert!(max_op_blocks <= capacity);
        Self {
            cache,
            header,
            capacity,
            max_op_blocks,
            state: LM::new(LogState {
                outstanding: 0,
                committing: false,
                staged: Vec::new(),
            }),
            space,
        }
    }

    fn body(&self, i: usize) -> BlockNo {
        debug_assert!(i < self.capacity);
        BlockNo::new(self.header.value() + 1 + i as u32)
    }

    /// Replays a committed-but-uninstalled transaction left by a crash,
    /// then clears the header. Must run before the first operation.
    pub fn recover(&self) {
        let homes = self.read_header();
        self.install(&homes, true);
        self.write_header(&[]);
    }

    /// Starts an operation, blocking while a commit is running or while
    /// the log could not absorb this operation's worst case.
    pub fn begin(&self) {
        let mut state = self.state.lock();
        loop {
            let reserved = state.staged.len() + (state.outstanding + 1) * self.max_op_blocks;
            if state.committing || reserved > self.capacity {
                state = self.space.wait(state);
                continue;
            }
            state.outstanding += 1;
            break;
        }
    }

    /// Ends an operation. The last operation out runs the commit.
    pub fn end(&self) {
        let commit_now = {
            let mut state = self.state.lock();
            assert!(!state.committing);
            assert!(state.outstanding > 0);
            state.outstanding -= 1;
            if state.outstanding == 0 {
                state.committing = true;
                true
            } else {
                // A queued begin may now fit; its reservation shrank.
                self.space.notify_all();
                false
            }
        };

        if commit_now {
            // Committing without the state lock held: the flag keeps
            // every other operation out, and block writes sleep.
            self.commit();
            let mut state = self.state.lock();
            state.committing = false;
            drop(state);
            self.space.notify_all();
        }
    }

    /// Stages `handle`'s block for the current transaction instead of
    /// writing it home. Re-staging an already staged block reuses its log
    /// slot; a new block is pinned in the cache until the commit installs
    /// it.
    pub fn record(&self, handle: &BlockHandle<'_, D, TM, BM, BLOCK_SIZE>) {
        let block = BlockNo::new(u32::try_from(handle.block()).unwrap());
        let mut state = self.state.lock();
        assert!(
            state.staged.len() < self.capacity,
            "transaction overflows the log"
        );
        assert!(state.outstanding > 0, "record outside an operation");

        // Absorption: one slot per distinct block per transaction.
        if !state.staged.contains(&block) {
            handle.pin();
            state.staged.push(block);
        }
    }

    /// Number of staged blocks in the open transaction.
    pub fn staged_len(&self) -> usize {
        self.state.lock().staged.len()
    }

    fn commit(&self) {
        // `outstanding == 0` and `committing` hold, so nobody appends.
        let homes = core::mem::take(&mut self.state.lock().staged);
        if homes.is_empty() {
            return;
        }
        self.write_body(&homes);
        self.write_header(&homes); // the commit point
        self.install(&homes, false);
        self.write_header(&[]); // transaction erased
    }

    /// Copies staged cache blocks into their log slots.
    fn write_body(&self, homes: &[BlockNo]) {
        for (i, home) in homes.iter().enumerate() {
            let from = self.cache.get(home.index());
            let mut from = from.lock();
            let Ok(()) = from.read();
            let to = self.cache.get(self.body(i).index());
            let mut to = to.lock();
            to.fill(from.bytes());
            let Ok(()) = to.write();
        }
    }

    /// Copies log slots to their home blocks. During normal commit each
    /// installed block sheds the pin taken by [`RedoLog::record`];
    /// recovery never pinned, so it leaves refcounts alone.
    fn install(&self, homes: &[BlockNo], recovering: bool) {
        for (i, home) in homes.iter().enumerate() {
            let from = self.cache.get(self.body(i).index());
            let mut from_data = from.lock();
            let Ok(()) = from_data.read();

            let to = self.cache.get(home.index());
            let mut to_data = to.lock();
            to_data.fill(from_data.bytes());
            let Ok(()) = to_data.write();
            drop(to_data);

            if !recovering {
                unsafe {
                    to.unpin();
                }
            }
        }
    }

    fn read_header(&self) -> Vec<BlockNo> {
        let handle = self.cache.get(self.header.index());
        let mut guard = handle.lock();
        let Ok(()) = guard.read();
        let header: &LogHeader = guard.as_view();
        (0..header.count()).map(|i| header.home(i)).collect()
    }

    fn write_header(&self, homes: &[BlockNo]) {
        let handle = self.cache.get(self.header.index());
        let mut guard = handle.lock();
        guard.zero();
        let header: &mut LogHeader = guard.as_view_mut();
        header.set_count(homes.len());
        for (i, home) in homes.iter().enumerate() {
            header.set_home(i, *home);
        }
        let Ok(()) = guard.write();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use mutex_core::host::{HostCondvar, HostMutex};

    use super::*;

    /// An in-memory disk whose power can be cut: once `writes_left`
    /// reaches zero, writes are silently dropped, as if the machine died
    /// mid-sequence.
    #[derive(Clone, Default)]
    struct CuttableDisk {
        blocks: Arc<StdMutex<HashMap<usize, [u8; BLOCK_SIZE]>>>,
        writes_left: Arc<AtomicUsize>,
        total_writes: Arc<AtomicUsize>,
    }

    impl CuttableDisk {
        fn new() -> Self {
            let disk = Self::default();
            disk.writes_left.store(usize::MAX, Ordering::Relaxed);
            disk
        }

        fn cut_after(&self, writes: usize) {
            self.writes_left.store(writes, Ordering::Relaxed);
        }

        fn block(&self, index: usize) -> [u8; BLOCK_SIZE] {
            *self
                .blocks
                .lock()
                .unwrap()
                .get(&index)
                .unwrap_or(&[0; BLOCK_SIZE])
        }

        fn set_block(&self, index: usize, fill: u8) {
            self.blocks
                .lock()
                .unwrap()
                .insert(index, [fill; BLOCK_SIZE]);
        }
    }

    impl BlockDevice<BLOCK_SIZE> for CuttableDisk {
        type Error = Infallible;

        fn read(&self, index: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            *buf = self.block(index);
            Ok(())
        }

        fn write(&self, index: usize, buf: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            self.total_writes.fetch_add(1, Ordering::Relaxed);
            if self
                .writes_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                    left.checked_sub(1)
                })
                .is_err()
            {
                // Power is gone; the write never reaches the platter.
                return Ok(());
            }
            self.blocks.lock().unwrap().insert(index, *buf);
            Ok(())
        }
    }

    type Cache =
        BlockCache<CuttableDisk, HostMutex<Table>, HostMutex<[u8; BLOCK_SIZE]>, BLOCK_SIZE>;
    type Log<'c> = RedoLog<
        'c,
        CuttableDisk,
        HostMutex<Table>,
        HostMutex<[u8; BLOCK_SIZE]>,
        HostMutex<LogState>,
        HostCondvar,
    >;

    const HEADER: BlockNo = BlockNo::new(2);
    const CAPACITY: usize = 8;
    const MAX_OP: usize = 4;
    // Home blocks used by the tests, beyond the log region.
    const HOME_A: usize = 100;
    const HOME_B: usize = 101;

    fn log_over(cache: &Cache) -> Log<'_> {
        RedoLog::new(cache, HEADER, CAPACITY, MAX_OP, HostCondvar::new())
    }

    /// Stages `fill` into `block` inside the open operation.
    fn stage(log: &Log<'_>, cache: &Cache, block: usize, fill: u8) {
        let handle = cache.get(block);
        let mut guard = handle.lock();
        let Ok(()) = guard.read();
        guard.bytes_mut().fill(fill);
        drop(guard);
        log.record(&handle);
    }

    #[test]
    fn nothing_reaches_home_before_the_last_end() {
        let disk = CuttableDisk::new();
        disk.set_block(HOME_A, 0x11);
        let cache = Cache::new(disk.clone(), 16);
        let log = log_over(&cache);
        log.recover();

        log.begin();
        log.begin();
        stage(&log, &cache, HOME_A, 0x22);
        log.end();
        // One operation still open: the group has not committed.
        assert_eq!(disk.block(HOME_A)[0], 0x11);
        log.end();
        assert_eq!(disk.block(HOME_A)[0], 0x22);
    }

    #[test]
    fn absorption_uses_one_slot_per_block() {
        let disk = CuttableDisk::new();
        let cache = Cache::new(disk, 16);
        let log = log_over(&cache);
        log.recover();

        log.begin();
        stage(&log, &cache, HOME_A, 1);
        stage(&log, &cache, HOME_A, 2);
        stage(&log, &cache, HOME_B, 3);
        assert_eq!(log.staged_len(), 2);
        log.end();
    }

    #[test]
    fn absorbed_rewrites_commit_the_final_value() {
        let disk = CuttableDisk::new();
        let cache = Cache::new(disk.clone(), 16);
        let log = log_over(&cache);
        log.recover();

        log.begin();
        stage(&log, &cache, HOME_A, 1);
        stage(&log, &cache, HOME_A, 2);
        log.end();
        assert_eq!(disk.block(HOME_A)[0], 2);
    }

    #[test]
    fn commit_clears_the_header() {
        let disk = CuttableDisk::new();
        let cache = Cache::new(disk.clone(), 16);
        let log = log_over(&cache);
        log.recover();

        log.begin();
        stage(&log, &cache, HOME_A, 9);
        log.end();

        let header = disk.block(HEADER.index());
        assert_eq!(&header[..4], &[0, 0, 0, 0]);
    }

    /// Cut power after every possible write during a two-block commit;
    /// after reboot + recovery, the disk shows either both old values or
    /// both new values, never a mix.
    #[test]
    fn crash_at_any_point_is_all_or_nothing() {
        // A two-block transaction commits in six writes:
        // 2 body copies, header, 2 installs, header clear.
        let total_commit_writes = 6;

        for cut in 0..=total_commit_writes {
            let disk = CuttableDisk::new();
            disk.set_block(HOME_A, 0xaa);
            disk.set_block(HOME_B, 0xbb);

            {
                let cache = Cache::new(disk.clone(), 16);
                let log = log_over(&cache);
                log.recover();

                log.begin();
                stage(&log, &cache, HOME_A, 0x1a);
                stage(&log, &cache, HOME_B, 0x1b);
                disk.cut_after(cut);
                log.end();
            }

            // Reboot: a fresh cache over whatever made it to the platter.
            disk.writes_left.store(usize::MAX, Ordering::Relaxed);
            let cache = Cache::new(disk.clone(), 16);
            let log = log_over(&cache);
            log.recover();

            let a = disk.block(HOME_A)[0];
            let b = disk.block(HOME_B)[0];
            assert!(
                (a, b) == (0xaa, 0xbb) || (a, b) == (0x1a, 0x1b),
                "cut after {cut} writes left a torn state: a={a:#x} b={b:#x}"
            );
            // Before the header write the transaction must vanish; after
            // it, it must survive.
            if cut < 3 {
                assert_eq!((a, b), (0xaa, 0xbb));
            } else {
                assert_eq!((a, b), (0x1a, 0x1b));
            }
        }
    }

    #[test]
    fn recovery_is_idempotent() {
        let disk = CuttableDisk::new();
        disk.set_block(HOME_A, 0xaa);

        {
            let cache = Cache::new(disk.clone(), 16);
            let log = log_over(&cache);
            log.recover();
            log.begin();
            stage(&log, &cache, HOME_A, 0x77);
            // Die right after the commit point: header written, nothing
            // installed (1 body write + 1 header write).
            disk.cut_after(2);
            log.end();
        }

        disk.writes_left.store(usize::MAX, Ordering::Relaxed);
        for _ in 0..3 {
            let cache = Cache::new(disk.clone(), 16);
            let log = log_over(&cache);
            log.recover();
            assert_eq!(disk.block(HOME_A)[0], 0x77);
        }
    }

    #[test]
    fn empty_operations_commit_nothing() {
        let disk = CuttableDisk::new();
        let cache = Cache::new(disk.clone(), 16);
        let log = log_over(&cache);
        log.recover();
        let after_recovery = disk.total_writes.load(Ordering::Relaxed);

        log.begin();
        log.end();
        // Only recovery's header clear hit the disk.
        assert_eq!(disk.total_writes.load(Ordering::Relaxed), after_recovery);
    }

    #[test]
    #[should_panic(expected = "record outside an operation")]
    fn recording_outside_an_operation_panics() {
        let disk = CuttableDisk::new();
        let cache = Cache::new(disk, 16);
        let log = log_over(&cache);
        log.recover();

        let handle = cache.get(HOME_A);
        handle.lock().zero();
        log.record(&handle);
    }
}
