//! The physical frame pool.
//!
//! All allocatable RAM — everything between the kernel image (plus the
//! heap region carved off its end) and [`PHYS_TOP`] — goes into one
//! [`FramePool`] behind a spin lock. Everyone who needs a whole page
//! (user memory, page tables, kernel stacks, trapframes, virtqueue
//! rings) takes it from here.

use core::ptr::NonNull;

use frame_pool::FramePool;
use once_slot::OnceSlot;

use crate::error::KernelError;
use crate::sync::SpinLock;

use super::layout::{PHYS_TOP, image};
use super::{PAGE_SIZE, page_round_up};

/// Bytes reserved between the kernel image and the frame pool for the
/// kernel heap.
pub(super) const HEAP_SIZE: usize = 4 * 1024 * 1024;

static POOL: OnceSlot<SpinLock<FramePool<PAGE_SIZE>>> = OnceSlot::new();

/// First byte of the heap region (page aligned, right after the image).
pub(super) fn heap_start() -> usize {
    page_round_up(image::kernel_end())
}

pub fn init() {
    let start = heap_start() + HEAP_SIZE;
    let pool = unsafe {
        FramePool::new(
            core::ptr::with_exposed_provenance_mut(start)
                ..core::ptr::with_exposed_provenance_mut(PHYS_TOP),
        )
    };
    POOL.set(SpinLock::new(pool));
}

/// One poisoned 4096-byte frame.
pub fn alloc_frame() -> Result<NonNull<u8>, KernelError> {
    POOL.get().lock().alloc().ok_or(KernelError::OutOfFrames)
}

/// One zeroed 4096-byte frame.
pub fn alloc_zeroed_frame() -> Result<NonNull<u8>, KernelError> {
    POOL.get()
        .lock()
        .alloc_zeroed()
        .ok_or(KernelError::OutOfFrames)
}

/// Returns a frame to the pool.
///
/// # Safety
///
/// `frame` must have come from [`alloc_frame`]/[`alloc_zeroed_frame`]
/// and must not be referenced again.
pub unsafe fn free_frame(frame: NonNull<u8>) {
    unsafe {
        POOL.get().lock().free(frame);
    }
}
