//! Physical page-frame allocator.
//!
//! A single free list threaded through the free frames themselves: each
//! free frame's first bytes hold the link to the next free frame, so the
//! allocator needs no storage of its own. Frames are poisoned with
//! [`FREE_FILL`] when freed and [`ALLOC_FILL`] when handed out, so both
//! use-after-free and use-before-init read as recognizable garbage.

#![cfg_attr(not(test), no_std)]

use core::ops::Range;
use core::ptr::NonNull;

/// Byte written over a frame when it is freed.
pub const FREE_FILL: u8 = 0xf5;
/// Byte written over a frame when it is allocated.
pub const ALLOC_FILL: u8 = 0xa5;

struct FreeFrame {
    next: Option<NonNull<FreeFrame>>,
}

/// A pool of `FRAME_SIZE`-byte frames carved out of one contiguous region.
///
/// The pool itself is not thread-safe; the caller wraps it in a lock.
pub struct FramePool<const FRAME_SIZE: usize> {
    region: Range<*mut u8>,
    head: Option<NonNull<FreeFrame>>,
    free_frames: usize,
}

unsafe impl<const FRAME_SIZE: usize> Send for FramePool<FRAME_SIZE> {}

impl<const FRAME_SIZE: usize> FramePool<FRAME_SIZE> {
    /// Builds a pool over `region`, freeing every frame in it.
    ///
    /// `region` must be frame-aligned at both ends.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable memory that nothing else uses
    /// for the lifetime of the pool.
    pub unsafe fn new(region: Range<*mut u8>) -> Self {
        const {
            assert!(size_of::<FreeFrame>() <= FRAME_SIZE);
        }
        assert!(!region.start.is_null());
        assert_eq!(region.start.addr() % FRAME_SIZE, 0);
        assert_eq!(region.end.addr() % FRAME_SIZE, 0);

        let mut pool = Self {
            region: region.clone(),
            head: None,
            free_frames: 0,
        };
        let mut frame = region.start;
        while frame < region.end {
            unsafe {
                pool.free(NonNull::new(frame).unwrap());
                frame = frame.byte_add(FRAME_SIZE);
            }
        }
        pool
    }

    /// Number of frames currently on the free list.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Takes one frame off the free list, poisoned with [`ALLOC_FILL`].
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        let frame = self.head.take()?;
        self.head = unsafe { frame.as_ref().next };
        self.free_frames -= 1;

        let frame = frame.cast::<u8>();
        unsafe {
            frame.write_bytes(ALLOC_FILL, FRAME_SIZE);
        }
        Some(frame)
    }

    /// Takes one zeroed frame off the free list.
    pub fn alloc_zeroed(&mut self) -> Option<NonNull<u8>> {
        let frame = self.alloc()?;
        unsafe {
            frame.write_bytes(0, FRAME_SIZE);
        }
        Some(frame)
    }

    /// Returns `frame` to the free list, poisoned with [`FREE_FILL`].
    ///
    /// Freeing a pointer that is unaligned or outside the managed region
    /// is a fatal error.
    ///
    /// # Safety
    ///
    /// `frame` must have come from [`FramePool::alloc`] on this pool (or
    /// be part of the initial region walk) and must not be used again.
    pub unsafe fn free(&mut self, frame: NonNull<u8>) {
        assert_eq!(frame.addr().get() % FRAME_SIZE, 0, "misaligned frame");
        assert!(
            self.region.contains(&frame.as_ptr()),
            "frame outside the managed region"
        );

        unsafe {
            frame.write_bytes(FREE_FILL, FRAME_SIZE);
            let mut link = frame.cast::<FreeFrame>();
            link.as_mut().next = self.head;
            self.head = Some(link);
        }
        self.free_frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const FRAME: usize = 256;

    #[repr(align(256))]
    #[derive(Clone)]
    struct AlignedFrame([u8; FRAME]);

    fn region(frames: usize) -> (Vec<AlignedFrame>, Range<*mut u8>) {
        let mut backing = vec![AlignedFrame([0; FRAME]); frames];
        let range = backing.as_mut_ptr_range();
        (backing, range.start.cast()..range.end.cast())
    }

    #[test]
    fn init_frees_whole_region() {
        let (_backing, region) = region(10);
        let pool = unsafe { FramePool::<FRAME>::new(region) };
        assert_eq!(pool.free_frames(), 10);
    }

    #[test]
    fn free_then_alloc_round_trips() {
        let (_backing, region) = region(4);
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };

        let a = pool.alloc().unwrap();
        unsafe {
            pool.free(a);
        }
        // LIFO free list: the frame just freed comes back first.
        let b = pool.alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn free_list_length_is_conserved() {
        let (_backing, region) = region(8);
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };

        let before = pool.free_frames();
        let frames: Vec<_> = (0..5).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(pool.free_frames(), before - 5);
        for frame in frames {
            unsafe {
                pool.free(frame);
            }
        }
        assert_eq!(pool.free_frames(), before);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (_backing, region) = region(3);
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };

        let mut seen = HashSet::new();
        for _ in 0..3 {
            assert!(seen.insert(pool.alloc().unwrap()));
        }
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn alloc_poisons_frame() {
        let (_backing, region) = region(1);
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };

        let frame = pool.alloc().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), FRAME) };
        assert!(bytes.iter().all(|&b| b == ALLOC_FILL));
    }

    #[test]
    fn free_poisons_frame() {
        let (_backing, region) = region(2);
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };

        let frame = pool.alloc().unwrap();
        unsafe {
            pool.free(frame);
        }
        // Skip the link word at the head of the freed frame.
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), FRAME) };
        assert!(
            bytes[size_of::<Option<NonNull<u8>>>()..]
                .iter()
                .all(|&b| b == FREE_FILL)
        );
    }

    #[test]
    fn alloc_zeroed_clears_frame() {
        let (_backing, region) = region(1);
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };

        let frame = pool.alloc_zeroed().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), FRAME) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "misaligned frame")]
    fn freeing_misaligned_pointer_panics() {
        let (_backing, region) = region(2);
        let start = region.start;
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };
        unsafe {
            pool.free(NonNull::new(start.byte_add(1)).unwrap());
        }
    }

    #[test]
    #[should_panic(expected = "outside the managed region")]
    fn freeing_foreign_pointer_panics() {
        let (_backing, region) = region(2);
        let mut pool = unsafe { FramePool::<FRAME>::new(region) };
        let mut foreign = AlignedFrame([0; FRAME]);
        unsafe {
            pool.free(NonNull::new(foreign.0.as_mut_ptr()).unwrap());
        }
    }
}
