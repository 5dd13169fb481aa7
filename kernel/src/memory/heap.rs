//! Kernel heap: a first-fit free list with address-ordered coalescing,
//! serving `Box`, `Arc` and `Vec` for the handful of kernel objects that
//! are not whole pages (file table entries, pipes, cache arenas).

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use crate::sync::SpinLock;

use super::page::{HEAP_SIZE, heap_start};

/// Every chunk is a multiple of this, and every pointer handed out is
/// aligned to it.
const GRAIN: usize = 16;

/// Per-allocation header recording the chunk size for dealloc.
#[repr(C)]
struct Header {
    size: usize,
    _pad: usize,
}

const _: () = assert!(size_of::<Header>() == GRAIN);

struct Hole {
    size: usize,
    next: Option<NonNull<Hole>>,
}

struct Heap {
    head: Option<NonNull<Hole>>,
}

unsafe impl Send for Heap {}

impl Heap {
    /// Takes the first hole that fits, splitting off the tail when the
    /// remainder is big enough to stand alone.
    fn alloc(&mut self, chunk: usize) -> Option<NonNull<u8>> {
        let mut prev: Option<NonNull<Hole>> = None;
        let mut cur = self.head;
        while let Some(hole) = cur {
            let hole_size = unsafe { hole.as_ref().size };
            if hole_size >= chunk {
                let next = unsafe { hole.as_ref().next };
                let rest = hole_size - chunk;
                let replacement = if rest >= size_of::<Hole>() {
                    let mut tail = unsafe { hole.cast::<u8>().add(chunk).cast::<Hole>() };
                    unsafe {
                        tail.as_mut().size = rest;
                        tail.as_mut().next = next;
                    }
                    Some(tail)
                } else {
                    next
                };
                match prev {
                    None => self.head = replacement,
                    Some(mut p) => unsafe { p.as_mut().next = replacement },
                }
                return Some(hole.cast());
            }
            prev = cur;
            cur = unsafe { hole.as_ref().next };
        }
        None
    }

    /// Inserts a chunk keeping the list address-sorted, merging with
    /// both neighbors where they touch.
    unsafe fn free(&mut self, chunk: NonNull<u8>, size: usize) {
        let mut prev: Option<NonNull<Hole>> = None;
        let mut cur = self.head;
        while let Some(hole) = cur {
            if hole.cast() > chunk {
                break;
            }
            prev = cur;
            cur = unsafe { hole.as_ref().next };
        }

        let mut hole = chunk.cast::<Hole>();
        unsafe {
            hole.as_mut().size = size;
            hole.as_mut().next = cur;
        }

        // Merge forward.
        if let Some(next) = cur {
            if unsafe { hole.cast::<u8>().add(hole.as_ref().size) } == next.cast() {
                unsafe {
                    hole.as_mut().size += next.as_ref().size;
                    hole.as_mut().next = next.as_ref().next;
                }
            }
        }

        // Merge backward, or link in.
        match prev {
            Some(mut p) if unsafe { p.cast::<u8>().add(p.as_ref().size) } == hole.cast() => unsafe {
                p.as_mut().size += hole.as_ref().size;
                p.as_mut().next = hole.as_ref().next;
            },
            Some(mut p) => unsafe {
                p.as_mut().next = Some(hole);
            },
            None => self.head = Some(hole),
        }
    }
}

struct KernelAllocator {
    heap: SpinLock<Heap>,
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator {
    heap: SpinLock::new(Heap { head: None }),
};

pub fn init() {
    let start = heap_start();
    unsafe {
        ALLOCATOR.heap.lock().free(
            NonNull::new(ptr::with_exposed_provenance_mut(start)).unwrap(),
            HEAP_SIZE,
        );
    }
}

fn chunk_size(layout: Layout) -> usize {
    assert!(
        layout.align() <= GRAIN,
        "kernel heap alignment limit exceeded; use the frame pool"
    );
    (layout.size() + size_of::<Header>()).next_multiple_of(GRAIN)
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let chunk = chunk_size(layout);
        let Some(base) = self.heap.lock().alloc(chunk) else {
            return ptr::null_mut();
        };
        unsafe {
            let mut header = base.cast::<Header>();
            header.as_mut().size = chunk;
            base.add(size_of::<Header>()).as_ptr()
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe {
            let base = NonNull::new(ptr).unwrap().sub(size_of::<Header>());
            let size = base.cast::<Header>().as_ref().size;
            self.heap.lock().free(base, size);
        }
    }
}
