//! Kernel Heap
//!
//! Bump allocation over the fixed window between the kernel stack top and
//! user space. The cursor climbs the way the frame pool's does and never
//! rewinds; deallocation only drops the live count. That is enough for the
//! kernel's own bookkeeping (task names, pager descriptors), and the usage
//! counters feed the memory diagnostics in `mm::stats`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use spin::Mutex;

/// Cursor state. Addresses are held as plain integers; nothing here is
/// dereferenced, callers get the window mapped before `init`.
struct Bump {
    start: usize,
    limit: usize,
    cursor: usize,
    live: usize,
    failed: usize,
}

impl Bump {
    const fn unset() -> Self {
        Self {
            start: 0,
            limit: 0,
            cursor: 0,
            live: 0,
            failed: 0,
        }
    }

    /// Advance the cursor past an aligned block, or refuse when the window
    /// is exhausted (or not yet installed).
    fn carve(&mut self, layout: Layout) -> Option<usize> {
        if self.limit == 0 {
            return None;
        }
        let aligned = self.cursor.checked_add(layout.align() - 1)? & !(layout.align() - 1);
        let end = aligned.checked_add(layout.size())?;
        if end > self.limit {
            return None;
        }
        self.cursor = end;
        self.live += 1;
        Some(aligned)
    }
}

/// Kernel heap allocator
pub struct KernelHeap {
    bump: Mutex<Bump>,
}

impl KernelHeap {
    /// Create a heap with no window installed; allocation refuses until
    /// [`init`](Self::init) runs.
    pub const fn new() -> Self {
        Self {
            bump: Mutex::new(Bump::unset()),
        }
    }

    /// Install the heap window.
    ///
    /// # Safety
    /// - `[start, start + size)` must be mapped memory used by nothing else
    /// - Must run before the first allocation
    pub unsafe fn init(&self, start: usize, size: usize) {
        let mut bump = self.bump.lock();
        bump.start = start;
        bump.limit = start + size;
        bump.cursor = start;
    }

    /// Usage counters, surfaced through `mm::stats`
    pub fn usage(&self) -> HeapUsage {
        let bump = self.bump.lock();
        HeapUsage {
            used: bump.cursor - bump.start,
            free: bump.limit - bump.cursor,
            live: bump.live,
            failed: bump.failed,
        }
    }
}

/// Heap usage counters
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapUsage {
    /// Bytes consumed by the climbing cursor
    pub used: usize,
    /// Bytes left in the window
    pub free: usize,
    /// Allocations not yet freed
    pub live: usize,
    /// Allocations refused for lack of space
    pub failed: usize,
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut bump = self.bump.lock();
        match bump.carve(layout) {
            Some(addr) => addr as *mut u8,
            None => {
                bump.failed += 1;
                null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        // The cursor never rewinds; only the live count drops.
        let mut bump = self.bump.lock();
        bump.live = bump.live.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_over(buf: &mut [u8]) -> KernelHeap {
        let heap = KernelHeap::new();
        unsafe {
            heap.init(buf.as_mut_ptr() as usize, buf.len());
        }
        heap
    }

    #[test]
    fn test_alloc_respects_alignment() {
        let mut buf = [0u8; 4096];
        let heap = heap_over(&mut buf);

        let a = unsafe { heap.alloc(Layout::from_size_align(3, 1).unwrap()) };
        let b = unsafe { heap.alloc(Layout::from_size_align(8, 64).unwrap()) };

        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_eq!(b as usize % 64, 0);
    }

    #[test]
    fn test_exhaustion_is_counted_not_fatal() {
        let mut buf = [0u8; 256];
        let heap = heap_over(&mut buf);

        let big = Layout::from_size_align(1024, 8).unwrap();
        assert!(unsafe { heap.alloc(big) }.is_null());
        assert_eq!(heap.usage().failed, 1);

        // The window still serves requests that fit.
        let small = Layout::from_size_align(16, 8).unwrap();
        assert!(!unsafe { heap.alloc(small) }.is_null());
    }

    #[test]
    fn test_usage_tracks_cursor_and_live_count() {
        let mut buf = [0u8; 1024];
        let heap = heap_over(&mut buf);
        let layout = Layout::from_size_align(100, 4).unwrap();

        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());

        let usage = heap.usage();
        assert!(usage.used >= 100);
        assert_eq!(usage.live, 1);
        assert_eq!(usage.free, 1024 - usage.used);

        unsafe { heap.dealloc(ptr, layout) };
        assert_eq!(heap.usage().live, 0);
        assert_eq!(heap.usage().used, usage.used);
    }

    #[test]
    fn test_alloc_before_init_refuses() {
        let heap = KernelHeap::new();
        let layout = Layout::from_size_align(8, 8).unwrap();

        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert_eq!(heap.usage().failed, 1);
        assert_eq!(heap.usage().used, 0);
    }
}
