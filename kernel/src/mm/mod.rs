//! Memory Management Subsystem
//!
//! Physical frames, page tables, and the demand pager.
//!
//! # Prototype Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────┐
//!             │  low memory, boot    │  identity, 2 MB pages
//! 0x0010_0000 ├──────────────────────┤
//!             │  kernel image        │
//! 0x0020_0000 ├──────────────────────┤  kernel stack top
//!             │  kernel heap (1 MB)  │
//! 0x0040_0000 ├──────────────────────┤
//!             │  user window         │  4 KB pages, demand-paged
//! 0x0060_0000 ├──────────────────────┤  user stacks grow down from here
//!             │  identity map cont.  │
//! 0x0100_0000 ├──────────────────────┤
//!             │  frame pool cursor → │  grows upward, never rewinds
//!             └──────────────────────┘
//! ```
//!
//! Everything below 1 GB except the user window is identity-mapped with
//! 2 MB pages at boot; the user window is mapped 4 KB at a time, mostly on
//! demand. `phys_offset` is therefore zero: physical addresses are kernel
//! pointers as-is.

pub mod frame;
pub mod heap;
pub mod page;
pub mod pager;
pub mod virt;

pub use frame::FramePool;
pub use heap::{HeapUsage, KernelHeap};
pub use page::{PageFlags, PageTable, PageTableEntry, ENTRIES_PER_TABLE};
pub use pager::{FaultOutcome, FrameDescriptor, Pager, VmStats};
pub use virt::AddressSpace;

use crate::{
    FRAME_POOL_BASE, KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE, MAX_PHYSICAL_PAGES, PAGE_SIZE,
};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Physical address of the boot PML4
pub const BOOT_PML4: u64 = 0x1000;

/// Global kernel heap
#[cfg_attr(not(test), global_allocator)]
static KERNEL_HEAP: KernelHeap = KernelHeap::new();

/// Global frame pool (identity view: phys_offset 0)
static FRAME_POOL: Mutex<FramePool> = Mutex::new(FramePool::new(FRAME_POOL_BASE, 0));

/// The kernel address space, shared by every task in this prototype
static KERNEL_SPACE: Mutex<AddressSpace> =
    Mutex::new(AddressSpace::new(PhysAddr::new(BOOT_PML4), 0));

/// Global demand pager
static PAGER: Mutex<Pager> = Mutex::new(Pager::new(MAX_PHYSICAL_PAGES));

/// Guards against a page fault arriving while one is being serviced
static IN_FAULT: AtomicBool = AtomicBool::new(false);

/// Initialize memory management: bring up the kernel heap.
pub fn init() {
    unsafe {
        KERNEL_HEAP.init(KERNEL_HEAP_BASE as usize, KERNEL_HEAP_SIZE);
    }
    log::debug!(
        "kernel heap: {} KB at {:#x}",
        KERNEL_HEAP_SIZE / 1024,
        KERNEL_HEAP_BASE
    );
    log::debug!(
        "frame pool: cursor at {:#x}, pager capacity {} pages",
        FRAME_POOL_BASE,
        MAX_PHYSICAL_PAGES
    );
}

/// Page-table root shared by all tasks
pub fn kernel_root() -> u64 {
    KERNEL_SPACE.lock().pml4_phys().as_u64()
}

/// Page fault entry, called from the trap dispatcher with the faulting
/// address (CR2) and the pushed error code.
///
/// Faults outside the user window, protection faults on present pages, and
/// nested faults are all fatal. Anything else is demand paging.
pub fn handle_page_fault(addr: u64, error_code: u64) {
    if IN_FAULT.swap(true, Ordering::SeqCst) {
        panic!("nested page fault at {:#x}", addr);
    }
    if error_code & PageFlags::PRESENT.bits() != 0 {
        panic!(
            "protection fault at {:#x} (error code {:#x})",
            addr, error_code
        );
    }

    let outcome = {
        let mut space = KERNEL_SPACE.lock();
        let mut pool = FRAME_POOL.lock();
        let mut pager = PAGER.lock();
        pager.handle_fault(&mut space, &mut pool, VirtAddr::new(addr))
    };

    match outcome {
        Ok(o) => log::trace!("page fault at {:#x}: {:?}", addr, o),
        Err(e) => panic!("page fault at {:#x}: {:?}", addr, e),
    }

    page::flush_tlb_all();
    IN_FAULT.store(false, Ordering::SeqCst);
}

/// Map a 4 KB page in the kernel address space with composed flags.
pub fn map(vaddr: u64, paddr: u64, user: bool, writable: bool) -> crate::KernelResult<()> {
    let mut space = KERNEL_SPACE.lock();
    let mut pool = FRAME_POOL.lock();
    space.map_page(
        VirtAddr::new(vaddr),
        PhysAddr::new(paddr),
        PageFlags::compose(user, writable),
        &mut pool,
    )?;
    drop(pool);
    drop(space);
    page::flush_tlb_all();
    Ok(())
}

/// Clear the mapping for a virtual address; silent when absent.
pub fn unmap(vaddr: u64) {
    KERNEL_SPACE.lock().unmap_page(VirtAddr::new(vaddr));
    page::flush_tlb_all();
}

/// Resolve a virtual address in the kernel address space.
pub fn translate(vaddr: u64) -> Option<u64> {
    KERNEL_SPACE
        .lock()
        .translate(VirtAddr::new(vaddr))
        .map(|p| p.as_u64())
}

/// Combined memory diagnostics: pager state plus kernel heap usage
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    /// Demand pager counters
    pub vm: VmStats,
    /// Kernel heap usage
    pub heap: HeapUsage,
}

/// Memory diagnostics snapshot
pub fn stats() -> MemoryStats {
    MemoryStats {
        vm: PAGER.lock().stats(),
        heap: KERNEL_HEAP.usage(),
    }
}

/// Physical address type (newtype for type safety)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align down to page boundary
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Check if aligned to page boundary
    pub const fn is_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }
}

/// Virtual address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create new virtual address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align down to page boundary
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Offset within the page
    pub const fn offset_in_page(self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }

    /// Page table indices for the 4-level walk
    pub fn page_table_indices(self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1FF) as usize, // PML4
            ((self.0 >> 30) & 0x1FF) as usize, // PDPT
            ((self.0 >> 21) & 0x1FF) as usize, // PD
            ((self.0 >> 12) & 0x1FF) as usize, // PT
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_alignment() {
        let addr = VirtAddr::new(0x40_1234);
        assert_eq!(addr.align_down().as_u64(), 0x40_1000);
        assert_eq!(addr.offset_in_page(), 0x234);

        assert!(PhysAddr::new(0x40_1000).is_aligned());
        assert!(!PhysAddr::new(0x40_1001).is_aligned());
    }

    #[test]
    fn test_page_table_indices() {
        // 0x40_0000 = PML4 0, PDPT 0, PD 2, PT 0
        assert_eq!(VirtAddr::new(0x40_0000).page_table_indices(), [0, 0, 2, 0]);
        // The whole user window lives under PD entry 2.
        assert_eq!(VirtAddr::new(0x5F_F000).page_table_indices(), [0, 0, 2, 511]);
        // Kernel image sits under PD entry 0.
        assert_eq!(VirtAddr::new(0x10_0000).page_table_indices()[2], 0);
    }
}
