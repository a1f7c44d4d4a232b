//! Page Table Structures
//!
//! 4-level page tables for x86_64:
//! - PML4 (Page Map Level 4)
//! - PDPT (Page Directory Pointer Table)
//! - PD (Page Directory)
//! - PT (Page Table)
//!
//! User mappings are 4 KB leaves; the early kernel identity map uses 2 MB
//! PD leaves (see `boot`).

use super::PhysAddr;
use bitflags::bitflags;

/// Number of entries per page table
pub const ENTRIES_PER_TABLE: usize = 512;

/// Mask selecting the physical address bits of an entry
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Page is present in memory
        const PRESENT = 1 << 0;
        /// Page is writable
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching
        const NO_CACHE = 1 << 4;
        /// Page has been accessed
        const ACCESSED = 1 << 5;
        /// Page has been written to
        const DIRTY = 1 << 6;
        /// Huge page (2MB at PD level)
        const HUGE = 1 << 7;
        /// Global (not flushed on CR3 switch)
        const GLOBAL = 1 << 8;
        /// No execute (requires NXE bit in EFER; unused while the boot
        /// environment leaves NXE off)
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Kernel mapping: writable, global
    pub const KERNEL_PAGE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::GLOBAL);

    /// User code mapping: read-only, executable
    pub const USER_CODE: Self = Self::PRESENT.union(Self::USER);

    /// Demand-allocated user page: writable
    pub const USER_PAGE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Compose leaf flags the way the pager maps pages: Present always,
    /// Writable and User as requested, Global for kernel mappings.
    pub fn compose(user: bool, writable: bool) -> Self {
        let mut flags = Self::PRESENT;
        if writable {
            flags |= Self::WRITABLE;
        }
        if user {
            flags |= Self::USER;
        } else {
            flags |= Self::GLOBAL;
        }
        flags
    }
}

/// Page table entry
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create empty entry
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create entry with address and flags
    pub fn new(addr: PhysAddr, flags: PageFlags) -> Self {
        Self((addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Get flags
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Get physical address
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Check if entry is present
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// Check if entry is a huge page
    pub fn is_huge(&self) -> bool {
        self.flags().contains(PageFlags::HUGE)
    }

    /// Clear entry
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &format_args!("{:#x}", self.addr().as_u64()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// Page table (512 entries)
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create empty page table
    pub const fn new() -> Self {
        const EMPTY: PageTableEntry = PageTableEntry::empty();
        Self {
            entries: [EMPTY; ENTRIES_PER_TABLE],
        }
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Read the active page-table root
///
/// # Safety
/// Privileged instruction; kernel context only.
pub unsafe fn read_cr3() -> u64 {
    let cr3: u64;
    core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
    cr3
}

/// Load a page-table root
///
/// # Safety
/// `value` must point at a valid PML4; kernel context only.
pub unsafe fn write_cr3(value: u64) {
    core::arch::asm!("mov cr3, {}", in(reg) value, options(nostack));
}

/// Flush all non-global TLB entries by reloading CR3 with its current
/// value. Sufficient after any mapping change on a single CPU.
pub fn flush_tlb_all() {
    unsafe {
        write_cr3(read_cr3());
    }
}
