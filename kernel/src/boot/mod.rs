//! Early Boot Setup
//!
//! The boot environment leaves the CPU in long mode on whatever transient
//! page tables the trampoline used. This module installs the kernel's own
//! identity map at the fixed table addresses (PML4 0x1000, PDPT 0x2000,
//! PD 0x3000) and maps the loader-populated user image window.

use crate::mm::page::{self, PageFlags, PageTable, PageTableEntry, ENTRIES_PER_TABLE};
use crate::mm::{PhysAddr, BOOT_PML4};
use crate::{PAGE_SIZE, USER_BASE, USER_IMAGE_SIZE};

/// Physical address of the boot PDPT
const BOOT_PDPT: u64 = 0x2000;

/// Physical address of the boot PD
const BOOT_PD: u64 = 0x3000;

/// 2 MB, the span of one PD leaf
const HUGE_PAGE_SIZE: u64 = 0x20_0000;

/// PD entry covering the user window; left unmapped so user pages arrive
/// 4 KB at a time through the demand pager
const USER_PD_INDEX: usize = (USER_BASE >> 21) as usize;

/// Build the identity map for the first 1 GB with 2 MB pages, minus the
/// user window, and switch CR3 to it.
pub fn early_paging_init() {
    unsafe {
        let pml4 = &mut *(BOOT_PML4 as *mut PageTable);
        let pdpt = &mut *(BOOT_PDPT as *mut PageTable);
        let pd = &mut *(BOOT_PD as *mut PageTable);

        pml4.clear();
        pdpt.clear();
        pd.clear();

        let table = PageFlags::PRESENT | PageFlags::WRITABLE;
        pml4[0] = PageTableEntry::new(PhysAddr::new(BOOT_PDPT), table);
        pdpt[0] = PageTableEntry::new(PhysAddr::new(BOOT_PD), table);

        let huge = table | PageFlags::HUGE;
        for i in 0..ENTRIES_PER_TABLE {
            if i == USER_PD_INDEX {
                continue;
            }
            pd[i] = PageTableEntry::new(PhysAddr::new(i as u64 * HUGE_PAGE_SIZE), huge);
        }

        page::write_cr3(BOOT_PML4);
    }

    log::debug!(
        "identity map installed, user window {:#x}..{:#x} demand-paged",
        USER_BASE,
        crate::USER_STACK_TOP
    );
}

/// Identity-map the code region the loader populated, read-only for user
/// mode. Stacks and data pages are not premapped; they fault in.
pub fn map_user_image() {
    for offset in (0..USER_IMAGE_SIZE).step_by(PAGE_SIZE) {
        let addr = USER_BASE + offset;
        if let Err(e) = crate::mm::map(addr, addr, true, false) {
            panic!("mapping user image at {:#x}: {:?}", addr, e);
        }
    }

    log::debug!(
        "user image window mapped: {:#x}..{:#x}",
        USER_BASE,
        USER_BASE + USER_IMAGE_SIZE
    );
}
