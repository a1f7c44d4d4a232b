//! Address Space Management
//!
//! Walks and edits the 4-level page-table tree. Missing intermediate tables
//! are claimed lazily from the frame pool, zeroed, and marked
//! Present+Writable (+User when the leaf is a user mapping).
//!
//! These methods never touch CR3; the `mm` entry points reload it after a
//! mutation so the walk logic stays independent of the hardware it runs on.

use super::frame::FramePool;
use super::page::{PageFlags, PageTable, PageTableEntry};
use super::{PhysAddr, VirtAddr};
use crate::{KernelError, KernelResult};

/// An address space rooted at a PML4 frame
pub struct AddressSpace {
    pml4: PhysAddr,
    phys_offset: u64,
}

impl AddressSpace {
    /// Wrap an existing PML4 root. `phys_offset` is the linear offset from
    /// physical addresses to kernel-visible pointers (zero under the boot
    /// identity map).
    pub const fn new(pml4: PhysAddr, phys_offset: u64) -> Self {
        Self { pml4, phys_offset }
    }

    /// PML4 physical address (the CR3 value for this space)
    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4
    }

    fn table_mut(&self, paddr: PhysAddr) -> &'static mut PageTable {
        unsafe { &mut *((paddr.as_u64() + self.phys_offset) as *mut PageTable) }
    }

    /// Map a 4 KB page. Intermediate tables are allocated from `pool` as
    /// needed. Fails with `AlreadyMapped` when a leaf (or a huge
    /// intermediate) already covers `virt`.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        pool: &mut FramePool,
    ) -> KernelResult<()> {
        let indices = virt.page_table_indices();
        let user = flags & PageFlags::USER;

        let mut table = self.table_mut(self.pml4);
        for &index in &indices[..3] {
            let entry = &mut table[index];
            if !entry.is_present() {
                let frame = pool.claim_zeroed();
                *entry = PageTableEntry::new(
                    frame,
                    PageFlags::PRESENT | PageFlags::WRITABLE | user,
                );
            } else if entry.is_huge() {
                return Err(KernelError::AlreadyMapped);
            }
            table = self.table_mut(entry.addr());
        }

        let leaf = &mut table[indices[3]];
        if leaf.is_present() {
            return Err(KernelError::AlreadyMapped);
        }
        *leaf = PageTableEntry::new(phys, flags);

        Ok(())
    }

    /// Clear the 4 KB mapping for `virt`. Returns silently when any level
    /// of the walk is absent.
    pub fn unmap_page(&mut self, virt: VirtAddr) {
        let indices = virt.page_table_indices();

        let mut table = self.table_mut(self.pml4);
        for &index in &indices[..3] {
            let entry = &table[index];
            if !entry.is_present() || entry.is_huge() {
                return;
            }
            table = self.table_mut(entry.addr());
        }

        table[indices[3]].clear();
    }

    /// Resolve a virtual address, honoring 1 GB and 2 MB leaves.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let indices = virt.page_table_indices();

        let pml4e = &self.table_mut(self.pml4)[indices[0]];
        if !pml4e.is_present() {
            return None;
        }

        let pdpte = &self.table_mut(pml4e.addr())[indices[1]];
        if !pdpte.is_present() {
            return None;
        }
        if pdpte.is_huge() {
            let offset = virt.as_u64() & 0x3FFF_FFFF;
            return Some(PhysAddr::new(pdpte.addr().as_u64() + offset));
        }

        let pde = &self.table_mut(pdpte.addr())[indices[2]];
        if !pde.is_present() {
            return None;
        }
        if pde.is_huge() {
            let offset = virt.as_u64() & 0x1F_FFFF;
            return Some(PhysAddr::new(pde.addr().as_u64() + offset));
        }

        let pte = &self.table_mut(pde.addr())[indices[3]];
        if !pte.is_present() {
            return None;
        }

        Some(PhysAddr::new(pte.addr().as_u64() + virt.offset_in_page()))
    }

    /// The leaf entry mapping `virt`, if the walk reaches a 4 KB page.
    pub fn leaf(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        let indices = virt.page_table_indices();

        let mut table = self.table_mut(self.pml4);
        for &index in &indices[..3] {
            let entry = &table[index];
            if !entry.is_present() || entry.is_huge() {
                return None;
            }
            table = self.table_mut(entry.addr());
        }

        let leaf = table[indices[3]];
        leaf.is_present().then_some(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use alloc::boxed::Box;
    use alloc::vec;

    #[repr(C, align(4096))]
    #[derive(Clone, Copy)]
    struct Page([u8; PAGE_SIZE]);

    /// A page-aligned arena posing as physical memory, plus a pool and an
    /// address space rooted inside it.
    fn setup(pages: usize) -> (Box<[Page]>, FramePool, AddressSpace) {
        let arena = vec![Page([0u8; PAGE_SIZE]); pages].into_boxed_slice();
        let base = arena.as_ptr() as u64;
        let mut pool = FramePool::new(base, 0);
        let pml4 = pool.claim_zeroed();
        let space = AddressSpace::new(pml4, 0);
        (arena, pool, space)
    }

    #[test]
    fn test_map_then_translate() {
        let (_arena, mut pool, mut space) = setup(8);
        let virt = VirtAddr::new(0x50_0000);
        let phys = pool.claim_zeroed();

        space
            .map_page(virt, phys, PageFlags::USER_PAGE, &mut pool)
            .unwrap();

        assert_eq!(space.translate(virt), Some(phys));
        // Offsets within the page carry through.
        assert_eq!(
            space.translate(VirtAddr::new(0x50_0123)),
            Some(PhysAddr::new(phys.as_u64() + 0x123))
        );

        let leaf = space.leaf(virt).unwrap();
        assert_eq!(leaf.flags() & PageFlags::USER_PAGE, PageFlags::USER_PAGE);
    }

    #[test]
    fn test_unmap_round_trip() {
        let (_arena, mut pool, mut space) = setup(8);
        let virt = VirtAddr::new(0x40_3000);
        let phys = pool.claim_zeroed();

        space
            .map_page(virt, phys, PageFlags::USER_PAGE, &mut pool)
            .unwrap();
        space.unmap_page(virt);

        assert_eq!(space.translate(virt), None);
        assert!(space.leaf(virt).is_none());

        // Remapping after unmap succeeds.
        space
            .map_page(virt, phys, PageFlags::USER_PAGE, &mut pool)
            .unwrap();
        assert_eq!(space.translate(virt), Some(phys));
    }

    #[test]
    fn test_unmap_absent_is_silent() {
        let (_arena, _pool, mut space) = setup(4);
        space.unmap_page(VirtAddr::new(0x50_0000));
        assert_eq!(space.translate(VirtAddr::new(0x50_0000)), None);
    }

    #[test]
    fn test_double_map_rejected() {
        let (_arena, mut pool, mut space) = setup(8);
        let virt = VirtAddr::new(0x41_0000);
        let phys = pool.claim_zeroed();

        space
            .map_page(virt, phys, PageFlags::USER_PAGE, &mut pool)
            .unwrap();
        assert_eq!(
            space.map_page(virt, phys, PageFlags::USER_PAGE, &mut pool),
            Err(KernelError::AlreadyMapped)
        );
    }

    #[test]
    fn test_intermediate_tables_shared() {
        let (_arena, mut pool, mut space) = setup(16);

        // Two pages in the same 2 MB region reuse one page table: first map
        // claims PDPT+PD+PT+nothing, second claims nothing.
        let p1 = pool.claim_zeroed();
        let p2 = pool.claim_zeroed();
        let before = pool.claimed();
        space
            .map_page(VirtAddr::new(0x40_0000), p1, PageFlags::USER_PAGE, &mut pool)
            .unwrap();
        let after_first = pool.claimed();
        space
            .map_page(VirtAddr::new(0x40_1000), p2, PageFlags::USER_PAGE, &mut pool)
            .unwrap();

        assert_eq!(after_first - before, 3);
        assert_eq!(pool.claimed(), after_first);
    }

    #[test]
    fn test_translate_through_2mb_leaf() {
        let (_arena, mut pool, space) = setup(8);

        // Hand-build PML4 -> PDPT -> PD with a huge leaf, the shape of the
        // boot identity map.
        let pdpt = pool.claim_zeroed();
        let pd = pool.claim_zeroed();
        let virt = VirtAddr::new(0x40_0000);
        let indices = virt.page_table_indices();

        let huge = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE;
        space.table_mut(space.pml4_phys())[indices[0]] =
            PageTableEntry::new(pdpt, PageFlags::PRESENT | PageFlags::WRITABLE);
        space.table_mut(pdpt)[indices[1]] =
            PageTableEntry::new(pd, PageFlags::PRESENT | PageFlags::WRITABLE);
        space.table_mut(pd)[indices[2]] = PageTableEntry::new(PhysAddr::new(0x40_0000), huge);

        assert_eq!(
            space.translate(VirtAddr::new(0x41_2345)),
            Some(PhysAddr::new(0x41_2345))
        );
        // No 4 KB leaf exists under a huge mapping.
        assert!(space.leaf(virt).is_none());
    }
}
