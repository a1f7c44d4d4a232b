//! Demand Pager
//!
//! Services non-present faults in the user window:
//! - First touch of a page claims a zeroed frame and maps it writable+user
//! - Every frame carries an LRU ordinal, refreshed on each fault it absorbs
//! - When the descriptor set is full, the frame with the oldest ordinal is
//!   unmapped and its descriptor dropped; the allocation is retried once
//!
//! Dirty frames have no backing store in this prototype; "writeback" is
//! marking them clean. Evicted physical frames are leaked back to nobody —
//! the pool cursor never rewinds (see `frame`).

use super::frame::FramePool;
use super::page::PageFlags;
use super::virt::AddressSpace;
use super::{PhysAddr, VirtAddr};
use crate::{KernelError, KernelResult, USER_BASE, USER_STACK_TOP};
use alloc::vec::Vec;

/// Bookkeeping for one demand-allocated frame
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor {
    /// User virtual page this frame backs
    pub vaddr: VirtAddr,
    /// Physical frame base
    pub paddr: PhysAddr,
    /// Dirtied since the last (no-op) writeback
    pub dirty: bool,
    /// Touched since creation
    pub accessed: bool,
    /// LRU ordinal of the most recent touch
    pub last_access: u64,
}

/// How a fault was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A descriptor already covered the page; its ordinal was refreshed
    Refreshed,
    /// A fresh frame was allocated and mapped
    Allocated,
    /// Allocation needed one eviction first
    AllocatedAfterEviction,
}

/// Pager statistics
#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    /// Descriptor capacity
    pub total_pages: usize,
    /// Descriptors in use
    pub used_pages: usize,
    /// Descriptors free
    pub free_pages: usize,
    /// Faults serviced
    pub page_faults: u64,
    /// Evictions performed
    pub page_evictions: u64,
}

/// Demand pager state. The descriptor capacity is injected so the eviction
/// machinery is exercisable below `MAX_PHYSICAL_PAGES`.
pub struct Pager {
    frames: Vec<FrameDescriptor>,
    capacity: usize,
    clock: u64,
    faults: u64,
    evictions: u64,
}

impl Pager {
    /// Create a pager tracking at most `capacity` frames
    pub const fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::new(),
            capacity,
            clock: 0,
            faults: 0,
            evictions: 0,
        }
    }

    fn next_ordinal(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Service a non-present fault at `addr`.
    ///
    /// The address is aligned down to its page. A fault that races an
    /// existing mapping just refreshes the descriptor. Otherwise a frame is
    /// allocated; if the set is full, the least recently used frame is
    /// evicted and the allocation retried exactly once — a second failure
    /// propagates and is fatal to the caller.
    pub fn handle_fault(
        &mut self,
        space: &mut AddressSpace,
        pool: &mut FramePool,
        addr: VirtAddr,
    ) -> KernelResult<FaultOutcome> {
        if addr.as_u64() < USER_BASE || addr.as_u64() >= USER_STACK_TOP {
            return Err(KernelError::BadAddress);
        }

        let page = addr.align_down();
        self.faults += 1;

        let ordinal = self.next_ordinal();
        if let Some(desc) = self.frames.iter_mut().find(|d| d.vaddr == page) {
            desc.accessed = true;
            desc.last_access = ordinal;
            return Ok(FaultOutcome::Refreshed);
        }

        match self.allocate(space, pool, page) {
            Ok(()) => Ok(FaultOutcome::Allocated),
            Err(KernelError::Exhausted) => {
                self.evict_one(space);
                self.allocate(space, pool, page)?;
                Ok(FaultOutcome::AllocatedAfterEviction)
            }
            Err(e) => Err(e),
        }
    }

    /// Claim a zeroed frame for `vaddr` and map it writable+user.
    /// Fails with `Exhausted` when the descriptor set is full.
    pub fn allocate(
        &mut self,
        space: &mut AddressSpace,
        pool: &mut FramePool,
        vaddr: VirtAddr,
    ) -> KernelResult<()> {
        if self.frames.len() >= self.capacity {
            return Err(KernelError::Exhausted);
        }

        let paddr = pool.claim_zeroed();
        let last_access = self.next_ordinal();
        space.map_page(vaddr, paddr, PageFlags::USER_PAGE, pool)?;
        self.frames.push(FrameDescriptor {
            vaddr,
            paddr,
            dirty: false,
            accessed: true,
            last_access,
        });

        Ok(())
    }

    /// Evict the frame with the smallest LRU ordinal: write it back (a
    /// no-op without backing store), clear its mapping, drop its
    /// descriptor. Silently does nothing when the set is empty.
    pub fn evict_one(&mut self, space: &mut AddressSpace) {
        let Some(victim) = self
            .frames
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.last_access)
            .map(|(i, _)| i)
        else {
            return;
        };

        let desc = &mut self.frames[victim];
        if desc.dirty {
            desc.dirty = false;
        }
        let vaddr = desc.vaddr;

        space.unmap_page(vaddr);
        self.frames.swap_remove(victim);
        self.evictions += 1;

        log::trace!("evicted page {:#x}", vaddr.as_u64());
    }

    /// Record a write to a resident page
    pub fn mark_dirty(&mut self, vaddr: VirtAddr) {
        let page = vaddr.align_down();
        if let Some(desc) = self.frames.iter_mut().find(|d| d.vaddr == page) {
            desc.dirty = true;
        }
    }

    /// Descriptor backing a virtual page, if resident
    pub fn descriptor(&self, vaddr: VirtAddr) -> Option<&FrameDescriptor> {
        let page = vaddr.align_down();
        self.frames.iter().find(|d| d.vaddr == page)
    }

    /// All live descriptors
    pub fn descriptors(&self) -> &[FrameDescriptor] {
        &self.frames
    }

    /// Number of resident frames
    pub fn resident(&self) -> usize {
        self.frames.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> VmStats {
        VmStats {
            total_pages: self.capacity,
            used_pages: self.frames.len(),
            free_pages: self.capacity - self.frames.len(),
            page_faults: self.faults,
            page_evictions: self.evictions,
        }
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

    struct Fixture {
        _arena: Box<[Page]>,
        pool: FramePool,
        space: AddressSpace,
        pager: Pager,
    }

    fn setup(arena_pages: usize, capacity: usize) -> Fixture {
        let arena = vec![Page([0xEEu8; PAGE_SIZE]); arena_pages].into_boxed_slice();
        let base = arena.as_ptr() as u64;
        let mut pool = FramePool::new(base, 0);
        let pml4 = pool.claim_zeroed();
        Fixture {
            _arena: arena,
            pool,
            space: AddressSpace::new(pml4, 0),
            pager: Pager::new(capacity),
        }
    }

    fn user_page(n: u64) -> VirtAddr {
        VirtAddr::new(USER_BASE + n * PAGE_SIZE as u64)
    }

    fn descriptors_match_page_tables(fx: &Fixture) {
        // Every descriptor corresponds to a Present leaf at its frame with
        // the flags it was created with.
        for desc in fx.pager.descriptors() {
            let leaf = fx.space.leaf(desc.vaddr).expect("descriptor without leaf");
            assert_eq!(leaf.addr(), desc.paddr);
            assert_eq!(
                leaf.flags() & PageFlags::USER_PAGE,
                PageFlags::USER_PAGE
            );
        }
    }

    #[test]
    fn test_demand_fault_maps_zeroed_page() {
        let mut fx = setup(16, 8);

        // Scenario: a write to 0x500000, never mapped, faults.
        let addr = VirtAddr::new(0x50_0000);
        let outcome = fx
            .pager
            .handle_fault(&mut fx.space, &mut fx.pool, addr)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Allocated);

        let paddr = fx.space.translate(addr).unwrap();
        assert_eq!(paddr, fx.pager.descriptor(addr).unwrap().paddr);

        // The frame arrives zero-filled.
        let bytes =
            unsafe { core::slice::from_raw_parts(paddr.as_u64() as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));

        descriptors_match_page_tables(&fx);
    }

    #[test]
    fn test_repeat_fault_refreshes_descriptor() {
        let mut fx = setup(16, 8);
        let addr = user_page(3);

        fx.pager
            .handle_fault(&mut fx.space, &mut fx.pool, addr)
            .unwrap();
        let first_ordinal = fx.pager.descriptor(addr).unwrap().last_access;

        // A racing fault on the mapped page allocates nothing new.
        let outcome = fx
            .pager
            .handle_fault(&mut fx.space, &mut fx.pool, VirtAddr::new(addr.as_u64() + 0x10))
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Refreshed);
        assert_eq!(fx.pager.resident(), 1);
        assert!(fx.pager.descriptor(addr).unwrap().last_access > first_ordinal);
    }

    #[test]
    fn test_fault_outside_user_window_is_rejected() {
        let mut fx = setup(8, 4);

        for bad in [0x1000u64, USER_BASE - 1, USER_STACK_TOP, 0xFFFF_FFFF_8000_0000] {
            assert_eq!(
                fx.pager
                    .handle_fault(&mut fx.space, &mut fx.pool, VirtAddr::new(bad)),
                Err(KernelError::BadAddress)
            );
        }
        assert_eq!(fx.pager.resident(), 0);
    }

    #[test]
    fn test_lru_eviction_picks_oldest() {
        let capacity = 4;
        let mut fx = setup(32, capacity);

        for n in 0..capacity as u64 {
            fx.pager
                .handle_fault(&mut fx.space, &mut fx.pool, user_page(n))
                .unwrap();
        }

        // Page 0 has the smallest ordinal; the next fault evicts it.
        let outcome = fx
            .pager
            .handle_fault(&mut fx.space, &mut fx.pool, user_page(10))
            .unwrap();
        assert_eq!(outcome, FaultOutcome::AllocatedAfterEviction);

        assert_eq!(fx.space.translate(user_page(0)), None);
        assert!(fx.pager.descriptor(user_page(0)).is_none());
        assert!(fx.space.translate(user_page(10)).is_some());
        assert_eq!(fx.pager.resident(), capacity);
        descriptors_match_page_tables(&fx);
    }

    #[test]
    fn test_refreshed_page_survives_eviction() {
        let capacity = 4;
        let mut fx = setup(32, capacity);

        for n in 0..capacity as u64 {
            fx.pager
                .handle_fault(&mut fx.space, &mut fx.pool, user_page(n))
                .unwrap();
        }

        // Touch page 0 again; page 1 becomes the LRU victim.
        fx.pager
            .handle_fault(&mut fx.space, &mut fx.pool, user_page(0))
            .unwrap();
        fx.pager
            .handle_fault(&mut fx.space, &mut fx.pool, user_page(20))
            .unwrap();

        assert!(fx.space.translate(user_page(0)).is_some());
        assert_eq!(fx.space.translate(user_page(1)), None);
    }

    #[test]
    fn test_one_eviction_per_excess_page() {
        let capacity = 6;
        let excess = 3;
        let mut fx = setup(40, capacity);

        for n in 0..(capacity + excess) as u64 {
            fx.pager
                .handle_fault(&mut fx.space, &mut fx.pool, user_page(n))
                .unwrap();
        }

        let stats = fx.pager.stats();
        assert_eq!(stats.page_evictions, excess as u64);
        assert_eq!(stats.used_pages, capacity);
        assert_eq!(stats.free_pages, 0);
        assert_eq!(stats.page_faults, (capacity + excess) as u64);
        descriptors_match_page_tables(&fx);
    }

    #[test]
    fn test_mark_dirty_and_writeback_on_evict() {
        let mut fx = setup(16, 2);
        let addr = user_page(0);

        fx.pager
            .handle_fault(&mut fx.space, &mut fx.pool, addr)
            .unwrap();
        fx.pager.mark_dirty(VirtAddr::new(addr.as_u64() + 0x80));
        assert!(fx.pager.descriptor(addr).unwrap().dirty);

        // Eviction "writes back" by clearing the flag, then drops the page.
        fx.pager.evict_one(&mut fx.space);
        assert!(fx.pager.descriptor(addr).is_none());
        assert_eq!(fx.space.translate(addr), None);
    }

    #[test]
    fn test_evict_on_empty_set_is_silent() {
        let mut fx = setup(8, 2);
        fx.pager.evict_one(&mut fx.space);
        assert_eq!(fx.pager.stats().page_evictions, 0);
    }
}
