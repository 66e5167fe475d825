//! Physical memory manager: a buddy allocator over all host RAM.
//!
//! Pages are tracked by an array of descriptors indexed by page-frame
//! number, placed in physical memory right behind the reserved kernel
//! image. Three zones (DMA below 16 MiB, NORMAL below 4 GiB, HIGH above)
//! each carry one free list per order 0..=11; blocks split on allocation
//! and re-merge with their buddy (`pfn ^ (1 << order)`) on free, the
//! lower-addressed block becoming the parent. Free-list links are PFN
//! indices, so descriptors never hold pointers.
//!
//! All mutation is serialized by a single lock; allocation failure is an
//! `Err`, double free is a detected no-op.

use bitflags::bitflags;
use purevisor_hal::memory::{
    FrameSource, MemoryRegion, PhysMapper, PhysicalAddress, PAGE_SHIFT, PAGE_SIZE,
};
use spin::Mutex;

use crate::{log, log_warn};

/// Largest block: 2^11 pages = 8 MiB.
pub const MAX_ORDER: u32 = 11;

const ORDER_COUNT: usize = MAX_ORDER as usize + 1;
const NO_PFN: u32 = u32::MAX;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 1 << 0;
        const FREE     = 1 << 1;
        const KERNEL   = 1 << 2;
        const USER     = 1 << 3;
        const RESERVED = 1 << 4;
        const DMA      = 1 << 5;
    }
}

/// Per-page descriptor. One per frame of RAM, indexed by PFN.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageDescriptor {
    pub flags: PageFlags,
    pub order: u32,
    pub refcount: u32,
    next: u32,
    prev: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No zone can satisfy the request
    OutOfMemory,
    /// Order outside 0..=11
    InvalidOrder,
    /// Address outside the tracked range
    InvalidAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneKind {
    Dma = 0,
    Normal = 1,
    High = 2,
}

#[derive(Debug, Clone, Copy, Default)]
struct FreeList {
    head: u32,
    count: u64,
}

struct Zone {
    start: PhysicalAddress,
    end: PhysicalAddress,
    free_pages: u64,
    free_lists: [FreeList; ORDER_COUNT],
}

impl Zone {
    fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Zone {
            start,
            end,
            free_pages: 0,
            free_lists: [FreeList {
                head: NO_PFN,
                count: 0,
            }; ORDER_COUNT],
        }
    }

    fn contains(&self, addr: PhysicalAddress) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Allocation statistics, mirrored by `stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PmmStats {
    pub total_memory: u64,
    pub free_memory: u64,
    pub used_memory: u64,
    pub reserved_memory: u64,
    pub page_count: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub double_free_count: u64,
}

/// Raw pointer to the descriptor array; lives behind the PMM lock.
struct DescriptorTable(*mut PageDescriptor);

// The table is only touched under the PMM mutex.
unsafe impl Send for DescriptorTable {}

struct PmmInner {
    zones: [Zone; 3],
    pages: DescriptorTable,
    page_count: u64,
    stats: PmmStats,
}

impl PmmInner {
    #[inline]
    fn page(&self, pfn: u64) -> &mut PageDescriptor {
        debug_assert!(pfn < self.page_count);
        unsafe { &mut *self.pages.0.add(pfn as usize) }
    }

    fn zone_index(&self, addr: PhysicalAddress) -> usize {
        if addr < 16 * MIB {
            ZoneKind::Dma as usize
        } else if addr < 4 * GIB {
            ZoneKind::Normal as usize
        } else {
            ZoneKind::High as usize
        }
    }

    fn free_list_add(&mut self, zone_idx: usize, pfn: u64, order: u32) {
        let head = self.zones[zone_idx].free_lists[order as usize].head;
        {
            let page = self.page(pfn);
            page.flags = PageFlags::FREE;
            page.order = order;
            page.refcount = 0;
            page.next = head;
            page.prev = NO_PFN;
        }
        if head != NO_PFN {
            self.page(head as u64).prev = pfn as u32;
        }
        let list = &mut self.zones[zone_idx].free_lists[order as usize];
        list.head = pfn as u32;
        list.count += 1;
        self.zones[zone_idx].free_pages += 1 << order;
    }

    fn free_list_remove(&mut self, zone_idx: usize, pfn: u64, order: u32) {
        let (next, prev) = {
            let page = self.page(pfn);
            (page.next, page.prev)
        };
        if prev != NO_PFN {
            self.page(prev as u64).next = next;
        } else {
            self.zones[zone_idx].free_lists[order as usize].head = next;
        }
        if next != NO_PFN {
            self.page(next as u64).prev = prev;
        }
        {
            let page = self.page(pfn);
            page.next = NO_PFN;
            page.prev = NO_PFN;
        }
        self.zones[zone_idx].free_lists[order as usize].count -= 1;
        self.zones[zone_idx].free_pages -= 1 << order;
    }

    fn buddy_of(&self, pfn: u64, order: u32) -> Option<u64> {
        let buddy = pfn ^ (1u64 << order);
        if buddy >= self.page_count {
            return None;
        }
        Some(buddy)
    }

    /// Split `pfn` (currently of order `cur`) down to `target`, returning
    /// the upper halves to their lists.
    fn split_block(&mut self, zone_idx: usize, pfn: u64, cur: u32, target: u32) {
        let mut order = cur;
        while order > target {
            order -= 1;
            let buddy = pfn + (1u64 << order);
            self.free_list_add(zone_idx, buddy, order);
        }
    }

    /// Merge `pfn` upward while its buddy is free at the same order, then
    /// insert the resulting block.
    fn coalesce_and_insert(&mut self, zone_idx: usize, mut pfn: u64, mut order: u32) {
        while order < MAX_ORDER {
            let Some(buddy) = self.buddy_of(pfn, order) else {
                break;
            };
            let mergeable = {
                let b = self.page(buddy);
                b.flags.contains(PageFlags::FREE) && b.order == order
            };
            if !mergeable {
                break;
            }
            self.free_list_remove(zone_idx, buddy, order);
            if buddy < pfn {
                pfn = buddy;
            }
            order += 1;
        }
        self.free_list_add(zone_idx, pfn, order);
    }

    fn alloc_from_zone(&mut self, zone_idx: usize, order: u32) -> Option<PhysicalAddress> {
        for o in order..=MAX_ORDER {
            let head = self.zones[zone_idx].free_lists[o as usize].head;
            if head == NO_PFN {
                continue;
            }
            let pfn = head as u64;
            self.free_list_remove(zone_idx, pfn, o);
            if o > order {
                self.split_block(zone_idx, pfn, o, order);
            }
            {
                let page = self.page(pfn);
                page.flags = PageFlags::PRESENT | PageFlags::KERNEL;
                page.order = order;
                page.refcount = 1;
            }
            self.stats.alloc_count += 1;
            self.stats.free_memory -= (1u64 << order) * PAGE_SIZE as u64;
            self.stats.used_memory += (1u64 << order) * PAGE_SIZE as u64;
            return Some(pfn << PAGE_SHIFT);
        }
        None
    }

    fn free_block(&mut self, addr: PhysicalAddress, order: u32) {
        let pfn = addr >> PAGE_SHIFT;
        if self.page(pfn).flags.contains(PageFlags::FREE) {
            self.stats.double_free_count += 1;
            log_warn!("pmm: double free of {:#x} (order {})", addr, order);
            return;
        }
        let zone_idx = self.zone_index(addr);
        self.stats.free_count += 1;
        self.stats.free_memory += (1u64 << order) * PAGE_SIZE as u64;
        self.stats.used_memory -= (1u64 << order) * PAGE_SIZE as u64;
        self.coalesce_and_insert(zone_idx, pfn, order);
    }
}

/// The physical memory manager. Owns every frame of RAM; other subsystems
/// receive frames only through `alloc_pages`/`free_pages`.
pub struct PhysicalMemoryManager<M: PhysMapper> {
    mapper: M,
    inner: Mutex<PmmInner>,
}

impl<M: PhysMapper> PhysicalMemoryManager<M> {
    /// Build the manager from the boot memory map.
    ///
    /// `reserved_end` is the first physical address past the kernel image;
    /// the descriptor array is placed there and everything below it stays
    /// reserved. Every available page is inserted through the coalescing
    /// path, so the free lists start fully merged.
    pub fn new(mapper: M, memory_map: &[MemoryRegion], reserved_end: PhysicalAddress) -> Self {
        let mut stats = PmmStats::default();
        let mut highest: PhysicalAddress = 0;
        for region in memory_map {
            if region.end() > highest {
                highest = region.end();
            }
            stats.total_memory += region.size;
            if !region.is_available() {
                stats.reserved_memory += region.size;
            }
        }

        let page_count = highest.div_ceil(PAGE_SIZE as u64);
        stats.page_count = page_count;

        let array_bytes = (page_count as usize * core::mem::size_of::<PageDescriptor>())
            .next_multiple_of(PAGE_SIZE);
        let array_phys = reserved_end.next_multiple_of(PAGE_SIZE as u64);
        let pages = mapper.phys_to_virt(array_phys) as *mut PageDescriptor;

        for i in 0..page_count as usize {
            unsafe {
                pages.add(i).write(PageDescriptor {
                    flags: PageFlags::RESERVED,
                    order: 0,
                    refcount: 0,
                    next: NO_PFN,
                    prev: NO_PFN,
                });
            }
        }

        let reserved_top = array_phys + array_bytes as u64;
        let mut inner = PmmInner {
            zones: [
                Zone::new(0, 16 * MIB),
                Zone::new(16 * MIB, 4 * GIB),
                Zone::new(4 * GIB, u64::MAX),
            ],
            pages: DescriptorTable(pages),
            page_count,
            stats,
        };

        let mut available_pages = 0u64;
        for region in memory_map.iter().filter(|r| r.is_available()) {
            let mut start = region.start.next_multiple_of(PAGE_SIZE as u64);
            let end = region.end() & !(PAGE_SIZE as u64 - 1);
            if start < reserved_top {
                start = reserved_top;
            }
            while start < end {
                let pfn = start >> PAGE_SHIFT;
                if pfn < page_count {
                    let zone_idx = inner.zone_index(start);
                    // Stay within the zone: a block never spans a boundary
                    // because zone edges are MAX_ORDER aligned.
                    debug_assert!(inner.zones[zone_idx].contains(start));
                    inner.coalesce_and_insert(zone_idx, pfn, 0);
                    available_pages += 1;
                }
                start += PAGE_SIZE as u64;
            }
        }

        inner.stats.free_memory = available_pages * PAGE_SIZE as u64;
        inner.stats.used_memory = inner
            .stats
            .total_memory
            .saturating_sub(inner.stats.free_memory + inner.stats.reserved_memory);

        log!(
            "pmm: {} pages available ({} MiB), descriptors at {:#x}",
            available_pages,
            available_pages * PAGE_SIZE as u64 / MIB,
            array_phys
        );

        PhysicalMemoryManager {
            mapper,
            inner: Mutex::new(inner),
        }
    }

    /// Allocate a naturally aligned run of `1 << order` pages from the
    /// NORMAL zone, falling back to DMA on exhaustion.
    pub fn alloc_pages(&self, order: u32) -> Result<PhysicalAddress, PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidOrder);
        }
        let mut inner = self.inner.lock();
        for zone_idx in [ZoneKind::Normal as usize, ZoneKind::Dma as usize] {
            if let Some(addr) = inner.alloc_from_zone(zone_idx, order) {
                return Ok(addr);
            }
        }
        Err(PmmError::OutOfMemory)
    }

    /// Allocate from the DMA zone only.
    pub fn alloc_pages_dma(&self, order: u32) -> Result<PhysicalAddress, PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidOrder);
        }
        self.inner
            .lock()
            .alloc_from_zone(ZoneKind::Dma as usize, order)
            .ok_or(PmmError::OutOfMemory)
    }

    /// Allocate a single page.
    pub fn alloc_page(&self) -> Result<PhysicalAddress, PmmError> {
        self.alloc_pages(0)
    }

    /// Return pages obtained from `alloc_pages` at the same order.
    /// Out-of-range or doubled frees are logged and ignored.
    pub fn free_pages(&self, addr: PhysicalAddress, order: u32) {
        if addr == 0 || order > MAX_ORDER {
            log_warn!("pmm: bogus free of {:#x} order {}", addr, order);
            return;
        }
        let mut inner = self.inner.lock();
        if (addr >> PAGE_SHIFT) >= inner.page_count {
            log_warn!("pmm: out-of-range free of {:#x}", addr);
            return;
        }
        inner.free_block(addr, order);
    }

    /// Free a single page.
    pub fn free_page(&self, addr: PhysicalAddress) {
        self.free_pages(addr, 0)
    }

    /// Snapshot of the descriptor for `addr`.
    pub fn get_page(&self, addr: PhysicalAddress) -> Option<PageDescriptor> {
        let inner = self.inner.lock();
        let pfn = addr >> PAGE_SHIFT;
        if pfn >= inner.page_count {
            return None;
        }
        Some(*inner.page(pfn))
    }

    pub fn total_pages(&self) -> u64 {
        self.inner.lock().page_count
    }

    /// Currently free pages across all zones.
    pub fn free_page_count(&self) -> u64 {
        let inner = self.inner.lock();
        inner.zones.iter().map(|z| z.free_pages).sum()
    }

    pub fn stats(&self) -> PmmStats {
        self.inner.lock().stats
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Count of free blocks at `order` in the NORMAL zone (diagnostics).
    pub fn free_blocks_at(&self, order: u32) -> u64 {
        let inner = self.inner.lock();
        inner.zones[ZoneKind::Normal as usize].free_lists[order as usize].count
    }
}

impl<M: PhysMapper> FrameSource for PhysicalMemoryManager<M> {
    fn alloc_frame(&self) -> Option<PhysicalAddress> {
        let pa = self.alloc_pages(0).ok()?;
        unsafe { core::ptr::write_bytes(self.mapper.phys_to_virt(pa), 0, PAGE_SIZE) };
        Some(pa)
    }

    fn free_frame(&self, pa: PhysicalAddress) {
        self.free_pages(pa, 0);
    }

    fn table_ptr(&self, pa: PhysicalAddress) -> *mut u64 {
        self.mapper.phys_to_virt(pa) as *mut u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestRam;

    #[test]
    fn round_trip_preserves_free_count() {
        let ram = TestRam::new(32 * MIB as usize);
        let pmm = ram.pmm();
        let initial = pmm.free_page_count();
        for order in 0..=MAX_ORDER {
            let addr = pmm.alloc_pages(order).unwrap();
            assert_eq!(addr % ((PAGE_SIZE as u64) << order), 0, "order {}", order);
            pmm.free_pages(addr, order);
            assert_eq!(pmm.free_page_count(), initial, "order {}", order);
        }
    }

    #[test]
    fn double_free_is_detected() {
        let ram = TestRam::new(8 * MIB as usize);
        let pmm = ram.pmm();
        let addr = pmm.alloc_pages(0).unwrap();
        pmm.free_pages(addr, 0);
        let free_after = pmm.free_page_count();
        pmm.free_pages(addr, 0);
        assert_eq!(pmm.free_page_count(), free_after);
        assert_eq!(pmm.stats().double_free_count, 1);
    }

    #[test]
    fn normal_zone_preferred_then_dma() {
        let ram = TestRam::new(24 * MIB as usize);
        let pmm = ram.pmm();
        // First allocation must land at or above the 16 MiB zone split.
        let addr = pmm.alloc_pages(0).unwrap();
        assert!(addr >= 16 * MIB);
        // Exhaust NORMAL, then allocations fall back to DMA.
        while pmm
            .alloc_pages(0)
            .map(|a| a >= 16 * MIB)
            .unwrap_or(false)
        {}
        let dma = pmm.alloc_pages(0).unwrap();
        assert!(dma < 16 * MIB);
    }
}
