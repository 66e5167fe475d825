//! Kernel heap: best-fit allocation over PMM pages.
//!
//! Free blocks form an address-ordered doubly-linked list; every block
//! carries a header with a magic word, its total size and a free bit.
//! Freeing merges the block with address-adjacent free neighbors, so two
//! adjacent free blocks never coexist. Payloads are 16-byte aligned.
//!
//! The allocator is interrupt-unsafe unless called with interrupts
//! disabled; a single lock serializes all mutation.

use core::ptr::NonNull;

use purevisor_hal::memory::{PhysMapper, PAGE_SIZE};
use spin::Mutex;

use crate::pmm::{PhysicalMemoryManager, PmmError, MAX_ORDER};
use crate::{log, log_error};

pub const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const MIN_PAYLOAD: usize = 16;
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD;
/// Heap growth floor: never ask the PMM for fewer than 4 pages.
const GROW_MIN_PAGES: usize = 4;

bitflags::bitflags! {
    /// `kmalloc` request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the payload before returning.
        const ZERO   = 1 << 0;
        /// Caller cannot sleep (no effect here; there is no sleeping).
        const ATOMIC = 1 << 1;
        /// Back the allocation with DMA-zone pages.
        const DMA    = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory,
    /// Header magic mismatch on free
    BadMagic,
    /// Block already free
    DoubleFree,
    /// Slab cache still has live objects
    CacheBusy,
}

#[repr(C)]
struct BlockHeader {
    magic: u32,
    size: u32,
    flags: u32,
    reserved: u32,
    next: usize,
    prev: usize,
}

const BLOCK_FREE: u32 = 1 << 0;

static_assertions::const_assert_eq!(HEADER_SIZE % 16, 0);

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub total_allocated: u64,
    pub total_freed: u64,
    pub current_usage: u64,
    pub peak_usage: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub double_free_count: u64,
}

struct HeapInner {
    /// Address of the first free block, 0 when empty.
    free_head: usize,
    stats: HeapStats,
}

// Addresses in the free list are only dereferenced under the heap lock.
unsafe impl Send for HeapInner {}

impl HeapInner {
    #[inline]
    fn header(&self, addr: usize) -> &mut BlockHeader {
        unsafe { &mut *(addr as *mut BlockHeader) }
    }

    /// Insert a block into the address-ordered free list.
    fn free_list_add(&mut self, addr: usize) {
        self.header(addr).flags |= BLOCK_FREE;

        if self.free_head == 0 || addr < self.free_head {
            self.header(addr).next = self.free_head;
            self.header(addr).prev = 0;
            if self.free_head != 0 {
                self.header(self.free_head).prev = addr;
            }
            self.free_head = addr;
            return;
        }

        let mut curr = self.free_head;
        while self.header(curr).next != 0 && self.header(curr).next < addr {
            curr = self.header(curr).next;
        }
        let next = self.header(curr).next;
        self.header(addr).next = next;
        self.header(addr).prev = curr;
        if next != 0 {
            self.header(next).prev = addr;
        }
        self.header(curr).next = addr;
    }

    fn free_list_remove(&mut self, addr: usize) {
        let (next, prev) = {
            let h = self.header(addr);
            (h.next, h.prev)
        };
        if prev != 0 {
            self.header(prev).next = next;
        } else {
            self.free_head = next;
        }
        if next != 0 {
            self.header(next).prev = prev;
        }
        let h = self.header(addr);
        h.next = 0;
        h.prev = 0;
        h.flags &= !BLOCK_FREE;
    }

    /// Merge `addr` with its address-adjacent free neighbors. The list is
    /// address-ordered, so only the direct list neighbors can be adjacent.
    fn coalesce(&mut self, addr: usize) {
        let next = self.header(addr).next;
        if next != 0 && addr + self.header(addr).size as usize == next {
            let next_next = self.header(next).next;
            self.header(addr).size += self.header(next).size;
            self.header(addr).next = next_next;
            if next_next != 0 {
                self.header(next_next).prev = addr;
            }
        }

        let prev = self.header(addr).prev;
        if prev != 0 && prev + self.header(prev).size as usize == addr {
            let next = self.header(addr).next;
            self.header(prev).size += self.header(addr).size;
            self.header(prev).next = next;
            if next != 0 {
                self.header(next).prev = prev;
            }
        }
    }

    /// Best-fit search over the free list.
    fn find_free(&mut self, size: usize) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut curr = self.free_head;
        while curr != 0 {
            let bsize = self.header(curr).size as usize;
            if bsize >= size && best.map(|b| bsize < self.header(b).size as usize).unwrap_or(true)
            {
                best = Some(curr);
                if bsize == size {
                    break;
                }
            }
            curr = self.header(curr).next;
        }
        best
    }

    /// Cut `size` bytes off the front of `addr`, returning the tail to the
    /// free list when it is still a viable block.
    fn split(&mut self, addr: usize, size: usize) {
        let remaining = self.header(addr).size as usize - size;
        if remaining < MIN_BLOCK_SIZE {
            return;
        }
        let tail = addr + size;
        {
            let h = self.header(tail);
            h.magic = HEAP_MAGIC;
            h.size = remaining as u32;
            h.flags = 0;
            h.next = 0;
            h.prev = 0;
        }
        self.header(addr).size = size as u32;
        self.free_list_add(tail);
    }
}

/// The kernel heap. Pages come from the PMM and become heap property until
/// the heap itself is torn down.
pub struct KernelHeap<'p, M: PhysMapper> {
    pmm: &'p PhysicalMemoryManager<M>,
    inner: Mutex<HeapInner>,
}

impl<'p, M: PhysMapper> KernelHeap<'p, M> {
    /// Create the heap with an initial 16-page arena.
    pub fn new(pmm: &'p PhysicalMemoryManager<M>) -> Result<Self, HeapError> {
        let heap = KernelHeap {
            pmm,
            inner: Mutex::new(HeapInner {
                free_head: 0,
                stats: HeapStats::default(),
            }),
        };
        {
            let mut inner = heap.inner.lock();
            heap.grow(&mut inner, 16 * PAGE_SIZE, AllocFlags::empty())
                .map_err(|_| HeapError::OutOfMemory)?;
        }
        log!("heap: {} KiB initial arena", 16 * PAGE_SIZE / 1024);
        Ok(heap)
    }

    /// Pull at least `bytes` (and at least 4 pages) from the PMM and add
    /// the run as one free block.
    fn grow(
        &self,
        inner: &mut HeapInner,
        bytes: usize,
        flags: AllocFlags,
    ) -> Result<(), PmmError> {
        let pages = bytes.div_ceil(PAGE_SIZE).max(GROW_MIN_PAGES);
        let order = (usize::BITS - (pages - 1).leading_zeros()).min(MAX_ORDER);
        let phys = if flags.contains(AllocFlags::DMA) {
            self.pmm.alloc_pages_dma(order)?
        } else {
            self.pmm.alloc_pages(order)?
        };
        let block = self.pmm.mapper().phys_to_virt(phys) as usize;
        let block_size = (PAGE_SIZE << order) as u32;
        {
            let h = inner.header(block);
            h.magic = HEAP_MAGIC;
            h.size = block_size;
            h.flags = 0;
            h.next = 0;
            h.prev = 0;
        }
        inner.free_list_add(block);
        Ok(())
    }

    /// Allocate `size` bytes. Payloads are 16-byte aligned; `None` on
    /// exhaustion.
    pub fn kmalloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let needed = size.next_multiple_of(16) + HEADER_SIZE;
        let needed = needed.max(MIN_BLOCK_SIZE);
        if needed > (PAGE_SIZE << MAX_ORDER) {
            return None;
        }

        let mut inner = self.inner.lock();
        let block = match inner.find_free(needed) {
            Some(b) => b,
            None => {
                self.grow(&mut inner, needed, flags).ok()?;
                inner.find_free(needed)?
            }
        };

        inner.free_list_remove(block);
        inner.split(block, needed);

        let block_size = inner.header(block).size as u64;
        inner.stats.alloc_count += 1;
        inner.stats.total_allocated += block_size;
        inner.stats.current_usage += block_size;
        if inner.stats.current_usage > inner.stats.peak_usage {
            inner.stats.peak_usage = inner.stats.current_usage;
        }
        drop(inner);

        let payload = (block + HEADER_SIZE) as *mut u8;
        if flags.contains(AllocFlags::ZERO) {
            unsafe { core::ptr::write_bytes(payload, 0, needed - HEADER_SIZE) };
        }
        NonNull::new(payload)
    }

    /// Free a pointer returned by `kmalloc`. Bad magic and double frees are
    /// detected, logged and ignored.
    pub fn kfree(&self, ptr: NonNull<u8>) {
        let block = ptr.as_ptr() as usize - HEADER_SIZE;
        let mut inner = self.inner.lock();
        let (magic, flags, size) = {
            let h = inner.header(block);
            (h.magic, h.flags, h.size as u64)
        };
        if magic != HEAP_MAGIC {
            log_error!("heap: invalid free at {:p}", ptr.as_ptr());
            return;
        }
        if flags & BLOCK_FREE != 0 {
            inner.stats.double_free_count += 1;
            log_error!("heap: double free at {:p}", ptr.as_ptr());
            return;
        }
        inner.stats.free_count += 1;
        inner.stats.total_freed += size;
        inner.stats.current_usage -= size;
        inner.free_list_add(block);
        inner.coalesce(block);
    }

    /// Resize an allocation, copying the payload on relocation.
    pub fn krealloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.kmalloc(size, flags);
        };
        if size == 0 {
            self.kfree(ptr);
            return None;
        }
        let block = ptr.as_ptr() as usize - HEADER_SIZE;
        let old_payload = {
            let inner = self.inner.lock();
            inner.header(block).size as usize - HEADER_SIZE
        };
        if size <= old_payload {
            return Some(ptr);
        }
        let new_ptr = self.kmalloc(size, flags)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_payload);
        }
        self.kfree(ptr);
        Some(new_ptr)
    }

    /// `count * size` zeroed bytes.
    pub fn kcalloc(&self, count: usize, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        self.kmalloc(total, flags | AllocFlags::ZERO)
    }

    /// Duplicate a string into the heap, NUL-terminated.
    pub fn kstrdup(&self, s: &str, flags: AllocFlags) -> Option<NonNull<u8>> {
        let dup = self.kmalloc(s.len() + 1, flags)?;
        unsafe {
            core::ptr::copy_nonoverlapping(s.as_ptr(), dup.as_ptr(), s.len());
            dup.as_ptr().add(s.len()).write(0);
        }
        Some(dup)
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats
    }
}

/// Fixed-size object cache layered on the heap.
pub struct SlabCache {
    name: heapless::String<32>,
    obj_size: usize,
    alloc_count: u64,
    free_count: u64,
    live: usize,
}

impl SlabCache {
    pub fn new(name: &str, size: usize) -> Self {
        let mut n = heapless::String::new();
        let _ = n.push_str(name);
        SlabCache {
            name: n,
            obj_size: size.next_multiple_of(8),
            alloc_count: 0,
            free_count: 0,
            live: 0,
        }
    }

    pub fn alloc<M: PhysMapper>(
        &mut self,
        heap: &KernelHeap<'_, M>,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        let ptr = heap.kmalloc(self.obj_size, flags)?;
        self.alloc_count += 1;
        self.live += 1;
        Some(ptr)
    }

    pub fn free<M: PhysMapper>(&mut self, heap: &KernelHeap<'_, M>, ptr: NonNull<u8>) {
        heap.kfree(ptr);
        self.free_count += 1;
        self.live = self.live.saturating_sub(1);
    }

    /// Destroying a cache with live objects is refused; the caller must
    /// free them first.
    pub fn destroy(self) -> Result<(), HeapError> {
        if self.live > 0 {
            log_error!("slab '{}': destroy with {} live objects", self.name, self.live);
            return Err(HeapError::CacheBusy);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
