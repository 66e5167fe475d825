//! Shared helpers for the integration suites: buffer-backed "physical
//! RAM" with a mapper, a bump frame arena for page-table walkers, and a
//! map-backed VMCS, standing in for the hardware the core drives at
//! runtime.

#![allow(dead_code)]

extern crate std;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::collections::BTreeMap;

use purevisor_core::pmm::PhysicalMemoryManager;
use purevisor_hal::arch::x86_64::vmcs::{VmcsAccess, VmcsError, VmcsField};
use purevisor_hal::memory::{
    FrameSource, MemoryRegion, MemoryType, PhysMapper, PhysicalAddress, PAGE_SIZE,
};

/// Simulated physical memory: addresses 0..size map into one host buffer.
pub struct TestRam {
    base: *mut u8,
    size: usize,
}

impl TestRam {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        TestRam { base, size }
    }

    pub fn mapper(&self) -> RamMapper {
        RamMapper {
            base: self.base,
            size: self.size,
        }
    }

    pub fn regions(&self) -> [MemoryRegion; 1] {
        [MemoryRegion {
            start: 0,
            size: self.size as u64,
            region_type: MemoryType::Available,
        }]
    }

    /// A PMM owning this RAM, with the first page reserved so physical
    /// address zero is never handed out.
    pub fn pmm(&self) -> PhysicalMemoryManager<RamMapper> {
        PhysicalMemoryManager::new(self.mapper(), &self.regions(), PAGE_SIZE as u64)
    }
}

impl Drop for TestRam {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
        unsafe { dealloc(self.base, layout) };
    }
}

#[derive(Clone, Copy)]
pub struct RamMapper {
    base: *mut u8,
    size: usize,
}

impl PhysMapper for RamMapper {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!((pa as usize) < self.size, "phys {pa:#x} outside test RAM");
        unsafe { self.base.add(pa as usize) }
    }

    fn virt_to_phys(&self, va: *const u8) -> PhysicalAddress {
        (va as usize - self.base as usize) as u64
    }
}

/// Bump frame arena for walker tests that do not need a full PMM.
pub struct TestFrames {
    ram: TestRam,
    next: Cell<u64>,
    freed: Cell<u64>,
}

impl TestFrames {
    pub fn new(size: usize) -> Self {
        TestFrames {
            ram: TestRam::new(size),
            next: Cell::new(PAGE_SIZE as u64),
            freed: Cell::new(0),
        }
    }

    pub fn allocated_frames(&self) -> u64 {
        (self.next.get() / PAGE_SIZE as u64) - 1
    }

    pub fn freed_frames(&self) -> u64 {
        self.freed.get()
    }
}

impl FrameSource for TestFrames {
    fn alloc_frame(&self) -> Option<PhysicalAddress> {
        let pa = self.next.get();
        if pa as usize + PAGE_SIZE > self.ram.size {
            return None;
        }
        self.next.set(pa + PAGE_SIZE as u64);
        Some(pa)
    }

    fn free_frame(&self, _pa: PhysicalAddress) {
        self.freed.set(self.freed.get() + 1);
    }

    fn table_ptr(&self, pa: PhysicalAddress) -> *mut u64 {
        self.ram.mapper().phys_to_virt(pa) as *mut u64
    }
}

/// Map-backed VMCS.
#[derive(Default)]
pub struct MockVmcs(pub BTreeMap<VmcsField, u64>);

impl VmcsAccess for MockVmcs {
    fn read(&self, field: VmcsField) -> Result<u64, VmcsError> {
        Ok(self.0.get(&field).copied().unwrap_or(0))
    }

    fn write(&mut self, field: VmcsField, value: u64) -> Result<(), VmcsError> {
        self.0.insert(field, value);
        Ok(())
    }
}
