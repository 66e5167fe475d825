//! Shared helpers for unit tests: a buffer-backed "physical RAM" with a
//! mapper, playing the role hardware direct-mapped memory plays at runtime.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};

use purevisor_hal::arch::x86_64::vmcs::{VmcsAccess, VmcsError, VmcsField};
use purevisor_hal::memory::{MemoryRegion, MemoryType, PhysMapper, PhysicalAddress, PAGE_SIZE};

use crate::pmm::PhysicalMemoryManager;

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
        assert!((pa as usize) < self.size, "phys {:#x} outside test RAM", pa);
        unsafe { self.base.add(pa as usize) }
    }

    fn virt_to_phys(&self, va: *const u8) -> PhysicalAddress {
        (va as usize - self.base as usize) as u64
    }
}

/// Map-backed VMCS standing in for hardware in hosted tests.
#[derive(Default)]
pub struct MockVmcs(pub alloc::collections::BTreeMap<VmcsField, u64>);

impl VmcsAccess for MockVmcs {
    fn read(&self, field: VmcsField) -> Result<u64, VmcsError> {
        Ok(self.0.get(&field).copied().unwrap_or(0))
    }

    fn write(&mut self, field: VmcsField, value: u64) -> Result<(), VmcsError> {
        self.0.insert(field, value);
        Ok(())
    }
}

