//! Memory primitives shared by every subsystem.
//!
//! Physical/virtual address aliases, the firmware memory map, and the two
//! capability traits the memory managers are built against:
//!
//! * [`PhysMapper`] converts a physical address into a dereferenceable
//!   pointer. On hardware this is the higher-half direct map at
//!   [`KERNEL_OFFSET`]; hosted tests back it with a plain buffer.
//! * [`FrameSource`] hands out zeroed 4 KiB frames for page tables. The
//!   physical memory manager implements it; tests use a bump arena.

use bitflags::bitflags;

/// Physical address.
pub type PhysicalAddress = u64;

/// Virtual address.
pub type VirtualAddress = u64;

/// Base page size.
pub const PAGE_SIZE: usize = 4096;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Higher-half offset of the kernel direct map: physical `p` is mapped at
/// virtual `p + KERNEL_OFFSET`.
pub const KERNEL_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Classification of a firmware memory-map region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Available,
    Reserved,
    AcpiReclaimable,
    Nvs,
    BadRam,
}

impl MemoryType {
    /// Map a boot-protocol region type code (1 = available, 3 = ACPI, 4 =
    /// NVS, 5 = bad) onto the enum; everything else is reserved.
    pub fn from_tag_type(raw: u32) -> Self {
        match raw {
            1 => MemoryType::Available,
            3 => MemoryType::AcpiReclaimable,
            4 => MemoryType::Nvs,
            5 => MemoryType::BadRam,
            _ => MemoryType::Reserved,
        }
    }
}

/// One region of the physical memory map handed over at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub size: u64,
    pub region_type: MemoryType,
}

impl MemoryRegion {
    pub fn end(&self) -> PhysicalAddress {
        self.start + self.size
    }

    pub fn is_available(&self) -> bool {
        self.region_type == MemoryType::Available
    }
}

bitflags! {
    /// Generic access flags used when describing mappings to the HAL.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER    = 1 << 3;
        const NOCACHE = 1 << 4;
    }
}

/// Translation between physical addresses and dereferenceable pointers.
///
/// Every structure the hypervisor edits in place (page descriptors, page
/// tables, heap blocks, guest frames) lives in physical memory and is
/// reached through this trait.
pub trait PhysMapper {
    /// Pointer through which `pa` can be read and written.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> *mut u8;

    /// Inverse of [`PhysMapper::phys_to_virt`].
    fn virt_to_phys(&self, va: *const u8) -> PhysicalAddress;
}

/// The production mapper: the boot code establishes a direct map of all
/// physical memory at [`KERNEL_OFFSET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMapper;

impl PhysMapper for DirectMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> *mut u8 {
        (pa + KERNEL_OFFSET) as *mut u8
    }

    #[inline]
    fn virt_to_phys(&self, va: *const u8) -> PhysicalAddress {
        va as u64 - KERNEL_OFFSET
    }
}

/// Provider of 4 KiB frames for page-table construction.
///
/// Paging and EPT allocate intermediate tables on demand through this trait
/// rather than through a global allocator, so ownership of every frame stays
/// explicit.
pub trait FrameSource {
    /// Allocate one zeroed, page-aligned frame.
    fn alloc_frame(&self) -> Option<PhysicalAddress>;

    /// Return a frame previously obtained from [`FrameSource::alloc_frame`].
    fn free_frame(&self, pa: PhysicalAddress);

    /// Pointer to the frame contents, viewed as a 512-entry table.
    fn table_ptr(&self, pa: PhysicalAddress) -> *mut u64;
}
