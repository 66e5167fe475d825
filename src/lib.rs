#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! PureVisor: a bare-metal Type-1 hypervisor and HCI engine for x86_64.
//!
//! This crate is the façade over the two workspace members:
//! [`purevisor_hal`] talks to the machine (boot handoff, CPU state, VMX,
//! VMCS, EPT, host paging) and [`purevisor_core`] is the engine (physical
//! and heap memory managers, the VMX run loop and exit dispatcher, pooled
//! extent storage with Raft replication, cluster membership and the
//! placement scheduler).
//!
//! Bring-up order on hardware: parse the boot handoff, stand up the PMM
//! over the memory map, layer the heap on it, read the VMX capabilities,
//! then let the node-level services (pool, cluster, scheduler, VM manager)
//! build on top.

extern crate alloc;

pub use purevisor_core;
pub use purevisor_hal;

pub use purevisor_core::{
    block, cluster, distributed, heap, memblk, pmm, pool, raft, scheduler, sync, vcpu, vm,
    vm_manager, vmexit, PurevisorError,
};
pub use purevisor_hal::boot::{BootInfo, BOOT_MAGIC};

use purevisor_hal::arch::x86_64::vmx::VmxCapabilities;
use purevisor_hal::memory::{DirectMapper, MemoryRegion, PhysicalAddress};

/// Host-global state produced by early bring-up.
pub struct Host {
    pub boot_info: BootInfo,
    pub pmm: purevisor_core::pmm::PhysicalMemoryManager<DirectMapper>,
    pub vmx_caps: VmxCapabilities,
}

/// Early bring-up: boot-info parsing, PMM construction over the handed-over
/// memory map, and VMX capability discovery.
///
/// # Safety
/// `boot_block` must cover the loader's tagged info block, and
/// `kernel_end` must be the first physical address past the kernel image.
/// Must run once, on the bootstrap CPU, with the direct map established.
pub unsafe fn bring_up(
    magic: u32,
    boot_block: &[u8],
    kernel_end: PhysicalAddress,
) -> Result<Host, PurevisorError> {
    let boot_info = BootInfo::parse(magic, boot_block).map_err(PurevisorError::Boot)?;

    let regions: alloc::vec::Vec<MemoryRegion> = boot_info.memory_map.iter().copied().collect();
    let pmm = purevisor_core::pmm::PhysicalMemoryManager::new(DirectMapper, &regions, kernel_end);

    let vmx_caps = VmxCapabilities::read_hardware().map_err(PurevisorError::Vmx)?;

    purevisor_core::log!("purevisor: host bring-up complete");
    Ok(Host {
        boot_info,
        pmm,
        vmx_caps,
    })
}
