#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware abstraction layer for the PureVisor hypervisor.
//!
//! This crate isolates everything that talks to the machine: address and
//! memory-map types, the boot-loader handoff, CPU state accessors, and the
//! x86_64 virtualization primitives (VMX capability discovery, VMCS access,
//! EPT and host page-table construction). The core engine consumes these
//! through the `PhysMapper`/`FrameSource`/`VmcsAccess` seams so that its
//! logic can also be driven from hosted tests.

extern crate alloc;

pub mod boot;
pub mod cpu;
pub mod memory;
pub mod arch;

pub use memory::{
    FrameSource, MemoryRegion, MemoryType, PhysMapper, PhysicalAddress, VirtualAddress,
    KERNEL_OFFSET, PAGE_SHIFT, PAGE_SIZE,
};

/// Errors surfaced by HAL initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The processor lacks a required feature (VMX, 1 GiB pages, ...)
    HardwareNotSupported,
    /// Virtualization support is fused/locked off in firmware
    VirtualizationDisabled,
    /// Initialization was attempted twice
    AlreadyInitialized,
}
