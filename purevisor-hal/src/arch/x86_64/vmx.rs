//! Intel VT-x enablement and capability discovery.
//!
//! Capability MSRs are parsed into `allowed0`/`allowed1` masks once at init;
//! every control word written into a VMCS is passed through
//! [`VmxCapabilities::adjust`] so reserved bits always carry the values the
//! processor demands. Parsing is separated from the MSR reads so recorded
//! register values can drive it in hosted tests.

use x86::msr::{rdmsr, wrmsr};
use x86_64::registers::control::{Cr4, Cr4Flags};

use super::msr;
use crate::memory::PhysicalAddress;

/// Pin-based execution controls.
pub const PIN_BASED_EXT_INT_EXIT: u32 = 1 << 0;
pub const PIN_BASED_NMI_EXIT: u32 = 1 << 3;

/// Primary processor-based execution controls.
pub const CPU_BASED_HLT_EXIT: u32 = 1 << 7;
pub const CPU_BASED_IO_BITMAP: u32 = 1 << 25;
pub const CPU_BASED_MSR_BITMAP: u32 = 1 << 28;
pub const CPU_BASED_SECONDARY_CONTROLS: u32 = 1 << 31;

/// Secondary processor-based execution controls.
pub const CPU_BASED2_EPT: u32 = 1 << 1;
pub const CPU_BASED2_VPID: u32 = 1 << 5;
pub const CPU_BASED2_UNRESTRICTED_GUEST: u32 = 1 << 7;

/// VM-exit controls.
pub const EXIT_CTRL_HOST_ADDR_SPACE: u32 = 1 << 9;
pub const EXIT_CTRL_ACK_INT_ON_EXIT: u32 = 1 << 15;
pub const EXIT_CTRL_SAVE_IA32_EFER: u32 = 1 << 20;
pub const EXIT_CTRL_LOAD_IA32_EFER: u32 = 1 << 21;

/// VM-entry controls.
pub const ENTRY_CTRL_IA32E_GUEST: u32 = 1 << 9;
pub const ENTRY_CTRL_LOAD_IA32_EFER: u32 = 1 << 15;

/// Raw values of the capability MSRs, separated from parsing for testability.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmxRawCapabilities {
    pub basic: u64,
    pub pin_based: u64,
    pub proc_based: u64,
    pub proc_based2: u64,
    pub exit: u64,
    pub entry: u64,
}

/// Parsed VT-x capabilities of the current processor package.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmxCapabilities {
    pub vmcs_revision: u32,
    pub true_controls: bool,
    pub pin_allowed0: u32,
    pub pin_allowed1: u32,
    pub proc_allowed0: u32,
    pub proc_allowed1: u32,
    pub proc2_allowed0: u32,
    pub proc2_allowed1: u32,
    pub exit_allowed0: u32,
    pub exit_allowed1: u32,
    pub entry_allowed0: u32,
    pub entry_allowed1: u32,
    pub ept: bool,
    pub vpid: bool,
    pub unrestricted_guest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// CPUID does not report VMX
    NotSupported,
    /// IA32_FEATURE_CONTROL locked with VMX disabled
    LockedOff,
    /// VMXON/VMXOFF or a VMCS instruction faulted
    InstructionFailed,
}

fn split_allowed(raw: u64) -> (u32, u32) {
    (raw as u32, (raw >> 32) as u32)
}

impl VmxCapabilities {
    /// Decode capability MSR values into allowed0/allowed1 masks.
    pub fn parse(raw: VmxRawCapabilities) -> Self {
        let true_controls = (raw.basic >> 55) & 1 != 0;
        let (pin0, pin1) = split_allowed(raw.pin_based);
        let (proc0, proc1) = split_allowed(raw.proc_based);
        let (exit0, exit1) = split_allowed(raw.exit);
        let (entry0, entry1) = split_allowed(raw.entry);
        let (proc2_0, proc2_1) = if proc1 & CPU_BASED_SECONDARY_CONTROLS != 0 {
            split_allowed(raw.proc_based2)
        } else {
            (0, 0)
        };
        VmxCapabilities {
            vmcs_revision: raw.basic as u32 & 0x7FFF_FFFF,
            true_controls,
            pin_allowed0: pin0,
            pin_allowed1: pin1,
            proc_allowed0: proc0,
            proc_allowed1: proc1,
            proc2_allowed0: proc2_0,
            proc2_allowed1: proc2_1,
            exit_allowed0: exit0,
            exit_allowed1: exit1,
            entry_allowed0: entry0,
            entry_allowed1: entry1,
            ept: proc2_1 & CPU_BASED2_EPT != 0,
            vpid: proc2_1 & CPU_BASED2_VPID != 0,
            unrestricted_guest: proc2_1 & CPU_BASED2_UNRESTRICTED_GUEST != 0,
        }
    }

    /// Read the capability MSRs of the running processor. Prefers the TRUE
    /// control variants when IA32_VMX_BASIC advertises them.
    pub fn read_hardware() -> Result<Self, VmxError> {
        if !crate::cpu::has_vmx() {
            return Err(VmxError::NotSupported);
        }
        let feature_control = unsafe { rdmsr(msr::IA32_FEATURE_CONTROL) };
        if feature_control & msr::FEATURE_CONTROL_LOCK != 0
            && feature_control & msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX == 0
        {
            return Err(VmxError::LockedOff);
        }
        if feature_control & msr::FEATURE_CONTROL_LOCK == 0 {
            // Not locked by firmware: lock with VMX-outside-SMX enabled.
            unsafe {
                wrmsr(
                    msr::IA32_FEATURE_CONTROL,
                    feature_control
                        | msr::FEATURE_CONTROL_LOCK
                        | msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX,
                );
            }
        }

        let basic = unsafe { rdmsr(msr::IA32_VMX_BASIC) };
        let true_controls = (basic >> 55) & 1 != 0;
        let raw = unsafe {
            if true_controls {
                VmxRawCapabilities {
                    basic,
                    pin_based: rdmsr(msr::IA32_VMX_TRUE_PINBASED_CTLS),
                    proc_based: rdmsr(msr::IA32_VMX_TRUE_PROCBASED_CTLS),
                    proc_based2: rdmsr(msr::IA32_VMX_PROCBASED_CTLS2),
                    exit: rdmsr(msr::IA32_VMX_TRUE_EXIT_CTLS),
                    entry: rdmsr(msr::IA32_VMX_TRUE_ENTRY_CTLS),
                }
            } else {
                VmxRawCapabilities {
                    basic,
                    pin_based: rdmsr(msr::IA32_VMX_PINBASED_CTLS),
                    proc_based: rdmsr(msr::IA32_VMX_PROCBASED_CTLS),
                    proc_based2: rdmsr(msr::IA32_VMX_PROCBASED_CTLS2),
                    exit: rdmsr(msr::IA32_VMX_EXIT_CTLS),
                    entry: rdmsr(msr::IA32_VMX_ENTRY_CTLS),
                }
            }
        };
        Ok(Self::parse(raw))
    }

    /// `(requested | allowed0) & allowed1`
    #[inline]
    pub fn adjust(requested: u32, allowed0: u32, allowed1: u32) -> u32 {
        (requested | allowed0) & allowed1
    }

    pub fn pin_based(&self, requested: u32) -> u32 {
        Self::adjust(requested, self.pin_allowed0, self.pin_allowed1)
    }

    pub fn proc_based(&self, requested: u32) -> u32 {
        Self::adjust(requested, self.proc_allowed0, self.proc_allowed1)
    }

    pub fn proc_based2(&self, requested: u32) -> u32 {
        Self::adjust(requested, self.proc2_allowed0, self.proc2_allowed1)
    }

    pub fn exit_controls(&self, requested: u32) -> u32 {
        Self::adjust(requested, self.exit_allowed0, self.exit_allowed1)
    }

    pub fn entry_controls(&self, requested: u32) -> u32 {
        Self::adjust(requested, self.entry_allowed0, self.entry_allowed1)
    }
}

/// Enter VMX root operation on the current CPU. The VMXON region must be a
/// zeroed 4 KiB page with the VMCS revision at offset 0, which this routine
/// writes through `vmxon_va` before executing VMXON on the physical address.
///
/// # Safety
/// `vmxon_va`/`vmxon_phys` must refer to the same page-aligned, exclusively
/// owned region. Must not already be in VMX operation.
pub unsafe fn enable_on_cpu(
    caps: &VmxCapabilities,
    vmxon_va: *mut u8,
    vmxon_phys: PhysicalAddress,
) -> Result<(), VmxError> {
    unsafe {
        core::ptr::write_bytes(vmxon_va, 0, crate::memory::PAGE_SIZE);
        (vmxon_va as *mut u32).write_volatile(caps.vmcs_revision);
        Cr4::update(|f| f.insert(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
        x86::bits64::vmx::vmxon(vmxon_phys).map_err(|_| VmxError::InstructionFailed)
    }
}

/// Leave VMX root operation and clear CR4.VMXE.
///
/// # Safety
/// No VMCS may be active on this CPU.
pub unsafe fn disable_on_cpu() -> Result<(), VmxError> {
    unsafe {
        x86::bits64::vmx::vmxoff().map_err(|_| VmxError::InstructionFailed)?;
        Cr4::update(|f| f.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
    }
    Ok(())
}

/// INVEPT single-context invalidation for `eptp`.
///
/// # Safety
/// Requires VMX operation with EPT enabled.
pub unsafe fn invept_single_context(eptp: u64) {
    #[repr(C, packed)]
    struct InveptDescriptor {
        eptp: u64,
        reserved: u64,
    }
    let desc = InveptDescriptor { eptp, reserved: 0 };
    const SINGLE_CONTEXT: u64 = 1;
    unsafe {
        core::arch::asm!(
            "invept {0}, [{1}]",
            in(reg) SINGLE_CONTEXT,
            in(reg) &desc as *const InveptDescriptor,
            options(nostack),
        );
    }
}

/// INVVPID single-context invalidation.
///
/// # Safety
/// Requires VMX operation with VPID enabled.
pub unsafe fn invvpid_single_context(vpid: u16) {
    #[repr(C, packed)]
    struct InvvpidDescriptor {
        vpid: u16,
        reserved: [u16; 3],
        linear: u64,
    }
    let desc = InvvpidDescriptor {
        vpid,
        reserved: [0; 3],
        linear: 0,
    };
    const SINGLE_CONTEXT: u64 = 1;
    unsafe {
        core::arch::asm!(
            "invvpid {0}, [{1}]",
            in(reg) SINGLE_CONTEXT,
            in(reg) &desc as *const InvvpidDescriptor,
            options(nostack),
        );
    }
}
