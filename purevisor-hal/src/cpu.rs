//! CPU state accessors.
//!
//! Thin wrappers over CPUID, the time-stamp counter, control registers and
//! the descriptor-table/segment state needed to populate the VMCS host-state
//! area. Hardware access is only compiled on x86_64; the value types are
//! architecture-neutral.

/// Result of a CPUID invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// CPUID.1:ECX bit for VMX support.
pub const CPUID_ECX_VMX: u32 = 1 << 5;
/// CPUID.1:ECX hypervisor-present bit.
pub const CPUID_ECX_HYPERVISOR: u32 = 1 << 31;

/// Execute CPUID with the given leaf/subleaf.
#[cfg(target_arch = "x86_64")]
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    CpuidResult {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// Read the time-stamp counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Whether this processor advertises VMX in CPUID.
#[cfg(target_arch = "x86_64")]
pub fn has_vmx() -> bool {
    raw_cpuid::CpuId::new()
        .get_feature_info()
        .map(|f| f.has_vmx())
        .unwrap_or(false)
}

/// Logical processor count reported by CPUID leaf 1.
#[cfg(target_arch = "x86_64")]
pub fn logical_cpu_count() -> u32 {
    let r = cpuid(1, 0);
    core::cmp::max((r.ebx >> 16) & 0xFF, 1)
}

/// Snapshot of the control/segment state of the running CPU, taken when a
/// VMCS host-state area is populated.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub efer: u64,
}

#[cfg(target_arch = "x86_64")]
mod hw {
    use super::HostState;
    use crate::arch::x86_64::msr;
    use x86::msr::rdmsr;
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
    use x86_64::instructions::tables::{sgdt, sidt};
    use x86_64::registers::control::{Cr0, Cr3, Cr4};

    /// Capture the live host state for VMCS population.
    pub fn capture_host_state() -> HostState {
        let gdtr = sgdt();
        let idtr = sidt();
        let (cr3_frame, cr3_flags) = Cr3::read_raw();
        HostState {
            cr0: Cr0::read_raw(),
            cr3: cr3_frame.start_address().as_u64() | cr3_flags as u64,
            cr4: Cr4::read_raw(),
            cs: CS::get_reg().0,
            ss: SS::get_reg().0,
            ds: DS::get_reg().0,
            es: ES::get_reg().0,
            fs: FS::get_reg().0,
            gs: GS::get_reg().0,
            tr: unsafe { x86::task::tr().bits() },
            fs_base: unsafe { rdmsr(msr::IA32_FS_BASE) },
            gs_base: unsafe { rdmsr(msr::IA32_GS_BASE) },
            gdtr_base: gdtr.base.as_u64(),
            idtr_base: idtr.base.as_u64(),
            sysenter_cs: unsafe { rdmsr(msr::IA32_SYSENTER_CS) },
            sysenter_esp: unsafe { rdmsr(msr::IA32_SYSENTER_ESP) },
            sysenter_eip: unsafe { rdmsr(msr::IA32_SYSENTER_EIP) },
            efer: unsafe { rdmsr(msr::IA32_EFER) },
        }
    }

    /// Write a new CR3 value (address-space switch).
    ///
    /// # Safety
    /// `pml4_phys` must point at a valid top-level page table that keeps the
    /// currently executing code mapped.
    pub unsafe fn write_cr3(pml4_phys: u64) {
        use x86_64::structures::paging::PhysFrame;
        use x86_64::{registers::control::Cr3Flags, PhysAddr};
        let frame = PhysFrame::containing_address(PhysAddr::new(pml4_phys));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    /// Invalidate the TLB entry covering `va`.
    #[inline]
    pub fn invlpg(va: u64) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
    }
}

#[cfg(target_arch = "x86_64")]
pub use hw::{capture_host_state, invlpg, write_cr3};
