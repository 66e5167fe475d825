//! VMCS access.
//!
//! The VMCS can only be touched through VMREAD/VMWRITE on the CPU that has
//! it loaded, so all field traffic goes through the [`VmcsAccess`] trait:
//! the hardware implementation issues the instructions, and hosted tests
//! substitute a map-backed mock to drive the exit dispatcher. Field
//! encodings follow the Intel SDM Vol. 3 appendix B.

use crate::memory::{PhysicalAddress, PAGE_SIZE};

/// VMCS field encodings used by the core.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(non_camel_case_types)]
pub enum VmcsField {
    // 16-bit guest-state fields
    GUEST_ES_SELECTOR = 0x0800,
    GUEST_CS_SELECTOR = 0x0802,
    GUEST_SS_SELECTOR = 0x0804,
    GUEST_DS_SELECTOR = 0x0806,
    GUEST_FS_SELECTOR = 0x0808,
    GUEST_GS_SELECTOR = 0x080A,
    GUEST_LDTR_SELECTOR = 0x080C,
    GUEST_TR_SELECTOR = 0x080E,

    // 16-bit host-state fields
    HOST_ES_SELECTOR = 0x0C00,
    HOST_CS_SELECTOR = 0x0C02,
    HOST_SS_SELECTOR = 0x0C04,
    HOST_DS_SELECTOR = 0x0C06,
    HOST_FS_SELECTOR = 0x0C08,
    HOST_GS_SELECTOR = 0x0C0A,
    HOST_TR_SELECTOR = 0x0C0C,

    // 64-bit control fields
    IO_BITMAP_A = 0x2000,
    IO_BITMAP_B = 0x2002,
    MSR_BITMAP = 0x2004,
    EPT_POINTER = 0x201A,

    // 64-bit read-only data field
    GUEST_PHYSICAL_ADDRESS = 0x2400,

    // 64-bit guest-state fields
    VMCS_LINK_POINTER = 0x2800,
    GUEST_IA32_DEBUGCTL = 0x2802,
    GUEST_IA32_PAT = 0x2804,
    GUEST_IA32_EFER = 0x2806,

    // 64-bit host-state fields
    HOST_IA32_PAT = 0x2C00,
    HOST_IA32_EFER = 0x2C02,

    // 32-bit control fields
    PIN_BASED_CONTROLS = 0x4000,
    PRIMARY_PROC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERROR_MASK = 0x4006,
    PAGE_FAULT_ERROR_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400A,
    EXIT_CONTROLS = 0x400C,
    EXIT_MSR_STORE_COUNT = 0x400E,
    EXIT_MSR_LOAD_COUNT = 0x4010,
    ENTRY_CONTROLS = 0x4012,
    ENTRY_MSR_LOAD_COUNT = 0x4014,
    ENTRY_INTR_INFO = 0x4016,
    ENTRY_EXCEPTION_ERROR_CODE = 0x4018,
    ENTRY_INSTRUCTION_LEN = 0x401A,
    SECONDARY_PROC_CONTROLS = 0x401E,

    // 32-bit read-only data fields
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    EXIT_INTR_INFO = 0x4404,
    EXIT_INTR_ERROR_CODE = 0x4406,
    IDT_VECTORING_INFO = 0x4408,
    IDT_VECTORING_ERROR_CODE = 0x440A,
    EXIT_INSTRUCTION_LEN = 0x440C,
    EXIT_INSTRUCTION_INFO = 0x440E,

    // 32-bit guest-state fields
    GUEST_ES_LIMIT = 0x4800,
    GUEST_CS_LIMIT = 0x4802,
    GUEST_SS_LIMIT = 0x4804,
    GUEST_DS_LIMIT = 0x4806,
    GUEST_FS_LIMIT = 0x4808,
    GUEST_GS_LIMIT = 0x480A,
    GUEST_LDTR_LIMIT = 0x480C,
    GUEST_TR_LIMIT = 0x480E,
    GUEST_GDTR_LIMIT = 0x4810,
    GUEST_IDTR_LIMIT = 0x4812,
    GUEST_ES_ACCESS = 0x4814,
    GUEST_CS_ACCESS = 0x4816,
    GUEST_SS_ACCESS = 0x4818,
    GUEST_DS_ACCESS = 0x481A,
    GUEST_FS_ACCESS = 0x481C,
    GUEST_GS_ACCESS = 0x481E,
    GUEST_LDTR_ACCESS = 0x4820,
    GUEST_TR_ACCESS = 0x4822,
    GUEST_INTERRUPTIBILITY = 0x4824,
    GUEST_ACTIVITY_STATE = 0x4826,
    GUEST_SYSENTER_CS = 0x482A,

    // 32-bit host-state field
    HOST_SYSENTER_CS = 0x4C00,

    // Natural-width control fields
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,

    // Natural-width read-only data fields
    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDRESS = 0x640A,

    // Natural-width guest-state fields
    GUEST_CR0 = 0x6800,
    GUEST_CR3 = 0x6802,
    GUEST_CR4 = 0x6804,
    GUEST_ES_BASE = 0x6806,
    GUEST_CS_BASE = 0x6808,
    GUEST_SS_BASE = 0x680A,
    GUEST_DS_BASE = 0x680C,
    GUEST_FS_BASE = 0x680E,
    GUEST_GS_BASE = 0x6810,
    GUEST_LDTR_BASE = 0x6812,
    GUEST_TR_BASE = 0x6814,
    GUEST_GDTR_BASE = 0x6816,
    GUEST_IDTR_BASE = 0x6818,
    GUEST_DR7 = 0x681A,
    GUEST_RSP = 0x681C,
    GUEST_RIP = 0x681E,
    GUEST_RFLAGS = 0x6820,
    GUEST_PENDING_DBG_EXCEPTIONS = 0x6822,
    GUEST_SYSENTER_ESP = 0x6824,
    GUEST_SYSENTER_EIP = 0x6826,

    // Natural-width host-state fields
    HOST_CR0 = 0x6C00,
    HOST_CR3 = 0x6C02,
    HOST_CR4 = 0x6C04,
    HOST_FS_BASE = 0x6C06,
    HOST_GS_BASE = 0x6C08,
    HOST_TR_BASE = 0x6C0A,
    HOST_GDTR_BASE = 0x6C0C,
    HOST_IDTR_BASE = 0x6C0E,
    HOST_SYSENTER_ESP = 0x6C10,
    HOST_SYSENTER_EIP = 0x6C12,
    HOST_RSP = 0x6C14,
    HOST_RIP = 0x6C16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsError {
    /// VMREAD/VMWRITE failed (no current VMCS or unsupported field)
    AccessFailed,
    /// VMCLEAR/VMPTRLD failed
    RegionOpFailed,
}

/// Field-level VMCS access. Implemented by [`HwVmcs`] on hardware and by
/// map-backed mocks in tests.
pub trait VmcsAccess {
    fn read(&self, field: VmcsField) -> Result<u64, VmcsError>;
    fn write(&mut self, field: VmcsField, value: u64) -> Result<(), VmcsError>;
}

/// VMREAD/VMWRITE against the VMCS currently loaded on this CPU.
#[derive(Debug, Default)]
pub struct HwVmcs;

impl VmcsAccess for HwVmcs {
    #[inline]
    fn read(&self, field: VmcsField) -> Result<u64, VmcsError> {
        unsafe { x86::bits64::vmx::vmread(field as u32) }.map_err(|_| VmcsError::AccessFailed)
    }

    #[inline]
    fn write(&mut self, field: VmcsField, value: u64) -> Result<(), VmcsError> {
        unsafe { x86::bits64::vmx::vmwrite(field as u32, value) }
            .map_err(|_| VmcsError::AccessFailed)
    }
}

/// A 4 KiB VMCS region owned by one VCPU.
#[derive(Debug, Clone, Copy)]
pub struct VmcsRegion {
    phys: PhysicalAddress,
}

impl VmcsRegion {
    /// Wrap an exclusively owned, page-aligned physical region and stamp the
    /// VMCS revision identifier into its first word.
    ///
    /// # Safety
    /// `va` and `phys` must refer to the same zeroed 4 KiB page.
    pub unsafe fn new(va: *mut u8, phys: PhysicalAddress, revision: u32) -> Self {
        debug_assert_eq!(phys as usize % PAGE_SIZE, 0);
        unsafe { (va as *mut u32).write_volatile(revision) };
        VmcsRegion { phys }
    }

    pub fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    /// VMCLEAR this region (makes it inactive and flushes cached state).
    ///
    /// # Safety
    /// Requires VMX root operation.
    pub unsafe fn clear(&self) -> Result<(), VmcsError> {
        unsafe { x86::bits64::vmx::vmclear(self.phys) }.map_err(|_| VmcsError::RegionOpFailed)
    }

    /// VMPTRLD this region, making it the current VMCS on this CPU.
    ///
    /// # Safety
    /// Requires VMX root operation.
    pub unsafe fn load(&self) -> Result<(), VmcsError> {
        unsafe { x86::bits64::vmx::vmptrld(self.phys) }.map_err(|_| VmcsError::RegionOpFailed)
    }
}
