//! VM-exit dispatch and emulation.
//!
//! Each exit is decoded from the qualification fields and emulated: CPUID
//! masking, HLT, port I/O policy, MSR and CR access, EPT violations and the
//! VMCALL hypercall ABI. Everything goes through [`VmcsAccess`], so the
//! dispatcher runs unmodified against hardware and against the mock VMCS in
//! hosted tests. Collaborators (guest memory for hypercall argument
//! strings, port sinks, the lazy EPT-mapping hook) are reached through the
//! [`ExitEnv`] capability trait.

use purevisor_hal::arch::x86_64::vmcs::{VmcsAccess, VmcsError, VmcsField};
use purevisor_hal::cpu::{self, CPUID_ECX_HYPERVISOR, CPUID_ECX_VMX};
use purevisor_hal::memory::PhysMapper;

use crate::vcpu::{Vcpu, VcpuState};
use crate::{log, log_error, log_warn};

// Basic exit reasons (Intel SDM Vol. 3D, appendix C).
pub const EXIT_REASON_EXCEPTION_NMI: u32 = 0;
pub const EXIT_REASON_EXTERNAL_INT: u32 = 1;
pub const EXIT_REASON_TRIPLE_FAULT: u32 = 2;
pub const EXIT_REASON_CPUID: u32 = 10;
pub const EXIT_REASON_HLT: u32 = 12;
pub const EXIT_REASON_VMCALL: u32 = 18;
pub const EXIT_REASON_CR_ACCESS: u32 = 28;
pub const EXIT_REASON_IO_INSTRUCTION: u32 = 30;
pub const EXIT_REASON_RDMSR: u32 = 31;
pub const EXIT_REASON_WRMSR: u32 = 32;
pub const EXIT_REASON_EPT_VIOLATION: u32 = 48;
pub const EXIT_REASON_EPT_MISCONFIG: u32 = 49;

/// Hypercall numbers (rax at VMCALL).
pub const HYPERCALL_DEBUG_PRINT: u64 = 0;
pub const HYPERCALL_INFO: u64 = 1;
/// "PURE"
pub const HYPERVISOR_MAGIC: u64 = 0x5055_5245;
/// Version 1.0
pub const HYPERVISOR_VERSION: u64 = 0x0001_0000;

/// What the run loop should do after an exit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Continue,
    /// Guest executed HLT; re-enter once an interrupt is injected.
    Halted,
    /// Unrecoverable for this guest; the VM must be marked errored.
    Fatal,
}

/// Decoded EPT-violation access bits.
#[derive(Debug, Clone, Copy)]
pub struct EptAccess {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub guest_linear_valid: bool,
}

/// Collaborators of the dispatcher. Default implementations make every
/// hook a no-op, matching a guest with no devices attached.
pub trait ExitEnv {
    /// Read guest-physical memory (hypercall string arguments).
    fn read_guest(&self, _gpa: u64, _buf: &mut [u8]) -> bool {
        false
    }

    /// Guest OUT to a trapped port.
    fn port_out(&mut self, _port: u16, _width: u8, _value: u32) {}

    /// Try to satisfy an EPT violation (lazy mapping). `true` = resolved.
    fn resolve_ept_violation(&mut self, _gpa: u64, _access: EptAccess) -> bool {
        false
    }
}

/// Environment with no devices and no lazy mappings.
pub struct NullEnv;

impl ExitEnv for NullEnv {}

fn reason_name(reason: u32) -> &'static str {
    match reason {
        EXIT_REASON_EXCEPTION_NMI => "Exception/NMI",
        EXIT_REASON_EXTERNAL_INT => "External Interrupt",
        EXIT_REASON_TRIPLE_FAULT => "Triple Fault",
        EXIT_REASON_CPUID => "CPUID",
        EXIT_REASON_HLT => "HLT",
        EXIT_REASON_VMCALL => "VMCALL",
        EXIT_REASON_CR_ACCESS => "CR Access",
        EXIT_REASON_IO_INSTRUCTION => "I/O Instruction",
        EXIT_REASON_RDMSR => "RDMSR",
        EXIT_REASON_WRMSR => "WRMSR",
        EXIT_REASON_EPT_VIOLATION => "EPT Violation",
        EXIT_REASON_EPT_MISCONFIG => "EPT Misconfiguration",
        _ => "Unknown",
    }
}

fn advance_rip<V: VmcsAccess>(vmcs: &mut V) -> Result<(), VmcsError> {
    let rip = vmcs.read(VmcsField::GUEST_RIP)?;
    let len = vmcs.read(VmcsField::EXIT_INSTRUCTION_LEN)?;
    vmcs.write(VmcsField::GUEST_RIP, rip + len)
}

fn handle_cpuid<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
) -> Result<ExitAction, VmcsError> {
    let leaf = vcpu.regs.rax as u32;
    let subleaf = vcpu.regs.rcx as u32;
    let mut result = cpu::cpuid(leaf, subleaf);

    match leaf {
        1 => {
            // The guest must not see VMX or believe a hypervisor interface
            // is being offered on this leaf.
            result.ecx &= !CPUID_ECX_VMX;
            result.ecx &= !CPUID_ECX_HYPERVISOR;
        }
        0x4000_0000 => {
            result.eax = 0x4000_0001; // max hypervisor leaf
            result.ebx = 0x6572_7550; // "Pure"
            result.ecx = 0x6F73_6956; // "Viso"
            result.edx = 0x0000_0072; // "r\0\0\0"
        }
        0x4000_0001 => {
            result.eax = 0;
            result.ebx = 0;
            result.ecx = 0;
            result.edx = 0;
        }
        _ => {}
    }

    vcpu.regs.rax = result.eax as u64;
    vcpu.regs.rbx = result.ebx as u64;
    vcpu.regs.rcx = result.ecx as u64;
    vcpu.regs.rdx = result.edx as u64;

    advance_rip(vmcs)?;
    Ok(ExitAction::Continue)
}

fn handle_hlt<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
) -> Result<ExitAction, VmcsError> {
    vcpu.state = VcpuState::Halted;
    advance_rip(vmcs)?;
    // Resumption happens when an interrupt is injected from outside.
    Ok(ExitAction::Halted)
}

fn handle_io<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
    qual: u64,
    env: &mut dyn ExitEnv,
) -> Result<ExitAction, VmcsError> {
    let port = ((qual >> 16) & 0xFFFF) as u16;
    let width = ((qual & 7) + 1) as u8; // bytes: 1, 2 or 4
    let is_in = (qual >> 3) & 1 != 0;
    let _is_string = (qual >> 4) & 1 != 0;
    let _is_rep = (qual >> 5) & 1 != 0;
    let mask = if width == 8 {
        u64::MAX
    } else {
        (1u64 << (width as u32 * 8)) - 1
    };

    if is_in {
        let value: u32 = match port {
            // Serial ports: no data pending.
            0x3F8..=0x3FF | 0x2F8..=0x2FF => 0,
            // Keyboard data / status: empty.
            0x60 => 0,
            0x64 => 0,
            _ => 0xFFFF_FFFF,
        };
        vcpu.regs.rax = (vcpu.regs.rax & !mask) | (value as u64 & mask);
    } else {
        let value = (vcpu.regs.rax & mask) as u32;
        match port {
            0x80 => {} // POST/delay port
            _ => env.port_out(port, width, value),
        }
    }

    advance_rip(vmcs)?;
    Ok(ExitAction::Continue)
}

fn handle_rdmsr<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
) -> Result<ExitAction, VmcsError> {
    use purevisor_hal::arch::x86_64::msr;
    let index = vcpu.regs.rcx as u32;
    let value = match index {
        msr::IA32_EFER => vmcs.read(VmcsField::GUEST_IA32_EFER)?,
        msr::IA32_APIC_BASE => 0xFEE0_0900, // BSP, enabled, default base
        msr::IA32_FS_BASE => vmcs.read(VmcsField::GUEST_FS_BASE)?,
        msr::IA32_GS_BASE => vmcs.read(VmcsField::GUEST_GS_BASE)?,
        _ => {
            log_warn!("vmexit: rdmsr of unknown msr {:#x}", index);
            0
        }
    };
    vcpu.regs.rax = value & 0xFFFF_FFFF;
    vcpu.regs.rdx = value >> 32;
    advance_rip(vmcs)?;
    Ok(ExitAction::Continue)
}

fn handle_wrmsr<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
) -> Result<ExitAction, VmcsError> {
    use purevisor_hal::arch::x86_64::msr;
    let index = vcpu.regs.rcx as u32;
    let value = (vcpu.regs.rdx << 32) | (vcpu.regs.rax & 0xFFFF_FFFF);
    match index {
        msr::IA32_EFER => vmcs.write(VmcsField::GUEST_IA32_EFER, value)?,
        msr::IA32_FS_BASE => vmcs.write(VmcsField::GUEST_FS_BASE, value)?,
        msr::IA32_GS_BASE => vmcs.write(VmcsField::GUEST_GS_BASE, value)?,
        _ => {
            log_warn!("vmexit: wrmsr of unknown msr {:#x} = {:#x}", index, value);
        }
    }
    advance_rip(vmcs)?;
    Ok(ExitAction::Continue)
}

fn handle_cr_access<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
    qual: u64,
) -> Result<ExitAction, VmcsError> {
    let cr = (qual & 0xF) as u8;
    let access_type = ((qual >> 4) & 0x3) as u8;
    let reg = ((qual >> 8) & 0xF) as u8;

    match access_type {
        0 => {
            // MOV to CR: update the guest value, and the read shadow for
            // the CRs that have one.
            let value = vcpu.regs.gpr(reg);
            match cr {
                0 => {
                    vmcs.write(VmcsField::GUEST_CR0, value)?;
                    vmcs.write(VmcsField::CR0_READ_SHADOW, value)?;
                }
                3 => vmcs.write(VmcsField::GUEST_CR3, value)?,
                4 => {
                    vmcs.write(VmcsField::GUEST_CR4, value)?;
                    vmcs.write(VmcsField::CR4_READ_SHADOW, value)?;
                }
                _ => log_warn!("vmexit: mov to unhandled cr{}", cr),
            }
        }
        1 => {
            // MOV from CR: return the VMCS-held value.
            let value = match cr {
                0 => vmcs.read(VmcsField::GUEST_CR0)?,
                3 => vmcs.read(VmcsField::GUEST_CR3)?,
                4 => vmcs.read(VmcsField::GUEST_CR4)?,
                _ => {
                    log_warn!("vmexit: mov from unhandled cr{}", cr);
                    0
                }
            };
            vcpu.regs.set_gpr(reg, value);
        }
        _ => {
            // CLTS / LMSW are not expected with our guest CR0 mask.
            log_warn!("vmexit: unhandled cr access type {}", access_type);
        }
    }

    advance_rip(vmcs)?;
    Ok(ExitAction::Continue)
}

fn handle_ept_violation<M: PhysMapper>(
    vcpu: &mut Vcpu<'_, M>,
    qual: u64,
    env: &mut dyn ExitEnv,
) -> ExitAction {
    let access = EptAccess {
        read: qual & 1 != 0,
        write: qual & 2 != 0,
        execute: qual & 4 != 0,
        guest_linear_valid: qual & (1 << 7) != 0,
    };
    let gpa = vcpu.last_exit.guest_physical;
    if env.resolve_ept_violation(gpa, access) {
        return ExitAction::Continue;
    }
    log_error!(
        "vmexit: unresolved ept violation gpa={:#x} r={} w={} x={}",
        gpa,
        access.read,
        access.write,
        access.execute
    );
    ExitAction::Fatal
}

fn handle_vmcall<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
    env: &mut dyn ExitEnv,
) -> Result<ExitAction, VmcsError> {
    let call = vcpu.regs.rax;
    match call {
        HYPERCALL_DEBUG_PRINT => {
            // rbx = guest-physical address of a NUL-terminated string.
            let mut buf = [0u8; 256];
            if env.read_guest(vcpu.regs.rbx, &mut buf) {
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                if let Ok(s) = core::str::from_utf8(&buf[..end]) {
                    log!("guest[{}]: {}", vcpu.vm_id, s);
                }
            }
        }
        HYPERCALL_INFO => {
            vcpu.regs.rax = HYPERVISOR_MAGIC;
            vcpu.regs.rbx = HYPERVISOR_VERSION;
        }
        _ => {
            vcpu.regs.rax = u64::MAX;
        }
    }
    advance_rip(vmcs)?;
    Ok(ExitAction::Continue)
}

/// Dispatch one VM exit. `vcpu.last_exit` must hold the exit information
/// read after the entry returned.
pub fn handle_exit<M: PhysMapper, V: VmcsAccess>(
    vcpu: &mut Vcpu<'_, M>,
    vmcs: &mut V,
    env: &mut dyn ExitEnv,
) -> Result<ExitAction, VmcsError> {
    let reason = vcpu.last_exit.reason & 0xFFFF;
    let qual = vcpu.last_exit.qualification;

    match reason {
        EXIT_REASON_CPUID => handle_cpuid(vcpu, vmcs),
        EXIT_REASON_HLT => handle_hlt(vcpu, vmcs),
        EXIT_REASON_IO_INSTRUCTION => handle_io(vcpu, vmcs, qual, env),
        EXIT_REASON_RDMSR => handle_rdmsr(vcpu, vmcs),
        EXIT_REASON_WRMSR => handle_wrmsr(vcpu, vmcs),
        EXIT_REASON_CR_ACCESS => handle_cr_access(vcpu, vmcs, qual),
        EXIT_REASON_EPT_VIOLATION => Ok(handle_ept_violation(vcpu, qual, env)),
        EXIT_REASON_VMCALL => handle_vmcall(vcpu, vmcs, env),
        EXIT_REASON_EXTERNAL_INT => {
            // The host IDT already handled the interrupt; nothing to do.
            Ok(ExitAction::Continue)
        }
        EXIT_REASON_TRIPLE_FAULT => {
            log_error!("vmexit: triple fault in vm {}", vcpu.vm_id);
            Ok(ExitAction::Fatal)
        }
        _ => {
            log_warn!(
                "vmexit: unhandled reason {} ({})",
                reason,
                reason_name(reason)
            );
            Ok(ExitAction::Fatal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockVmcs, TestRam};
    use crate::vcpu::{ExitInfo, Vcpu};

    fn vcpu_with_exit<'p>(
        pmm: &'p crate::pmm::PhysicalMemoryManager<crate::testutil::RamMapper>,
        reason: u32,
        qual: u64,
    ) -> Vcpu<'p, crate::testutil::RamMapper> {
        let mut vcpu = Vcpu::new(pmm, 1, 0).unwrap();
        vcpu.last_exit = ExitInfo {
            reason,
            qualification: qual,
            guest_linear: 0,
            guest_physical: 0,
        };
        vcpu
    }

    #[test]
    fn cpuid_leaf1_masks_vmx_and_hypervisor_bits() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_CPUID, 0);
        vcpu.regs.rax = 1;
        vcpu.regs.rcx = 0;

        let mut vmcs = MockVmcs::default();
        vmcs.write(VmcsField::GUEST_RIP, 0x7C00).unwrap();
        vmcs.write(VmcsField::EXIT_INSTRUCTION_LEN, 2).unwrap();

        let action = handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(action, ExitAction::Continue);
        assert_eq!(vcpu.regs.rcx as u32 & CPUID_ECX_VMX, 0);
        assert_eq!(vcpu.regs.rcx as u32 & CPUID_ECX_HYPERVISOR, 0);
        // CPUID is 0F A2: RIP advanced by 2.
        assert_eq!(vmcs.read(VmcsField::GUEST_RIP).unwrap(), 0x7C02);
    }

    #[test]
    fn cpuid_hypervisor_leaf_returns_signature() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_CPUID, 0);
        vcpu.regs.rax = 0x4000_0000;

        let mut vmcs = MockVmcs::default();
        handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(vcpu.regs.rax, 0x4000_0001);
        assert_eq!(vcpu.regs.rbx, 0x6572_7550); // "Pure"
        assert_eq!(vcpu.regs.rcx, 0x6F73_6956); // "Viso"
        assert_eq!(vcpu.regs.rdx, 0x0000_0072); // "r"
    }

    #[test]
    fn hlt_halts_and_advances_rip() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_HLT, 0);

        let mut vmcs = MockVmcs::default();
        vmcs.write(VmcsField::GUEST_RIP, 0x100).unwrap();
        vmcs.write(VmcsField::EXIT_INSTRUCTION_LEN, 1).unwrap();
        let action = handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(action, ExitAction::Halted);
        assert_eq!(vcpu.state, VcpuState::Halted);
        assert_eq!(vmcs.read(VmcsField::GUEST_RIP).unwrap(), 0x101);
    }

    #[test]
    fn io_in_from_unknown_port_returns_all_ones() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        // IN, width 2, port 0x1234: qual = (port<<16) | (1<<3) | (width-1)
        let qual = (0x1234u64 << 16) | (1 << 3) | 1;
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_IO_INSTRUCTION, qual);
        vcpu.regs.rax = 0xAAAA_BBBB_CCCC_DDDD;

        let mut vmcs = MockVmcs::default();
        handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(vcpu.regs.rax, 0xAAAA_BBBB_CCCC_FFFF);
    }

    #[test]
    fn io_in_from_serial_returns_zero() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let qual = (0x3F8u64 << 16) | (1 << 3); // IN, width 1, COM1 data
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_IO_INSTRUCTION, qual);
        vcpu.regs.rax = 0xFF;

        let mut vmcs = MockVmcs::default();
        handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(vcpu.regs.rax, 0);
    }

    #[test]
    fn io_out_reaches_the_port_sink() {
        struct Sink(alloc::vec::Vec<(u16, u8, u32)>);
        impl ExitEnv for Sink {
            fn port_out(&mut self, port: u16, width: u8, value: u32) {
                self.0.push((port, width, value));
            }
        }

        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let qual = 0x3F8u64 << 16; // OUT, width 1, COM1 data
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_IO_INSTRUCTION, qual);
        vcpu.regs.rax = b'A' as u64;

        let mut vmcs = MockVmcs::default();
        let mut sink = Sink(alloc::vec::Vec::new());
        handle_exit(&mut vcpu, &mut vmcs, &mut sink).unwrap();
        assert_eq!(sink.0, alloc::vec![(0x3F8, 1, b'A' as u32)]);
    }

    #[test]
    fn cr_access_updates_guest_and_shadow() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        // MOV to CR0 from RBX: cr=0, type=0, reg=3
        let qual = 3u64 << 8;
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_CR_ACCESS, qual);
        vcpu.regs.rbx = 0x8000_0011;

        let mut vmcs = MockVmcs::default();
        handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(vmcs.read(VmcsField::GUEST_CR0).unwrap(), 0x8000_0011);
        assert_eq!(vmcs.read(VmcsField::CR0_READ_SHADOW).unwrap(), 0x8000_0011);
    }

    #[test]
    fn vmcall_info_returns_magic() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_VMCALL, 0);
        vcpu.regs.rax = HYPERCALL_INFO;

        let mut vmcs = MockVmcs::default();
        handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(vcpu.regs.rax, HYPERVISOR_MAGIC);
        assert_eq!(vcpu.regs.rbx, HYPERVISOR_VERSION);
    }

    #[test]
    fn unknown_vmcall_returns_minus_one() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_VMCALL, 0);
        vcpu.regs.rax = 99;

        let mut vmcs = MockVmcs::default();
        handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(vcpu.regs.rax, u64::MAX);
    }

    #[test]
    fn unresolved_ept_violation_is_fatal_to_guest() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_EPT_VIOLATION, 0b011);
        vcpu.last_exit.guest_physical = 0xDEAD_0000;

        let mut vmcs = MockVmcs::default();
        let action = handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(action, ExitAction::Fatal);
    }

    #[test]
    fn triple_fault_is_fatal() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = vcpu_with_exit(&pmm, EXIT_REASON_TRIPLE_FAULT, 0);
        let mut vmcs = MockVmcs::default();
        let action = handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
        assert_eq!(action, ExitAction::Fatal);
    }
}
