//! VMX integration suite: VMCS population, control adjustment and the
//! exit dispatcher driven through the mock VMCS. Runs on the host CPU
//! (CPUID executes for real); actual VM entries are exercised only on
//! hardware.

extern crate std;

mod common;

use common::{MockVmcs, TestRam};

use purevisor_core::vm::Vm;
use purevisor_core::vmexit::{self, ExitAction, ExitEnv, NullEnv};
use purevisor_core::vcpu::{ExitInfo, VcpuState};
use purevisor_hal::arch::x86_64::vmcs::{VmcsAccess, VmcsField};
use purevisor_hal::arch::x86_64::vmx::{self, VmxCapabilities, VmxRawCapabilities};
use purevisor_hal::cpu::{HostState, CPUID_ECX_HYPERVISOR, CPUID_ECX_VMX};

/// S3: guest CPUID leaf 1 comes back with the VMX and hypervisor-present
/// bits cleared and RIP advanced by the 2-byte instruction.
#[test]
fn guest_cpuid_leaf1_masked_rip_advanced() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let mut vm = Vm::new(&pmm, 1, "s3-guest").unwrap();
    let vcpu = vm.add_vcpu().unwrap();

    vcpu.regs.rax = 1;
    vcpu.regs.rcx = 0;
    vcpu.last_exit = ExitInfo {
        reason: vmexit::EXIT_REASON_CPUID,
        qualification: 0,
        guest_linear: 0,
        guest_physical: 0,
    };

    let mut vmcs = MockVmcs::default();
    vmcs.write(VmcsField::GUEST_RIP, 0x7C00).unwrap();
    vmcs.write(VmcsField::EXIT_INSTRUCTION_LEN, 2).unwrap();

    let action = vmexit::handle_exit(vcpu, &mut vmcs, &mut NullEnv).unwrap();
    assert_eq!(action, ExitAction::Continue);
    assert_eq!(vcpu.regs.rcx as u32 & CPUID_ECX_VMX, 0);
    assert_eq!(vcpu.regs.rcx as u32 & CPUID_ECX_HYPERVISOR, 0);
    assert_eq!(vmcs.read(VmcsField::GUEST_RIP).unwrap(), 0x7C02);
    vm.destroy();
}

/// Full VMCS population: the control words respect the capability masks.
#[test]
fn vmcs_controls_respect_capability_masks() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let mut vm = Vm::new(&pmm, 1, "caps-guest").unwrap();
    let vcpu = vm.add_vcpu().unwrap();

    // Realistic masks: allowed0 forces some reserved-1 bits, allowed1
    // clears what the processor does not implement.
    let raw = VmxRawCapabilities {
        basic: (1u64 << 55) | 0x0004_0000,
        pin_based: 0x0000_00FF_0000_0016,
        proc_based: 0xFFFF_FFFF_0401_E172,
        proc_based2: ((vmx::CPU_BASED2_EPT | vmx::CPU_BASED2_UNRESTRICTED_GUEST) as u64) << 32,
        exit: 0x00FF_FFFF_0003_6DFB,
        entry: 0x0000_FFFF_0000_11FB,
    };
    let caps = VmxCapabilities::parse(raw);
    assert!(caps.ept);

    let mut vmcs = MockVmcs::default();
    vcpu.setup_vmcs(&mut vmcs, &caps, &HostState::default()).unwrap();

    let pin = vmcs.read(VmcsField::PIN_BASED_CONTROLS).unwrap() as u32;
    assert_eq!(pin & !caps.pin_allowed1, 0, "pin controls exceed allowed1");
    assert_eq!(pin & caps.pin_allowed0, caps.pin_allowed0, "allowed0 bits missing");
    assert_ne!(pin & vmx::PIN_BASED_EXT_INT_EXIT, 0);

    let proc = vmcs.read(VmcsField::PRIMARY_PROC_CONTROLS).unwrap() as u32;
    assert_ne!(proc & vmx::CPU_BASED_HLT_EXIT, 0);
    assert_ne!(proc & vmx::CPU_BASED_SECONDARY_CONTROLS, 0);

    let proc2 = vmcs.read(VmcsField::SECONDARY_PROC_CONTROLS).unwrap() as u32;
    assert_ne!(proc2 & vmx::CPU_BASED2_EPT, 0);

    let exit = vmcs.read(VmcsField::EXIT_CONTROLS).unwrap() as u32;
    assert_ne!(exit & vmx::EXIT_CTRL_HOST_ADDR_SPACE, 0);

    // Guest starts at the BIOS load address with the link pointer parked.
    assert_eq!(vmcs.read(VmcsField::GUEST_RIP).unwrap(), 0x7C00);
    assert_eq!(vmcs.read(VmcsField::VMCS_LINK_POINTER).unwrap(), u64::MAX);
    vm.destroy();
}

/// The hypercall that reads a guest string pulls it through the VM's EPT.
#[test]
fn debug_print_hypercall_reads_guest_memory() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let mut vm = Vm::new(&pmm, 1, "hc-guest").unwrap();

    let backing = pmm.alloc_pages(4).unwrap();
    vm.map_memory(0, backing, 16 * 4096).unwrap();
    vm.write_guest(0x8000, b"hello from guest\0").unwrap();

    struct VmEnv<'v, 'p, M: purevisor_hal::memory::PhysMapper> {
        vm: &'v Vm<'p, M>,
    }
    impl<M: purevisor_hal::memory::PhysMapper> ExitEnv for VmEnv<'_, '_, M> {
        fn read_guest(&self, gpa: u64, buf: &mut [u8]) -> bool {
            self.vm.read_guest(gpa, buf).is_ok()
        }
    }

    let mut vcpu = purevisor_core::vcpu::Vcpu::new(&pmm, 1, 0).unwrap();
    vcpu.regs.rax = vmexit::HYPERCALL_DEBUG_PRINT;
    vcpu.regs.rbx = 0x8000;
    vcpu.last_exit = ExitInfo {
        reason: vmexit::EXIT_REASON_VMCALL,
        qualification: 0,
        guest_linear: 0,
        guest_physical: 0,
    };

    let mut vmcs = MockVmcs::default();
    let mut env = VmEnv { vm: &vm };
    let action = vmexit::handle_exit(&mut vcpu, &mut vmcs, &mut env).unwrap();
    assert_eq!(action, ExitAction::Continue);
    drop(vcpu);
    vm.destroy();
}

/// The info hypercall returns the magic and version; HLT parks the VCPU.
#[test]
fn info_hypercall_and_hlt() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let mut vcpu = purevisor_core::vcpu::Vcpu::new(&pmm, 1, 0).unwrap();

    vcpu.regs.rax = vmexit::HYPERCALL_INFO;
    vcpu.last_exit.reason = vmexit::EXIT_REASON_VMCALL;
    let mut vmcs = MockVmcs::default();
    vmexit::handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
    assert_eq!(vcpu.regs.rax, 0x5055_5245); // "PURE"
    assert_eq!(vcpu.regs.rbx, 0x0001_0000);

    vcpu.last_exit.reason = vmexit::EXIT_REASON_HLT;
    let action = vmexit::handle_exit(&mut vcpu, &mut vmcs, &mut NullEnv).unwrap();
    assert_eq!(action, ExitAction::Halted);
    assert_eq!(vcpu.state, VcpuState::Halted);
}
