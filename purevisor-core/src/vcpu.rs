//! Virtual CPUs: owned VMX regions, VMCS population and the entry loop.
//!
//! Each VCPU exclusively owns five page-aligned regions from the PMM: the
//! VMXON region, its VMCS, both I/O bitmaps and the MSR bitmap. VMCS
//! population is written against the [`VmcsAccess`] trait so the same code
//! fills hardware VMCSes and the map-backed mock in tests.
//!
//! The guest register file is saved/restored by an assembly stub around
//! VMLAUNCH/VMRESUME; the host-side landing point is installed as the VMCS
//! HOST_RIP before every entry.

use purevisor_hal::arch::x86_64::vmcs::{VmcsAccess, VmcsError, VmcsField};
use purevisor_hal::arch::x86_64::vmx::{self, VmxCapabilities};
use purevisor_hal::cpu::HostState;
use purevisor_hal::memory::{PhysMapper, PhysicalAddress, PAGE_SIZE};

use crate::pmm::PhysicalMemoryManager;
use crate::{log, log_error};

/// VCPU lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Created,
    Running,
    Halted,
    Waiting,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuError {
    /// PMM could not supply a region
    AllocationFailed,
    Vmcs(VmcsError),
    /// VMLAUNCH/VMRESUME failed; carries VM_INSTRUCTION_ERROR
    EntryFailed(u64),
}

impl From<VmcsError> for VcpuError {
    fn from(e: VmcsError) -> Self {
        VcpuError::Vmcs(e)
    }
}

/// Guest general-purpose register file.
///
/// The first sixteen slots are the fixed save/restore area used by the
/// entry stub; `rsp` is a shadow of the VMCS field (the stub never loads
/// it). RIP/RFLAGS shadows follow and are synced from the VMCS after each
/// exit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

// The entry stub addresses the first 16 slots by fixed offset.
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, r15), 0x78);

impl GuestRegisters {
    /// Register by the 4-bit encoding used in exit qualifications
    /// (0 = RAX ... 15 = R15).
    pub fn gpr(&self, index: u8) -> u64 {
        match index & 0xF {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    pub fn set_gpr(&mut self, index: u8, value: u64) {
        match index & 0xF {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => self.rsp = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

// VM entry/exit stub. The VMCS HOST_RSP/HOST_RIP fields are written with
// the live stack pointer and the exit landing pad on every entry, so after
// a VM exit the processor resumes at `purevisor_vmx_exit` with our stack
// intact and the register-file pointer on top of it.
//
// purevisor_vmx_entry(regs: *mut GuestRegisters (rdi), launched: u32 (esi))
//   returns 0 after a VM exit, 1 when VMLAUNCH/VMRESUME itself failed.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".global purevisor_vmx_entry",
    "purevisor_vmx_entry:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov rax, 0x6C14", // HOST_RSP
    "vmwrite rax, rsp",
    "lea rdx, [rip + purevisor_vmx_exit]",
    "mov rax, 0x6C16", // HOST_RIP
    "vmwrite rax, rdx",
    "cmp esi, 0",
    "mov rax, [rdi + 0x00]",
    "mov rcx, [rdi + 0x08]",
    "mov rdx, [rdi + 0x10]",
    "mov rbx, [rdi + 0x18]",
    "mov rbp, [rdi + 0x28]",
    "mov rsi, [rdi + 0x30]",
    "mov r8,  [rdi + 0x40]",
    "mov r9,  [rdi + 0x48]",
    "mov r10, [rdi + 0x50]",
    "mov r11, [rdi + 0x58]",
    "mov r12, [rdi + 0x60]",
    "mov r13, [rdi + 0x68]",
    "mov r14, [rdi + 0x70]",
    "mov r15, [rdi + 0x78]",
    "mov rdi, [rdi + 0x38]",
    "jne 2f",
    "vmlaunch",
    "jmp 3f",
    "2: vmresume",
    "3:", // fall-through only on a failed entry
    "pop rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "mov eax, 1",
    "ret",
    ".global purevisor_vmx_exit",
    "purevisor_vmx_exit:",
    "push rdi",
    "mov rdi, [rsp + 8]",
    "mov [rdi + 0x00], rax",
    "mov [rdi + 0x08], rcx",
    "mov [rdi + 0x10], rdx",
    "mov [rdi + 0x18], rbx",
    "mov [rdi + 0x28], rbp",
    "mov [rdi + 0x30], rsi",
    "mov [rdi + 0x40], r8",
    "mov [rdi + 0x48], r9",
    "mov [rdi + 0x50], r10",
    "mov [rdi + 0x58], r11",
    "mov [rdi + 0x60], r12",
    "mov [rdi + 0x68], r13",
    "mov [rdi + 0x70], r14",
    "mov [rdi + 0x78], r15",
    "pop rax",
    "mov [rdi + 0x38], rax",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "xor eax, eax",
    "ret",
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn purevisor_vmx_entry(regs: *mut GuestRegisters, launched: u32) -> u64;
}

/// Raw exit information captured after a VM exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitInfo {
    pub reason: u32,
    pub qualification: u64,
    pub guest_linear: u64,
    pub guest_physical: u64,
}

/// A virtual CPU and the VMX structures it exclusively owns.
pub struct Vcpu<'p, M: PhysMapper> {
    pub id: u32,
    pub vm_id: u32,
    pub state: VcpuState,
    pmm: &'p PhysicalMemoryManager<M>,
    vmxon_phys: PhysicalAddress,
    vmcs_phys: PhysicalAddress,
    io_bitmap_a_phys: PhysicalAddress,
    io_bitmap_b_phys: PhysicalAddress,
    msr_bitmap_phys: PhysicalAddress,
    pub eptp: u64,
    pub regs: GuestRegisters,
    pub last_exit: ExitInfo,
    pub launched: bool,
    pub exit_count: u64,
    pub entry_failures: u64,
    /// Physical CPU this VCPU last ran on, if pinned.
    pub host_cpu: Option<u32>,
}

impl<'p, M: PhysMapper> Vcpu<'p, M> {
    /// Allocate the five backing regions. All are page-aligned and zeroed;
    /// the I/O and MSR bitmaps start with every bit set (trap everything).
    pub fn new(
        pmm: &'p PhysicalMemoryManager<M>,
        vm_id: u32,
        vcpu_id: u32,
    ) -> Result<Self, VcpuError> {
        let mut regions = [0u64; 5];
        for i in 0..regions.len() {
            match pmm.alloc_pages(0) {
                Ok(pa) => {
                    unsafe {
                        core::ptr::write_bytes(pmm.mapper().phys_to_virt(pa), 0, PAGE_SIZE)
                    };
                    regions[i] = pa;
                }
                Err(_) => {
                    for &freed in &regions[..i] {
                        pmm.free_pages(freed, 0);
                    }
                    log_error!("vcpu {}: region allocation failed", vcpu_id);
                    return Err(VcpuError::AllocationFailed);
                }
            }
        }
        let [vmxon, vmcs, io_a, io_b, msr] = regions;
        // Trap every I/O port and every MSR until policy opens holes.
        for bitmap in [io_a, io_b, msr] {
            unsafe { core::ptr::write_bytes(pmm.mapper().phys_to_virt(bitmap), 0xFF, PAGE_SIZE) };
        }
        log!("vcpu {}: created for vm {}", vcpu_id, vm_id);
        Ok(Vcpu {
            id: vcpu_id,
            vm_id,
            state: VcpuState::Created,
            pmm,
            vmxon_phys: vmxon,
            vmcs_phys: vmcs,
            io_bitmap_a_phys: io_a,
            io_bitmap_b_phys: io_b,
            msr_bitmap_phys: msr,
            eptp: 0,
            regs: GuestRegisters::default(),
            last_exit: ExitInfo::default(),
            launched: false,
            exit_count: 0,
            entry_failures: 0,
            host_cpu: None,
        })
    }

    pub fn vmxon_phys(&self) -> PhysicalAddress {
        self.vmxon_phys
    }

    pub fn vmcs_phys(&self) -> PhysicalAddress {
        self.vmcs_phys
    }

    /// Stop trapping one I/O port: clear its bit in bitmap A (ports
    /// 0x0000..=0x7FFF) or B (0x8000..=0xFFFF).
    pub fn pass_through_port(&mut self, port: u16) {
        let (region, index) = if port < 0x8000 {
            (self.io_bitmap_a_phys, port as usize)
        } else {
            (self.io_bitmap_b_phys, port as usize - 0x8000)
        };
        let bitmap = self.pmm.mapper().phys_to_virt(region);
        unsafe {
            let byte = bitmap.add(index / 8);
            byte.write(byte.read() & !(1 << (index % 8)));
        }
    }

    /// Stop trapping one MSR for reads and writes. The bitmap holds four
    /// 1 KiB windows: read-low, read-high, write-low, write-high.
    pub fn pass_through_msr(&mut self, msr: u32) {
        let (low_base, index) = match msr {
            0..=0x1FFF => (0usize, msr as usize),
            0xC000_0000..=0xC000_1FFF => (0x400, (msr - 0xC000_0000) as usize),
            _ => return,
        };
        let bitmap = self.pmm.mapper().phys_to_virt(self.msr_bitmap_phys);
        for window in [low_base, low_base + 0x800] {
            unsafe {
                let byte = bitmap.add(window + index / 8);
                byte.write(byte.read() & !(1 << (index % 8)));
            }
        }
    }

    /// Queue an external interrupt for delivery at the next VM entry and
    /// wake the VCPU if it was parked in HLT.
    pub fn inject_interrupt<V: VmcsAccess>(
        &mut self,
        vmcs: &mut V,
        vector: u8,
    ) -> Result<(), VcpuError> {
        const INTR_INFO_VALID: u64 = 1 << 31;
        // Interruption type (bits 10:8) zero = external interrupt.
        vmcs.write(
            VmcsField::ENTRY_INTR_INFO,
            INTR_INFO_VALID | vector as u64,
        )?;
        if self.state == VcpuState::Halted {
            self.state = VcpuState::Running;
        }
        Ok(())
    }

    /// Populate the host-state area from a live snapshot of this CPU.
    pub fn setup_host_state<V: VmcsAccess>(
        &self,
        vmcs: &mut V,
        host: &HostState,
    ) -> Result<(), VcpuError> {
        vmcs.write(VmcsField::HOST_CR0, host.cr0)?;
        vmcs.write(VmcsField::HOST_CR3, host.cr3)?;
        vmcs.write(VmcsField::HOST_CR4, host.cr4)?;
        vmcs.write(VmcsField::HOST_CS_SELECTOR, host.cs as u64)?;
        vmcs.write(VmcsField::HOST_SS_SELECTOR, host.ss as u64)?;
        vmcs.write(VmcsField::HOST_DS_SELECTOR, host.ds as u64)?;
        vmcs.write(VmcsField::HOST_ES_SELECTOR, host.es as u64)?;
        vmcs.write(VmcsField::HOST_FS_SELECTOR, host.fs as u64)?;
        vmcs.write(VmcsField::HOST_GS_SELECTOR, host.gs as u64)?;
        vmcs.write(VmcsField::HOST_TR_SELECTOR, host.tr as u64)?;
        vmcs.write(VmcsField::HOST_FS_BASE, host.fs_base)?;
        vmcs.write(VmcsField::HOST_GS_BASE, host.gs_base)?;
        vmcs.write(VmcsField::HOST_TR_BASE, 0)?;
        vmcs.write(VmcsField::HOST_GDTR_BASE, host.gdtr_base)?;
        vmcs.write(VmcsField::HOST_IDTR_BASE, host.idtr_base)?;
        vmcs.write(VmcsField::HOST_SYSENTER_CS, host.sysenter_cs)?;
        vmcs.write(VmcsField::HOST_SYSENTER_ESP, host.sysenter_esp)?;
        vmcs.write(VmcsField::HOST_SYSENTER_EIP, host.sysenter_eip)?;
        vmcs.write(VmcsField::HOST_IA32_EFER, host.efer)?;
        // HOST_RSP/HOST_RIP are rewritten by the entry stub on every entry.
        Ok(())
    }

    /// Populate the guest-state area: protected mode with flat 16-bit
    /// real-mode-style segments so BIOS-style code at 0x7C00 executes.
    pub fn setup_guest_state<V: VmcsAccess>(&self, vmcs: &mut V) -> Result<(), VcpuError> {
        const CR0_PE: u64 = 1 << 0;
        const CR0_ET: u64 = 1 << 4;
        const CR0_NE: u64 = 1 << 5;
        const CR0_PG: u64 = 1 << 31;
        const CR4_VMXE: u64 = 1 << 13;

        vmcs.write(VmcsField::GUEST_CR0, CR0_PE | CR0_NE | CR0_ET)?;
        vmcs.write(VmcsField::GUEST_CR3, 0)?;
        vmcs.write(VmcsField::GUEST_CR4, CR4_VMXE)?;
        // The guest reads pre-protected-mode values through the shadows.
        vmcs.write(VmcsField::CR0_READ_SHADOW, 0)?;
        vmcs.write(VmcsField::CR4_READ_SHADOW, 0)?;
        vmcs.write(VmcsField::CR0_GUEST_HOST_MASK, CR0_PE | CR0_PG)?;
        vmcs.write(VmcsField::CR4_GUEST_HOST_MASK, CR4_VMXE)?;

        vmcs.write(VmcsField::GUEST_DR7, 0x400)?;
        vmcs.write(VmcsField::GUEST_RFLAGS, 0x2)?;
        vmcs.write(VmcsField::GUEST_RIP, 0x7C00)?;
        vmcs.write(VmcsField::GUEST_RSP, 0x7000)?;

        let code_ar: u64 = 0x9B; // present, S, code, read, accessed
        let data_ar: u64 = 0x93; // present, S, data, write, accessed
        let segments = [
            (
                VmcsField::GUEST_CS_SELECTOR,
                VmcsField::GUEST_CS_BASE,
                VmcsField::GUEST_CS_LIMIT,
                VmcsField::GUEST_CS_ACCESS,
                code_ar,
            ),
            (
                VmcsField::GUEST_SS_SELECTOR,
                VmcsField::GUEST_SS_BASE,
                VmcsField::GUEST_SS_LIMIT,
                VmcsField::GUEST_SS_ACCESS,
                data_ar,
            ),
            (
                VmcsField::GUEST_DS_SELECTOR,
                VmcsField::GUEST_DS_BASE,
                VmcsField::GUEST_DS_LIMIT,
                VmcsField::GUEST_DS_ACCESS,
                data_ar,
            ),
            (
                VmcsField::GUEST_ES_SELECTOR,
                VmcsField::GUEST_ES_BASE,
                VmcsField::GUEST_ES_LIMIT,
                VmcsField::GUEST_ES_ACCESS,
                data_ar,
            ),
            (
                VmcsField::GUEST_FS_SELECTOR,
                VmcsField::GUEST_FS_BASE,
                VmcsField::GUEST_FS_LIMIT,
                VmcsField::GUEST_FS_ACCESS,
                data_ar,
            ),
            (
                VmcsField::GUEST_GS_SELECTOR,
                VmcsField::GUEST_GS_BASE,
                VmcsField::GUEST_GS_LIMIT,
                VmcsField::GUEST_GS_ACCESS,
                data_ar,
            ),
        ];
        for (sel, base, limit, access, ar) in segments {
            vmcs.write(sel, 0)?;
            vmcs.write(base, 0)?;
            vmcs.write(limit, 0xFFFF)?;
            vmcs.write(access, ar)?;
        }

        vmcs.write(VmcsField::GUEST_LDTR_SELECTOR, 0)?;
        vmcs.write(VmcsField::GUEST_LDTR_BASE, 0)?;
        vmcs.write(VmcsField::GUEST_LDTR_LIMIT, 0)?;
        vmcs.write(VmcsField::GUEST_LDTR_ACCESS, 0x10000)?; // unusable

        vmcs.write(VmcsField::GUEST_TR_SELECTOR, 0)?;
        vmcs.write(VmcsField::GUEST_TR_BASE, 0)?;
        vmcs.write(VmcsField::GUEST_TR_LIMIT, 0xFF)?;
        vmcs.write(VmcsField::GUEST_TR_ACCESS, 0x8B)?; // 32-bit busy TSS

        vmcs.write(VmcsField::GUEST_GDTR_BASE, 0)?;
        vmcs.write(VmcsField::GUEST_GDTR_LIMIT, 0xFFFF)?;
        vmcs.write(VmcsField::GUEST_IDTR_BASE, 0)?;
        vmcs.write(VmcsField::GUEST_IDTR_LIMIT, 0xFFFF)?;

        vmcs.write(VmcsField::GUEST_SYSENTER_CS, 0)?;
        vmcs.write(VmcsField::GUEST_SYSENTER_ESP, 0)?;
        vmcs.write(VmcsField::GUEST_SYSENTER_EIP, 0)?;
        vmcs.write(VmcsField::GUEST_IA32_EFER, 0)?;

        vmcs.write(VmcsField::GUEST_INTERRUPTIBILITY, 0)?;
        vmcs.write(VmcsField::GUEST_ACTIVITY_STATE, 0)?;
        vmcs.write(VmcsField::GUEST_PENDING_DBG_EXCEPTIONS, 0)?;
        vmcs.write(VmcsField::VMCS_LINK_POINTER, u64::MAX)?;
        Ok(())
    }

    /// Install execution, exit and entry controls, adjusted through the
    /// capability masks, plus the bitmap and EPT pointers.
    pub fn setup_execution_controls<V: VmcsAccess>(
        &self,
        vmcs: &mut V,
        caps: &VmxCapabilities,
    ) -> Result<(), VcpuError> {
        let pin = caps.pin_based(vmx::PIN_BASED_EXT_INT_EXIT | vmx::PIN_BASED_NMI_EXIT);
        vmcs.write(VmcsField::PIN_BASED_CONTROLS, pin as u64)?;

        let proc = caps.proc_based(
            vmx::CPU_BASED_HLT_EXIT
                | vmx::CPU_BASED_IO_BITMAP
                | vmx::CPU_BASED_MSR_BITMAP
                | vmx::CPU_BASED_SECONDARY_CONTROLS,
        );
        vmcs.write(VmcsField::PRIMARY_PROC_CONTROLS, proc as u64)?;

        let mut proc2_req = 0;
        if caps.ept {
            proc2_req |= vmx::CPU_BASED2_EPT;
        }
        if caps.unrestricted_guest {
            proc2_req |= vmx::CPU_BASED2_UNRESTRICTED_GUEST;
        }
        let proc2 = caps.proc_based2(proc2_req);
        vmcs.write(VmcsField::SECONDARY_PROC_CONTROLS, proc2 as u64)?;

        let exit = caps.exit_controls(
            vmx::EXIT_CTRL_HOST_ADDR_SPACE
                | vmx::EXIT_CTRL_SAVE_IA32_EFER
                | vmx::EXIT_CTRL_LOAD_IA32_EFER
                | vmx::EXIT_CTRL_ACK_INT_ON_EXIT,
        );
        vmcs.write(VmcsField::EXIT_CONTROLS, exit as u64)?;

        let entry = caps.entry_controls(vmx::ENTRY_CTRL_LOAD_IA32_EFER);
        vmcs.write(VmcsField::ENTRY_CONTROLS, entry as u64)?;

        vmcs.write(VmcsField::EXCEPTION_BITMAP, 0)?;
        vmcs.write(VmcsField::PAGE_FAULT_ERROR_MASK, 0)?;
        vmcs.write(VmcsField::PAGE_FAULT_ERROR_MATCH, 0)?;
        vmcs.write(VmcsField::CR3_TARGET_COUNT, 0)?;
        vmcs.write(VmcsField::EXIT_MSR_STORE_COUNT, 0)?;
        vmcs.write(VmcsField::EXIT_MSR_LOAD_COUNT, 0)?;
        vmcs.write(VmcsField::ENTRY_MSR_LOAD_COUNT, 0)?;

        vmcs.write(VmcsField::IO_BITMAP_A, self.io_bitmap_a_phys)?;
        vmcs.write(VmcsField::IO_BITMAP_B, self.io_bitmap_b_phys)?;
        vmcs.write(VmcsField::MSR_BITMAP, self.msr_bitmap_phys)?;

        if self.eptp != 0 {
            vmcs.write(VmcsField::EPT_POINTER, self.eptp)?;
        }
        Ok(())
    }

    /// Full VMCS population: host state, guest state and controls.
    pub fn setup_vmcs<V: VmcsAccess>(
        &self,
        vmcs: &mut V,
        caps: &VmxCapabilities,
        host: &HostState,
    ) -> Result<(), VcpuError> {
        self.setup_host_state(vmcs, host)?;
        self.setup_guest_state(vmcs)?;
        self.setup_execution_controls(vmcs, caps)?;
        Ok(())
    }

    /// VMCLEAR + VMPTRLD this VCPU's region and populate every VMCS area.
    ///
    /// # Safety
    /// Requires VMX root operation on the current CPU; the VMCS stays
    /// current afterwards.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn init_vmcs(&mut self, caps: &VmxCapabilities) -> Result<(), VcpuError> {
        use purevisor_hal::arch::x86_64::vmcs::{HwVmcs, VmcsRegion};
        let region = unsafe {
            VmcsRegion::new(
                self.pmm.mapper().phys_to_virt(self.vmcs_phys),
                self.vmcs_phys,
                caps.vmcs_revision,
            )
        };
        unsafe {
            region.clear()?;
            region.load()?;
        }
        let host = purevisor_hal::cpu::capture_host_state();
        self.setup_vmcs(&mut HwVmcs, caps, &host)?;
        self.launched = false;
        Ok(())
    }

    /// Enter the guest and return the raw exit reason. First entry uses
    /// VMLAUNCH, later ones VMRESUME.
    ///
    /// # Safety
    /// This VCPU's VMCS must be current on this CPU and fully populated.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn run(&mut self) -> Result<u32, VcpuError> {
        use purevisor_hal::arch::x86_64::vmcs::HwVmcs;
        self.state = VcpuState::Running;
        let failed = unsafe { purevisor_vmx_entry(&mut self.regs, self.launched as u32) };
        let vmcs = HwVmcs;
        if failed != 0 {
            let error = vmcs.read(VmcsField::VM_INSTRUCTION_ERROR).unwrap_or(0);
            self.entry_failures += 1;
            self.state = VcpuState::Shutdown;
            log_error!("vcpu {}: vm entry failed, error={}", self.id, error);
            return Err(VcpuError::EntryFailed(error));
        }
        self.launched = true;
        self.last_exit = ExitInfo {
            reason: vmcs.read(VmcsField::EXIT_REASON)? as u32,
            qualification: vmcs.read(VmcsField::EXIT_QUALIFICATION)?,
            guest_linear: vmcs.read(VmcsField::GUEST_LINEAR_ADDRESS)?,
            guest_physical: vmcs.read(VmcsField::GUEST_PHYSICAL_ADDRESS)?,
        };
        self.regs.rip = vmcs.read(VmcsField::GUEST_RIP)?;
        self.regs.rsp = vmcs.read(VmcsField::GUEST_RSP)?;
        self.regs.rflags = vmcs.read(VmcsField::GUEST_RFLAGS)?;
        self.exit_count += 1;
        Ok(self.last_exit.reason)
    }
}

impl<M: PhysMapper> Drop for Vcpu<'_, M> {
    fn drop(&mut self) {
        for pa in [
            self.msr_bitmap_phys,
            self.io_bitmap_b_phys,
            self.io_bitmap_a_phys,
            self.vmcs_phys,
            self.vmxon_phys,
        ] {
            self.pmm.free_pages(pa, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockVmcs, TestRam};

    #[test]
    fn vcpu_owns_unique_page_aligned_regions() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let a = Vcpu::new(&pmm, 1, 0).unwrap();
        let b = Vcpu::new(&pmm, 1, 1).unwrap();
        let mut all = [
            a.vmxon_phys,
            a.vmcs_phys,
            a.io_bitmap_a_phys,
            a.io_bitmap_b_phys,
            a.msr_bitmap_phys,
            b.vmxon_phys,
            b.vmcs_phys,
            b.io_bitmap_a_phys,
            b.io_bitmap_b_phys,
            b.msr_bitmap_phys,
        ];
        for pa in all {
            assert_eq!(pa as usize % PAGE_SIZE, 0);
        }
        all.sort_unstable();
        for pair in all.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn vmcs_setup_writes_expected_guest_state() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = Vcpu::new(&pmm, 1, 0).unwrap();
        vcpu.eptp = 0xDEAD_B000 | 6 | (3 << 3);

        let caps = VmxCapabilities {
            pin_allowed1: u32::MAX,
            proc_allowed1: u32::MAX,
            proc2_allowed1: u32::MAX,
            exit_allowed1: u32::MAX,
            entry_allowed1: u32::MAX,
            ept: true,
            unrestricted_guest: true,
            ..VmxCapabilities::default()
        };
        let mut vmcs = MockVmcs::default();
        vcpu.setup_vmcs(&mut vmcs, &caps, &HostState::default()).unwrap();

        assert_eq!(vmcs.read(VmcsField::GUEST_RIP).unwrap(), 0x7C00);
        assert_eq!(vmcs.read(VmcsField::GUEST_RSP).unwrap(), 0x7000);
        assert_eq!(vmcs.read(VmcsField::GUEST_DR7).unwrap(), 0x400);
        assert_eq!(vmcs.read(VmcsField::GUEST_RFLAGS).unwrap(), 0x2);
        assert_eq!(vmcs.read(VmcsField::VMCS_LINK_POINTER).unwrap(), u64::MAX);
        assert_eq!(vmcs.read(VmcsField::EPT_POINTER).unwrap(), vcpu.eptp);
        // HLT exiting + bitmaps + secondary controls requested.
        let proc = vmcs.read(VmcsField::PRIMARY_PROC_CONTROLS).unwrap() as u32;
        assert_ne!(proc & vmx::CPU_BASED_HLT_EXIT, 0);
        assert_ne!(proc & vmx::CPU_BASED_IO_BITMAP, 0);
        assert_ne!(proc & vmx::CPU_BASED_MSR_BITMAP, 0);
    }

    #[test]
    fn port_pass_through_clears_the_bitmap_bit() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = Vcpu::new(&pmm, 1, 0).unwrap();

        let bit = |phys: u64, index: usize| {
            let p = pmm.mapper().phys_to_virt(phys);
            (unsafe { p.add(index / 8).read() }) & (1 << (index % 8)) != 0
        };

        assert!(bit(vcpu.io_bitmap_a_phys, 0x3F8));
        vcpu.pass_through_port(0x3F8);
        assert!(!bit(vcpu.io_bitmap_a_phys, 0x3F8));
        // Neighbors still trap.
        assert!(bit(vcpu.io_bitmap_a_phys, 0x3F9));

        vcpu.pass_through_port(0x8004);
        assert!(!bit(vcpu.io_bitmap_b_phys, 4));
    }

    #[test]
    fn interrupt_injection_wakes_a_halted_vcpu() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vcpu = Vcpu::new(&pmm, 1, 0).unwrap();
        vcpu.state = VcpuState::Halted;

        let mut vmcs = MockVmcs::default();
        vcpu.inject_interrupt(&mut vmcs, 0x20).unwrap();
        assert_eq!(vcpu.state, VcpuState::Running);
        let info = vmcs.read(VmcsField::ENTRY_INTR_INFO).unwrap();
        assert_eq!(info & 0xFF, 0x20);
        assert_ne!(info & (1 << 31), 0);
    }
}
