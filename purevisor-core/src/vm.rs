//! A virtual machine at the VMX level: one shared EPT hierarchy plus the
//! VCPUs that run against it. Guest RAM frames are handed to the VM by its
//! creator (typically the VM manager) and mapped through the EPT; every
//! VCPU added to the VM is stamped with the VM's EPTP.

use alloc::vec::Vec;

use purevisor_hal::arch::x86_64::ept::{EptContext, EptError, EptFlags, EPT_MEMTYPE_WB};
use purevisor_hal::memory::{PhysMapper, PhysicalAddress, PAGE_SIZE};

use crate::pmm::PhysicalMemoryManager;
use crate::vcpu::{Vcpu, VcpuError};
use crate::log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Ept(EptError),
    Vcpu(VcpuError),
    /// Guest-physical address is not mapped
    NotMapped,
}

impl From<EptError> for VmError {
    fn from(e: EptError) -> Self {
        VmError::Ept(e)
    }
}

impl From<VcpuError> for VmError {
    fn from(e: VcpuError) -> Self {
        VmError::Vcpu(e)
    }
}

/// A VMX-level virtual machine.
pub struct Vm<'p, M: PhysMapper> {
    pub id: u32,
    pub name: heapless::String<64>,
    pub mem_base: PhysicalAddress,
    pub mem_size: u64,
    pmm: &'p PhysicalMemoryManager<M>,
    ept: EptContext,
    vcpus: Vec<Vcpu<'p, M>>,
}

impl<'p, M: PhysMapper> Vm<'p, M> {
    pub fn new(
        pmm: &'p PhysicalMemoryManager<M>,
        id: u32,
        name: &str,
    ) -> Result<Self, VmError> {
        let ept = EptContext::new(pmm)?;
        let mut n = heapless::String::new();
        let _ = n.push_str(name);
        log!("vm {}: created '{}' (eptp={:#x})", id, name, ept.eptp());
        Ok(Vm {
            id,
            name: n,
            mem_base: 0,
            mem_size: 0,
            pmm,
            ept,
            vcpus: Vec::new(),
        })
    }

    pub fn eptp(&self) -> u64 {
        self.ept.eptp()
    }

    pub fn ept(&mut self) -> &mut EptContext {
        &mut self.ept
    }

    pub fn vcpus(&self) -> &[Vcpu<'p, M>] {
        &self.vcpus
    }

    pub fn vcpus_mut(&mut self) -> &mut [Vcpu<'p, M>] {
        &mut self.vcpus
    }

    /// Create a VCPU bound to this VM. Its EPTP is the VM's.
    pub fn add_vcpu(&mut self) -> Result<&mut Vcpu<'p, M>, VmError> {
        let vcpu_id = self.vcpus.len() as u32;
        let mut vcpu = Vcpu::new(self.pmm, self.id, vcpu_id)?;
        vcpu.eptp = self.ept.eptp();
        self.vcpus.push(vcpu);
        Ok(self.vcpus.last_mut().expect("just pushed"))
    }

    /// Map `[guest_base, guest_base+size)` onto host frames starting at
    /// `host_phys`, read/write/execute, write-back.
    pub fn map_memory(
        &mut self,
        guest_base: u64,
        host_phys: PhysicalAddress,
        size: u64,
    ) -> Result<(), VmError> {
        self.ept.map_range(
            self.pmm,
            guest_base,
            host_phys,
            size,
            EptFlags::READ | EptFlags::WRITE | EptFlags::EXECUTE,
            EPT_MEMTYPE_WB,
        )?;
        if self.mem_size == 0 {
            self.mem_base = guest_base;
        }
        self.mem_size += size;
        Ok(())
    }

    /// Copy bytes into guest-physical memory, resolving page by page
    /// through the EPT.
    pub fn write_guest(&self, gpa: u64, bytes: &[u8]) -> Result<(), VmError> {
        self.copy_guest(gpa, bytes.len(), |host, chunk_off, chunk| unsafe {
            core::ptr::copy_nonoverlapping(bytes[chunk_off..].as_ptr(), host, chunk);
        })
    }

    /// Copy bytes out of guest-physical memory.
    pub fn read_guest(&self, gpa: u64, out: &mut [u8]) -> Result<(), VmError> {
        let len = out.len();
        let out_ptr = out.as_mut_ptr();
        self.copy_guest(gpa, len, |host, chunk_off, chunk| unsafe {
            core::ptr::copy_nonoverlapping(host, out_ptr.add(chunk_off), chunk);
        })
    }

    fn copy_guest(
        &self,
        mut gpa: u64,
        len: usize,
        mut op: impl FnMut(*mut u8, usize, usize),
    ) -> Result<(), VmError> {
        let mut done = 0usize;
        while done < len {
            let host = self
                .ept
                .translate(self.pmm, gpa)
                .ok_or(VmError::NotMapped)?;
            let page_left = PAGE_SIZE - (gpa as usize & (PAGE_SIZE - 1));
            let chunk = page_left.min(len - done);
            op(self.pmm.mapper().phys_to_virt(host), done, chunk);
            gpa += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    /// Tear the VM down: drop the VCPUs (their regions return to the PMM)
    /// and free the whole EPT hierarchy.
    pub fn destroy(mut self) {
        self.vcpus.clear();
        self.ept.destroy(self.pmm);
        log!("vm {}: destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestRam;

    #[test]
    fn vcpus_share_the_vm_eptp() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vm = Vm::new(&pmm, 1, "guest0").unwrap();
        let eptp = vm.eptp();
        vm.add_vcpu().unwrap();
        vm.add_vcpu().unwrap();
        assert!(vm.vcpus().iter().all(|v| v.eptp == eptp));
        vm.destroy();
    }

    #[test]
    fn guest_memory_round_trip() {
        let ram = TestRam::new(32 * 1024 * 1024);
        let pmm = ram.pmm();
        let mut vm = Vm::new(&pmm, 1, "guest0").unwrap();

        let backing = pmm.alloc_pages(4).unwrap(); // 64 KiB
        vm.map_memory(0, backing, 16 * PAGE_SIZE as u64).unwrap();

        vm.write_guest(0x7C00, b"\x0f\xa2\xf4").unwrap();
        let mut buf = [0u8; 3];
        vm.read_guest(0x7C00, &mut buf).unwrap();
        assert_eq!(&buf, b"\x0f\xa2\xf4");

        // Unmapped accesses are refused.
        assert!(vm.write_guest(64 * PAGE_SIZE as u64, b"x").is_err());
        vm.destroy();
        pmm.free_pages(backing, 4);
    }
}
