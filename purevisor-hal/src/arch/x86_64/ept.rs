//! Extended Page Tables: guest-physical → host-physical translation.
//!
//! Same four-level walk as host paging but with independent R/W/X bits and
//! a memory-type field in leaf entries. Table frames come from a
//! [`FrameSource`]; upper-level present entries always carry R+W+X so the
//! leaf alone governs guest access.

use crate::memory::{FrameSource, PhysicalAddress, PAGE_SIZE};
use bitflags::bitflags;

bitflags! {
    /// EPT entry permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const LARGE   = 1 << 7;
    }
}

/// EPT memory types (bits 5:3 of leaf entries).
pub const EPT_MEMTYPE_UC: u64 = 0;
pub const EPT_MEMTYPE_WB: u64 = 6;
const MEMTYPE_SHIFT: u64 = 3;

/// EPTP flags: write-back paging-structure memory type, 4-level walk.
const EPTP_MEMTYPE_WB: u64 = 6;
const EPTP_WALK_LENGTH_4: u64 = 3 << 3;

const ENTRIES: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const PERM_MASK: u64 = 0x7;

pub const EPT_SIZE_2M: u64 = 2 * 1024 * 1024;
pub const EPT_SIZE_1G: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptError {
    OutOfMemory,
    Misaligned,
    NotMapped,
}

#[inline]
fn pml4_index(gpa: u64) -> usize {
    ((gpa >> 39) & 0x1FF) as usize
}

#[inline]
fn pdpt_index(gpa: u64) -> usize {
    ((gpa >> 30) & 0x1FF) as usize
}

#[inline]
fn pd_index(gpa: u64) -> usize {
    ((gpa >> 21) & 0x1FF) as usize
}

#[inline]
fn pt_index(gpa: u64) -> usize {
    ((gpa >> 12) & 0x1FF) as usize
}

/// An owned EPT hierarchy plus its EPTP encoding.
#[derive(Debug)]
pub struct EptContext {
    pml4: PhysicalAddress,
    mapped_pages: u64,
}

impl EptContext {
    pub fn new<F: FrameSource>(frames: &F) -> Result<Self, EptError> {
        let pml4 = frames.alloc_frame().ok_or(EptError::OutOfMemory)?;
        Ok(EptContext {
            pml4,
            mapped_pages: 0,
        })
    }

    pub fn root(&self) -> PhysicalAddress {
        self.pml4
    }

    /// EPTP value: root | write-back | 4-level walk.
    pub fn eptp(&self) -> u64 {
        self.pml4 | EPTP_MEMTYPE_WB | EPTP_WALK_LENGTH_4
    }

    /// Number of 4 KiB pages currently mapped (huge pages count as their
    /// 4 KiB equivalent).
    pub fn mapped_pages(&self) -> u64 {
        self.mapped_pages
    }

    fn next_table<F: FrameSource>(
        &self,
        frames: &F,
        entry: *mut u64,
        create: bool,
    ) -> Option<*mut u64> {
        let value = unsafe { entry.read() };
        if value & PERM_MASK != 0 {
            return Some(frames.table_ptr(value & ADDR_MASK));
        }
        if !create {
            return None;
        }
        let table = frames.alloc_frame()?;
        let rwx = (EptFlags::READ | EptFlags::WRITE | EptFlags::EXECUTE).bits();
        unsafe { entry.write(table | rwx) };
        Some(frames.table_ptr(table))
    }

    /// Walk to the leaf (or terminating large-page) entry for `gpa`.
    /// `out_level` receives 1 (4K), 2 (2M) or 3 (1G).
    fn walk<F: FrameSource>(
        &self,
        frames: &F,
        gpa: u64,
        create: bool,
        out_level: Option<&mut u32>,
    ) -> Option<*mut u64> {
        let pml4 = frames.table_ptr(self.pml4);
        let pml4e = unsafe { pml4.add(pml4_index(gpa)) };
        let pdpt = self.next_table(frames, pml4e, create)?;

        let pdpte = unsafe { pdpt.add(pdpt_index(gpa)) };
        if unsafe { pdpte.read() } & EptFlags::LARGE.bits() != 0 {
            if let Some(level) = out_level {
                *level = 3;
            }
            return Some(pdpte);
        }
        let pd = self.next_table(frames, pdpte, create)?;

        let pde = unsafe { pd.add(pd_index(gpa)) };
        if unsafe { pde.read() } & EptFlags::LARGE.bits() != 0 {
            if let Some(level) = out_level {
                *level = 2;
            }
            return Some(pde);
        }
        let pt = self.next_table(frames, pde, create)?;

        if let Some(level) = out_level {
            *level = 1;
        }
        Some(unsafe { pt.add(pt_index(gpa)) })
    }

    /// Map one 4 KiB guest page.
    pub fn map_4k<F: FrameSource>(
        &mut self,
        frames: &F,
        guest_phys: u64,
        host_phys: u64,
        perm: EptFlags,
        memtype: u64,
    ) -> Result<(), EptError> {
        let gpa = guest_phys & !(PAGE_SIZE as u64 - 1);
        let hpa = host_phys & !(PAGE_SIZE as u64 - 1);
        let entry = self
            .walk(frames, gpa, true, None)
            .ok_or(EptError::OutOfMemory)?;
        // Remapping an already-present page replaces the entry without
        // inflating the page count.
        if unsafe { entry.read() } & PERM_MASK == 0 {
            self.mapped_pages += 1;
        }
        unsafe { entry.write(hpa | perm.bits() | (memtype << MEMTYPE_SHIFT)) };
        Ok(())
    }

    /// Map one 2 MiB guest page at the PD level.
    pub fn map_2m<F: FrameSource>(
        &mut self,
        frames: &F,
        guest_phys: u64,
        host_phys: u64,
        perm: EptFlags,
        memtype: u64,
    ) -> Result<(), EptError> {
        let gpa = guest_phys & !(EPT_SIZE_2M - 1);
        let hpa = host_phys & !(EPT_SIZE_2M - 1);
        let pml4 = frames.table_ptr(self.pml4);
        let pml4e = unsafe { pml4.add(pml4_index(gpa)) };
        let pdpt = self
            .next_table(frames, pml4e, true)
            .ok_or(EptError::OutOfMemory)?;
        let pdpte = unsafe { pdpt.add(pdpt_index(gpa)) };
        let pd = self
            .next_table(frames, pdpte, true)
            .ok_or(EptError::OutOfMemory)?;
        unsafe {
            pd.add(pd_index(gpa)).write(
                hpa | perm.bits() | EptFlags::LARGE.bits() | (memtype << MEMTYPE_SHIFT),
            )
        };
        self.mapped_pages += 512;
        Ok(())
    }

    /// Map one 1 GiB guest page at the PDPT level.
    pub fn map_1g<F: FrameSource>(
        &mut self,
        frames: &F,
        guest_phys: u64,
        host_phys: u64,
        perm: EptFlags,
        memtype: u64,
    ) -> Result<(), EptError> {
        let gpa = guest_phys & !(EPT_SIZE_1G - 1);
        let hpa = host_phys & !(EPT_SIZE_1G - 1);
        let pml4 = frames.table_ptr(self.pml4);
        let pml4e = unsafe { pml4.add(pml4_index(gpa)) };
        let pdpt = self
            .next_table(frames, pml4e, true)
            .ok_or(EptError::OutOfMemory)?;
        unsafe {
            pdpt.add(pdpt_index(gpa)).write(
                hpa | perm.bits() | EptFlags::LARGE.bits() | (memtype << MEMTYPE_SHIFT),
            )
        };
        self.mapped_pages += 512 * 512;
        Ok(())
    }

    /// Map a range, preferring 2 MiB pages for naturally aligned sub-ranges
    /// and falling back to 4 KiB for the remainder.
    pub fn map_range<F: FrameSource>(
        &mut self,
        frames: &F,
        mut guest_phys: u64,
        mut host_phys: u64,
        mut size: u64,
        perm: EptFlags,
        memtype: u64,
    ) -> Result<(), EptError> {
        if guest_phys % PAGE_SIZE as u64 != 0 || host_phys % PAGE_SIZE as u64 != 0 {
            return Err(EptError::Misaligned);
        }
        while size >= EPT_SIZE_2M
            && guest_phys % EPT_SIZE_2M == 0
            && host_phys % EPT_SIZE_2M == 0
        {
            self.map_2m(frames, guest_phys, host_phys, perm, memtype)?;
            guest_phys += EPT_SIZE_2M;
            host_phys += EPT_SIZE_2M;
            size -= EPT_SIZE_2M;
        }
        while size > 0 {
            self.map_4k(frames, guest_phys, host_phys, perm, memtype)?;
            guest_phys += PAGE_SIZE as u64;
            host_phys += PAGE_SIZE as u64;
            size = size.saturating_sub(PAGE_SIZE as u64);
        }
        Ok(())
    }

    /// Clear the leaf entry for `guest_phys`; intermediate tables are left
    /// in place (lazy pruning).
    pub fn unmap<F: FrameSource>(&mut self, frames: &F, guest_phys: u64) -> Result<(), EptError> {
        let entry = self
            .walk(frames, guest_phys, false, None)
            .ok_or(EptError::NotMapped)?;
        let value = unsafe { entry.read() };
        if value & PERM_MASK == 0 {
            return Err(EptError::NotMapped);
        }
        unsafe { entry.write(0) };
        self.mapped_pages = self.mapped_pages.saturating_sub(1);
        Ok(())
    }

    /// Replace the permission bits of an existing mapping.
    pub fn set_permissions<F: FrameSource>(
        &mut self,
        frames: &F,
        guest_phys: u64,
        perm: EptFlags,
    ) -> Result<(), EptError> {
        let entry = self
            .walk(frames, guest_phys, false, None)
            .ok_or(EptError::NotMapped)?;
        let value = unsafe { entry.read() };
        unsafe { entry.write((value & !PERM_MASK) | (perm.bits() & PERM_MASK)) };
        Ok(())
    }

    /// Translate a guest-physical address, honoring large-page stops.
    pub fn translate<F: FrameSource>(&self, frames: &F, guest_phys: u64) -> Option<u64> {
        let mut level = 0u32;
        let entry = self.walk(frames, guest_phys, false, Some(&mut level))?;
        let value = unsafe { entry.read() };
        if value & PERM_MASK == 0 {
            return None;
        }
        let base = value & ADDR_MASK;
        Some(match level {
            3 => base | (guest_phys & (EPT_SIZE_1G - 1)),
            2 => base | (guest_phys & (EPT_SIZE_2M - 1)),
            _ => base | (guest_phys & (PAGE_SIZE as u64 - 1)),
        })
    }

    /// INVEPT single-context for this hierarchy.
    ///
    /// # Safety
    /// Requires VMX root operation with EPT enabled.
    pub unsafe fn invalidate(&self) {
        unsafe { super::vmx::invept_single_context(self.eptp()) };
    }

    /// Free every table in the hierarchy, walking all levels. Guest data
    /// frames referenced by leaf entries are not owned by the EPT and are
    /// left alone.
    pub fn destroy<F: FrameSource>(self, frames: &F) {
        let pml4 = frames.table_ptr(self.pml4);
        for i in 0..ENTRIES {
            let pml4e = unsafe { pml4.add(i).read() };
            if pml4e & PERM_MASK == 0 {
                continue;
            }
            let pdpt_pa = pml4e & ADDR_MASK;
            let pdpt = frames.table_ptr(pdpt_pa);
            for j in 0..ENTRIES {
                let pdpte = unsafe { pdpt.add(j).read() };
                if pdpte & PERM_MASK == 0 || pdpte & EptFlags::LARGE.bits() != 0 {
                    continue;
                }
                let pd_pa = pdpte & ADDR_MASK;
                let pd = frames.table_ptr(pd_pa);
                for k in 0..ENTRIES {
                    let pde = unsafe { pd.add(k).read() };
                    if pde & PERM_MASK == 0 || pde & EptFlags::LARGE.bits() != 0 {
                        continue;
                    }
                    frames.free_frame(pde & ADDR_MASK);
                }
                frames.free_frame(pd_pa);
            }
            frames.free_frame(pdpt_pa);
        }
        frames.free_frame(self.pml4);
    }
}
