//! Host 4-level page tables (PML4 → PDPT → PD → PT).
//!
//! Table frames come from a [`FrameSource`], so the same walker code builds
//! real higher-half tables on hardware and scratch tables inside a test
//! arena. The upper half of every context aliases the kernel context's PML4
//! entries; the lower half is per-context and is what `destroy` tears down.

use crate::memory::{FrameSource, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use bitflags::bitflags;

pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITABLE: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
pub const PTE_CACHE_DISABLE: u64 = 1 << 4;
pub const PTE_HUGE: u64 = 1 << 7;
pub const PTE_GLOBAL: u64 = 1 << 8;
pub const PTE_NO_EXECUTE: u64 = 1 << 63;
pub const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

pub const SIZE_2M: u64 = 2 * 1024 * 1024;
pub const SIZE_1G: u64 = 1024 * 1024 * 1024;

const ENTRIES: usize = 512;
/// First upper-half PML4 slot (kernel space).
const KERNEL_SPLIT: usize = 256;

bitflags! {
    /// Mapping request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const WRITE   = 1 << 0;
        const EXEC    = 1 << 1;
        const USER    = 1 << 2;
        const NOCACHE = 1 << 3;
        const GLOBAL  = 1 << 4;
        const HUGE_2M = 1 << 8;
        const HUGE_1G = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// Frame allocation for an intermediate table failed
    OutOfMemory,
    /// Address or size not aligned for the requested page size
    Misaligned,
}

#[inline]
fn pml4_index(va: VirtualAddress) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

#[inline]
fn pdpt_index(va: VirtualAddress) -> usize {
    ((va >> 30) & 0x1FF) as usize
}

#[inline]
fn pd_index(va: VirtualAddress) -> usize {
    ((va >> 21) & 0x1FF) as usize
}

#[inline]
fn pt_index(va: VirtualAddress) -> usize {
    ((va >> 12) & 0x1FF) as usize
}

fn flags_to_pte(flags: MapFlags) -> u64 {
    let mut pte = PTE_PRESENT;
    if flags.contains(MapFlags::WRITE) {
        pte |= PTE_WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        pte |= PTE_USER;
    }
    if !flags.contains(MapFlags::EXEC) {
        pte |= PTE_NO_EXECUTE;
    }
    if flags.contains(MapFlags::NOCACHE) {
        pte |= PTE_CACHE_DISABLE;
    }
    if flags.contains(MapFlags::GLOBAL) {
        pte |= PTE_GLOBAL;
    }
    pte
}

/// One virtual address-space context: the physical address of its PML4.
#[derive(Debug)]
pub struct AddressSpace {
    pml4: PhysicalAddress,
    /// Set once this context has been loaded into CR3; TLB maintenance is
    /// only issued for live contexts.
    live: bool,
}

impl AddressSpace {
    /// Allocate an empty context.
    pub fn new<F: FrameSource>(frames: &F) -> Result<Self, PagingError> {
        let pml4 = frames.alloc_frame().ok_or(PagingError::OutOfMemory)?;
        Ok(AddressSpace { pml4, live: false })
    }

    /// Allocate a context whose upper half aliases `kernel`'s PML4 entries.
    pub fn new_user<F: FrameSource>(
        frames: &F,
        kernel: &AddressSpace,
    ) -> Result<Self, PagingError> {
        let ctx = Self::new(frames)?;
        let dst = frames.table_ptr(ctx.pml4);
        let src = frames.table_ptr(kernel.pml4);
        for i in KERNEL_SPLIT..ENTRIES {
            unsafe { dst.add(i).write(src.add(i).read()) };
        }
        Ok(ctx)
    }

    /// Adopt the context currently loaded in CR3.
    ///
    /// # Safety
    /// Only meaningful in ring 0 on the boot path.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn from_current() -> Self {
        let (frame, _) = x86_64::registers::control::Cr3::read_raw();
        AddressSpace {
            pml4: frame.start_address().as_u64(),
            live: true,
        }
    }

    pub fn root(&self) -> PhysicalAddress {
        self.pml4
    }

    /// Walk to the entry for `va`, creating intermediate tables when
    /// `create`. Returns a pointer to the PTE, or to the huge-page entry
    /// that terminates the walk.
    fn walk<F: FrameSource>(&self, frames: &F, va: VirtualAddress, create: bool) -> Option<*mut u64> {
        let pml4 = frames.table_ptr(self.pml4);
        let pml4e = unsafe { pml4.add(pml4_index(va)) };
        let pdpt = self.next_table(frames, pml4e, create)?;

        let pdpte = unsafe { pdpt.add(pdpt_index(va)) };
        if unsafe { pdpte.read() } & PTE_HUGE != 0 {
            return Some(pdpte);
        }
        let pd = self.next_table(frames, pdpte, create)?;

        let pde = unsafe { pd.add(pd_index(va)) };
        if unsafe { pde.read() } & PTE_HUGE != 0 {
            return Some(pde);
        }
        let pt = self.next_table(frames, pde, create)?;

        Some(unsafe { pt.add(pt_index(va)) })
    }

    fn next_table<F: FrameSource>(
        &self,
        frames: &F,
        entry: *mut u64,
        create: bool,
    ) -> Option<*mut u64> {
        let value = unsafe { entry.read() };
        if value & PTE_PRESENT != 0 {
            return Some(frames.table_ptr(value & PTE_ADDR_MASK));
        }
        if !create {
            return None;
        }
        let table = frames.alloc_frame()?;
        unsafe { entry.write(table | PTE_PRESENT | PTE_WRITABLE | PTE_USER) };
        Some(frames.table_ptr(table))
    }

    /// Map `[virt, virt+size)` to `[phys, phys+size)`. Page size follows the
    /// `HUGE_*` hints for the aligned portions, 4 KiB for the rest.
    /// Overlapping an existing mapping is a caller bug, not a contract.
    pub fn map<F: FrameSource>(
        &mut self,
        frames: &F,
        mut virt: VirtualAddress,
        mut phys: PhysicalAddress,
        mut size: u64,
        flags: MapFlags,
    ) -> Result<(), PagingError> {
        if virt % PAGE_SIZE as u64 != 0 || phys % PAGE_SIZE as u64 != 0 {
            return Err(PagingError::Misaligned);
        }
        let pte_flags = flags_to_pte(flags);

        if flags.contains(MapFlags::HUGE_1G) {
            while size >= SIZE_1G && virt % SIZE_1G == 0 && phys % SIZE_1G == 0 {
                let pml4 = frames.table_ptr(self.pml4);
                let pml4e = unsafe { pml4.add(pml4_index(virt)) };
                let pdpt = self
                    .next_table(frames, pml4e, true)
                    .ok_or(PagingError::OutOfMemory)?;
                unsafe { pdpt.add(pdpt_index(virt)).write(phys | pte_flags | PTE_HUGE) };
                virt += SIZE_1G;
                phys += SIZE_1G;
                size -= SIZE_1G;
            }
        }

        if flags.contains(MapFlags::HUGE_2M) {
            while size >= SIZE_2M && virt % SIZE_2M == 0 && phys % SIZE_2M == 0 {
                let pml4 = frames.table_ptr(self.pml4);
                let pml4e = unsafe { pml4.add(pml4_index(virt)) };
                let pdpt = self
                    .next_table(frames, pml4e, true)
                    .ok_or(PagingError::OutOfMemory)?;
                let pdpte = unsafe { pdpt.add(pdpt_index(virt)) };
                let pd = self
                    .next_table(frames, pdpte, true)
                    .ok_or(PagingError::OutOfMemory)?;
                unsafe { pd.add(pd_index(virt)).write(phys | pte_flags | PTE_HUGE) };
                virt += SIZE_2M;
                phys += SIZE_2M;
                size -= SIZE_2M;
            }
        }

        while size > 0 {
            let pte = self
                .walk(frames, virt, true)
                .ok_or(PagingError::OutOfMemory)?;
            unsafe { pte.write(phys | pte_flags) };
            self.flush_one(virt);
            virt += PAGE_SIZE as u64;
            phys += PAGE_SIZE as u64;
            size = size.saturating_sub(PAGE_SIZE as u64);
        }
        Ok(())
    }

    /// Clear the entries covering `[virt, virt+size)`.
    pub fn unmap<F: FrameSource>(&mut self, frames: &F, mut virt: VirtualAddress, mut size: u64) {
        while size > 0 {
            if let Some(pte) = self.walk(frames, virt, false) {
                if unsafe { pte.read() } & PTE_PRESENT != 0 {
                    unsafe { pte.write(0) };
                    self.flush_one(virt);
                }
            }
            virt += PAGE_SIZE as u64;
            size = size.saturating_sub(PAGE_SIZE as u64);
        }
    }

    /// Resolve `virt` to a physical address, honoring huge-page stops.
    pub fn translate<F: FrameSource>(&self, frames: &F, va: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.walk(frames, va, false)?;
        let value = unsafe { entry.read() };
        if value & PTE_PRESENT == 0 {
            return None;
        }
        let base = value & PTE_ADDR_MASK;
        Some(match value & PTE_HUGE {
            0 => base | (va & (PAGE_SIZE as u64 - 1)),
            _ => {
                if self.is_1g_entry(frames, va) {
                    base | (va & (SIZE_1G - 1))
                } else {
                    base | (va & (SIZE_2M - 1))
                }
            }
        })
    }

    /// Whether the huge entry for `va` sits at the PDPT level.
    fn is_1g_entry<F: FrameSource>(&self, frames: &F, va: VirtualAddress) -> bool {
        let pml4 = frames.table_ptr(self.pml4);
        let pml4e = unsafe { pml4.add(pml4_index(va)).read() };
        if pml4e & PTE_PRESENT == 0 {
            return false;
        }
        let pdpt = frames.table_ptr(pml4e & PTE_ADDR_MASK);
        let pdpte = unsafe { pdpt.add(pdpt_index(va)).read() };
        pdpte & PTE_PRESENT != 0 && pdpte & PTE_HUGE != 0
    }

    /// Load this context into CR3.
    ///
    /// # Safety
    /// The context must map the currently executing code and stack.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn switch(&mut self) {
        self.live = true;
        unsafe { crate::cpu::write_cr3(self.pml4) };
    }

    #[inline]
    fn flush_one(&self, va: VirtualAddress) {
        #[cfg(target_arch = "x86_64")]
        if self.live {
            crate::cpu::invlpg(va);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = va;
    }

    /// Tear down the lower (user) half: walk PML4 entries 0..256, freeing
    /// every non-huge intermediate table, then release the PML4 itself.
    /// Upper-half entries are shared with the kernel context and are left
    /// untouched.
    pub fn destroy<F: FrameSource>(self, frames: &F) {
        let pml4 = frames.table_ptr(self.pml4);
        for i in 0..KERNEL_SPLIT {
            let pml4e = unsafe { pml4.add(i).read() };
            if pml4e & PTE_PRESENT == 0 {
                continue;
            }
            let pdpt_pa = pml4e & PTE_ADDR_MASK;
            let pdpt = frames.table_ptr(pdpt_pa);
            for j in 0..ENTRIES {
                let pdpte = unsafe { pdpt.add(j).read() };
                if pdpte & PTE_PRESENT == 0 || pdpte & PTE_HUGE != 0 {
                    continue;
                }
                let pd_pa = pdpte & PTE_ADDR_MASK;
                let pd = frames.table_ptr(pd_pa);
                for k in 0..ENTRIES {
                    let pde = unsafe { pd.add(k).read() };
                    if pde & PTE_PRESENT == 0 || pde & PTE_HUGE != 0 {
                        continue;
                    }
                    frames.free_frame(pde & PTE_ADDR_MASK);
                }
                frames.free_frame(pd_pa);
            }
            frames.free_frame(pdpt_pa);
        }
        frames.free_frame(self.pml4);
    }
}
