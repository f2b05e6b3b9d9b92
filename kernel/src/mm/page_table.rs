//! Two-level page tables and the software page walker.
//!
//! Page directories and page tables are real frames in simulated
//! physical memory: 1024 word-sized entries each, exactly what a 32-bit
//! hardware walker would traverse. [`PageDir::sw_vtop`] performs the
//! walk in pure software, which is how the kernel resolves addresses
//! without trusting the MMU.

use alloc::vec::Vec;

use super::{frame, phys, FrameNumber, PhysAddr, Pte, PteFlags, VirtAddr};
use crate::error::{KernelError, KernelResult};
use crate::param::{KERNBASE, NPTENTRIES};

/// Page-directory index of a virtual address.
const fn pdx(va: u32) -> u32 {
    (va >> 22) & 0x3FF
}

/// Page-table index of a virtual address.
const fn ptx(va: u32) -> u32 {
    (va >> 12) & 0x3FF
}

/// Location of one PTE inside a page-table frame.
///
/// A stand-in for the `*mut Pte` a bare-metal walker returns; reads and
/// writes go through simulated physical memory.
#[derive(Debug, Clone, Copy)]
pub struct PteSlot(PhysAddr);

impl PteSlot {
    pub fn get(&self) -> Pte {
        Pte::from_raw(phys::read_u32(self.0))
    }

    pub fn set(&self, pte: Pte) {
        phys::write_u32(self.0, pte.raw());
    }
}

/// Handle to a process page directory (the frame holding its PDEs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDir {
    root: FrameNumber,
}

impl PageDir {
    /// Allocate an empty page directory.
    pub fn new() -> KernelResult<PageDir> {
        let root = frame::kalloc(false).ok_or(KernelError::OutOfFrames)?;
        Ok(PageDir { root })
    }

    pub const fn root(&self) -> FrameNumber {
        self.root
    }

    fn pde_slot(&self, va: VirtAddr) -> PteSlot {
        PteSlot(self.root.as_addr().offset(pdx(va.as_u32()) * 4))
    }

    /// Find the PTE slot for `va`.
    ///
    /// With `alloc`, a missing page table is created (and the PDE set
    /// present/writable/user); without it, `Ok(None)` reports the absent
    /// level. Allocation failure propagates.
    pub fn walk(&self, va: VirtAddr, alloc: bool) -> KernelResult<Option<PteSlot>> {
        let pde_slot = self.pde_slot(va);
        let pde = pde_slot.get();
        let table = if pde.is_present() {
            pde.addr().frame()
        } else if alloc {
            let table = frame::kalloc(false).ok_or(KernelError::OutOfFrames)?;
            pde_slot.set(Pte::new(
                table.as_addr(),
                PteFlags::P | PteFlags::W | PteFlags::U,
            ));
            table
        } else {
            return Ok(None);
        };
        Ok(Some(PteSlot(
            table.as_addr().offset(ptx(va.as_u32()) * 4),
        )))
    }

    /// Pure-software address translation.
    ///
    /// Walks PDE then PTE without touching the hardware walker and
    /// returns the physical address (frame base plus page offset) and
    /// the PTE flags. `None` when any level is absent; a PTE counts as
    /// mapped when it carries `PTE_P` or `PTE_T`.
    pub fn sw_vtop(&self, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        let pde = self.pde_slot(va).get();
        if !pde.is_present() {
            return None;
        }
        let slot = PteSlot(pde.addr().offset(ptx(va.as_u32()) * 4));
        let pte = slot.get();
        if !pte.is_mapped() {
            return None;
        }
        Some((pte.addr().offset(va.page_offset()), pte.flags()))
    }

    /// Install a mapping for one page. Panics on remap; unmapping is
    /// explicit in this kernel.
    pub fn map(&self, va: VirtAddr, target: FrameNumber, flags: PteFlags) -> KernelResult<()> {
        let slot = self
            .walk(va.page_base(), true)?
            .expect("walk with alloc always yields a slot");
        let old = slot.get();
        assert!(old.is_zero(), "remap of va 0x{:x}", va.as_u32());
        slot.set(Pte::new(target.as_addr(), flags));
        Ok(())
    }

    /// Remove the mapping for one page, returning the old PTE if any.
    pub fn unmap(&self, va: VirtAddr) -> Option<Pte> {
        let slot = self.walk(va.page_base(), false).ok()??;
        let old = slot.get();
        if old.is_zero() {
            return None;
        }
        slot.set(Pte::ZERO);
        Some(old)
    }

    /// Collect every mapped user page below `end` as `(va, pte)`.
    ///
    /// Used by fork and exit; skips absent page tables wholesale.
    pub fn user_mappings(&self, end: VirtAddr) -> Vec<(VirtAddr, Pte)> {
        let mut out = Vec::new();
        let limit = end.as_u32().min(KERNBASE);
        let mut dir = 0u32;
        while dir < NPTENTRIES as u32 {
            let base = dir << 22;
            if base >= limit {
                break;
            }
            let pde = PteSlot(self.root.as_addr().offset(dir * 4)).get();
            if pde.is_present() {
                for idx in 0..NPTENTRIES as u32 {
                    let va = base | (idx << 12);
                    if va >= limit {
                        break;
                    }
                    let pte = PteSlot(pde.addr().offset(idx * 4)).get();
                    if pte.is_mapped() {
                        out.push((VirtAddr::new(va), pte));
                    }
                }
            }
            dir += 1;
        }
        out
    }

    /// Free the paging structures themselves (not the mapped frames —
    /// callers release those first via the frame tracker).
    pub fn free(self) {
        for dir in 0..NPTENTRIES as u32 {
            let pde = PteSlot(self.root.as_addr().offset(dir * 4)).get();
            if pde.is_present() {
                frame::kfree(pde.addr().frame());
            }
        }
        frame::kfree(self.root);
    }
}
