//! Page-fault handler.
//!
//! The trap path hands every `T_PGFLT` here as a [`PageFaultInfo`]. Two
//! jobs share the entry point: breaking copy-on-write sharing on write
//! faults, and the software-TLB refill dance — promote the faulting page
//! to Present, record it in the VA tracker, and demote the whole batch
//! once the tracker fills so the pages fault (and count) again later.

use alloc::sync::Arc;

use log::{debug, error};

use super::page_table::PteSlot;
use super::{frame, ipt, mmu, phys, swtlb, Pte, PteFlags, VirtAddr};
use crate::error::{KernelError, KernelResult};
use crate::mm::tracker::TrackOutcome;
use crate::process::Process;

/// What the trap handler knows about a fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The virtual address that caused the fault.
    pub addr: VirtAddr,
    /// Whether the access was a write.
    pub was_write: bool,
    /// Whether the fault came from user mode.
    pub was_user: bool,
}

/// Resolve a page fault, or report why the process must die.
///
/// Dispatch over `(err.W, PTE_C, PTE_P, PTE_T)`:
/// 1. no PTE — fatal;
/// 2. write with `PTE_C` — break copy-on-write;
/// 3. neither `PTE_P` nor `PTE_T`, user range — rescue as
///    software-managed, then fall through;
/// 4. `PTE_T` without `PTE_P` — software-TLB refill and promotion;
/// 5. anything else — fatal.
pub fn handle_page_fault(proc: &Arc<Process>, info: PageFaultInfo) -> KernelResult<()> {
    let pg = info.addr.page_base();
    let pgdir = proc.pgdir();

    let slot = match pgdir.walk(pg, false)? {
        Some(slot) => slot,
        None => {
            return Err(KernelError::UserFault {
                addr: info.addr.as_u32(),
                reason: "no page table",
            })
        }
    };
    let pte = slot.get();
    if pte.is_zero() {
        return Err(KernelError::UserFault {
            addr: info.addr.as_u32(),
            reason: "no pte",
        });
    }

    let mut flags = pte.flags();

    if info.was_write && flags.contains(PteFlags::C) {
        return resolve_cow(proc.pid, pg, slot).map_err(|err| match err {
            KernelError::OutOfFrames => {
                error!("pid {}: out of frames during copy-on-write", proc.pid);
                KernelError::UserFault {
                    addr: info.addr.as_u32(),
                    reason: "out of frames during cow",
                }
            }
            other => other,
        });
    }

    if !flags.intersects(PteFlags::P | PteFlags::T) {
        if !pg.is_user() {
            return Err(KernelError::UserFault {
                addr: info.addr.as_u32(),
                reason: "kernel-range fault",
            });
        }
        flags |= PteFlags::T | PteFlags::U;
        slot.set(pte.with_flags(flags));
        debug!("pid {}: rescued va 0x{:x}", proc.pid, pg.as_u32());
    }

    if flags.contains(PteFlags::T) && !flags.contains(PteFlags::P) {
        let pa = pte.addr();
        match swtlb::lookup(proc.pid, pg) {
            Some((tlb_pa, _)) if tlb_pa != pa => swtlb::alloc(proc.pid, pg, pa, flags),
            Some(_) => {}
            None => swtlb::alloc(proc.pid, pg, pa, flags),
        }

        proc.with_tracker(|tracker| {
            if tracker.track(pg) == TrackOutcome::Full {
                for va in tracker.tracked() {
                    demote(&pgdir, va);
                }
                tracker.reset();
                let retried = tracker.track(pg);
                assert_eq!(retried, TrackOutcome::Tracked, "tracker reset must make room");
            }
        });

        slot.set(Pte::new(pa, (flags - PteFlags::T) | PteFlags::P));
        mmu::flush();
        return Ok(());
    }

    Err(KernelError::UserFault {
        addr: info.addr.as_u32(),
        reason: "unexpected pte state",
    })
}

/// Clear the Present bit and reassert software management for one page.
fn demote(pgdir: &super::PageDir, va: VirtAddr) {
    if let Ok(Some(slot)) = pgdir.walk(va, false) {
        let pte = slot.get();
        if pte.is_present() {
            slot.set(pte.with_flags((pte.flags() - PteFlags::P) | PteFlags::T));
        }
    }
}

/// Break copy-on-write for the page at `va`.
///
/// With other sharers, duplicate the frame, repoint the PTE, move this
/// pid's IPT entry to the new frame, and drop one reference on the old
/// frame. As the last sharer, just restore the write bit in place. The
/// hardware TLB is flushed after all state is updated. Also used by the
/// kernel's `copyout` before it writes through a `PTE_C` page.
pub fn resolve_cow(pid: i32, va: VirtAddr, slot: PteSlot) -> KernelResult<()> {
    let pte = slot.get();
    let flags = pte.flags();
    assert!(flags.contains(PteFlags::C), "resolve_cow: no C bit");
    let old_pa = pte.addr();
    let old_frame = old_pa.frame();
    let new_flags = (flags - PteFlags::C) | PteFlags::W;

    if frame::refcnt(old_frame) > 1 {
        let new_frame = frame::kalloc(true).ok_or(KernelError::OutOfFrames)?;
        phys::copy_frame(old_frame, new_frame);
        slot.set(Pte::new(new_frame.as_addr(), new_flags));
        ipt::remove(va, old_pa, pid);
        ipt::insert(va, new_frame.as_addr(), new_flags, pid)?;
        frame::kfree(old_frame);
        debug!(
            "pid {}: cow va 0x{:x} frame {} -> {}",
            pid,
            va.as_u32(),
            old_frame.as_u32(),
            new_frame.as_u32()
        );
    } else {
        slot.set(pte.with_flags(new_flags));
    }
    mmu::flush();
    Ok(())
}
