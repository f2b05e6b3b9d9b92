//! Hardware model: the MMU walk and the CPU's translation cache.
//!
//! The real machine this kernel grew up on had a hardware walker and a
//! TLB; here both are modeled so the Present-bit games the fault handler
//! plays stay observable. The cache holds translations for the current
//! address space only and is dropped on context switch and on
//! [`flush`] — the `lcr3` analog. User accesses go through
//! [`load_user`]/[`store_user`], which raise page faults exactly where
//! hardware would.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use log::warn;
use spin::Mutex;

use super::{page_fault, phys, PageDir, PhysAddr, Pte, PteFlags, VirtAddr};
use crate::error::{KernelError, KernelResult};
use crate::param::PGSIZE;
use crate::process::{self, Process};

/// Bound on fault-retry loops for one access; more means the handler is
/// not making progress and the machine is wedged.
const MAX_FAULT_RETRIES: usize = 8;

lazy_static! {
    static ref HW_TLB: Mutex<BTreeMap<u32, Pte>> = Mutex::new(BTreeMap::new());
}

/// Drop every cached translation (full hardware-TLB flush).
pub fn flush() {
    HW_TLB.lock().clear();
}

/// Drop the cached translation for one page (`invlpg` analog).
pub fn flush_addr(va: VirtAddr) {
    HW_TLB.lock().remove(&va.vpn());
}

/// The walk the MMU performs: Present at both levels or nothing.
/// `PTE_T` means nothing to hardware.
fn hw_walk(pgdir: &PageDir, va: VirtAddr) -> Option<Pte> {
    let slot = pgdir.walk(va.page_base(), false).ok()??;
    let pte = slot.get();
    if pte.is_present() {
        Some(pte)
    } else {
        None
    }
}

fn permits(pte: Pte, write: bool) -> bool {
    let flags = pte.flags();
    flags.contains(PteFlags::U) && (!write || flags.contains(PteFlags::W))
}

/// Resolve one user page for an access, faulting as hardware would.
///
/// An unresolvable fault kills the process (translation resources are
/// reclaimed) and reports `UserFault`.
fn translate(proc: &Arc<Process>, va: VirtAddr, write: bool) -> KernelResult<PhysAddr> {
    assert_eq!(
        proc.pid,
        process::current_pid(),
        "user access for a process that is not running"
    );
    for _ in 0..MAX_FAULT_RETRIES {
        let cached = HW_TLB.lock().get(&va.vpn()).copied();
        let pte = match cached {
            Some(pte) if permits(pte, write) => Some(pte),
            Some(_) => None, // cached but lacks rights: protection fault
            None => {
                let pgdir = proc.pgdir();
                match hw_walk(&pgdir, va) {
                    Some(pte) if permits(pte, write) => {
                        HW_TLB.lock().insert(va.vpn(), pte);
                        Some(pte)
                    }
                    _ => None,
                }
            }
        };
        if let Some(pte) = pte {
            return Ok(pte.addr().offset(va.page_offset()));
        }
        let info = page_fault::PageFaultInfo {
            addr: va,
            was_write: write,
            was_user: true,
        };
        if let Err(err) = page_fault::handle_page_fault(proc, info) {
            warn!("pid {}: killed on fault at 0x{:x}: {}", proc.pid, va.as_u32(), err);
            proc.set_killed();
            process::exit(proc);
            return Err(KernelError::UserFault {
                addr: va.as_u32(),
                reason: "unhandled page fault",
            });
        }
    }
    panic!(
        "page fault loop: pid {} va 0x{:x}",
        proc.pid,
        va.as_u32()
    );
}

/// Simulated user-mode read of `buf.len()` bytes at `va`.
pub fn load_user(proc: &Arc<Process>, va: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let cur = va.add(done as u32);
        let in_page = (PGSIZE as u32 - cur.page_offset()) as usize;
        let n = in_page.min(buf.len() - done);
        let pa = translate(proc, cur, false)?;
        phys::read(pa, &mut buf[done..done + n]);
        done += n;
    }
    Ok(())
}

/// Simulated user-mode write of `data` at `va`.
pub fn store_user(proc: &Arc<Process>, va: VirtAddr, data: &[u8]) -> KernelResult<()> {
    let mut done = 0usize;
    while done < data.len() {
        let cur = va.add(done as u32);
        let in_page = (PGSIZE as u32 - cur.page_offset()) as usize;
        let n = in_page.min(data.len() - done);
        let pa = translate(proc, cur, true)?;
        phys::write(pa, &data[done..done + n]);
        done += n;
    }
    Ok(())
}
