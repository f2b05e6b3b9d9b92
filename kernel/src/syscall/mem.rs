//! Address-translation syscalls: `vtop`, `phys2virt`,
//! `dump_physmem_info`, `tlbinfo`.

use alloc::sync::Arc;

use super::{copyout, validate_user_range, SyscallResult};
use crate::error::{KernelError, KernelResult};
use crate::mm::{frame, ipt, swtlb, PhysAddr, PteFlags, VirtAddr};
use crate::process::Process;

/// Software-walk the caller's page directory.
///
/// Reports `PTE_T` as `PTE_P` — user programs see a page as mapped, not
/// how the kernel is managing it — and consults/updates the software TLB
/// so a second walk over the same page counts a hit.
pub fn sys_vtop(proc: &Arc<Process>, va: u32, pa_out: u32, flags_out: u32) -> SyscallResult {
    validate_user_range(proc, pa_out, 4)?;
    validate_user_range(proc, flags_out, 4)?;
    let va = VirtAddr::new(va);
    let pgdir = proc.pgdir();
    let (pa, flags) = pgdir
        .sw_vtop(va)
        .ok_or(KernelError::UnmappedMemory { addr: va.as_u32() })?;

    let pg = va.page_base();
    let pa_page = PhysAddr::new(pa.as_u32() & !0xFFF);
    match swtlb::lookup(proc.pid, pg) {
        Some((cached, _)) if cached == pa_page => {}
        _ => swtlb::alloc(proc.pid, pg, pa_page, flags),
    }

    let mut reported = flags;
    if reported.contains(PteFlags::T) {
        reported = (reported - PteFlags::T) | PteFlags::P;
    }
    copyout(proc, pa_out, &pa.as_u32().to_le_bytes())?;
    copyout(proc, flags_out, &reported.bits().to_le_bytes())?;
    Ok(0)
}

/// Copy out the IPT chain for a physical page: `(pid, va, flags)`
/// records, `max` at most. Returns the record count.
pub fn sys_phys2virt(proc: &Arc<Process>, pa: u32, out: u32, max: i32) -> SyscallResult {
    if max < 0 {
        return Err(KernelError::InvalidArgument { name: "max" });
    }
    let records = ipt::collect(PhysAddr::new(pa), max as usize);
    let mut offset = out;
    for rec in records.iter() {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&rec.pid.to_le_bytes());
        bytes[4..8].copy_from_slice(&rec.va.to_le_bytes());
        bytes[8..12].copy_from_slice(&rec.flags.to_le_bytes());
        copyout(proc, offset, &bytes)?;
        offset += 12;
    }
    Ok(records.len() as isize)
}

/// Stream up to `max` frame records in frame-index order. Returns the
/// record count.
pub fn sys_dump_physmem_info(proc: &Arc<Process>, out: u32, max: i32) -> SyscallResult {
    if max < 0 {
        return Err(KernelError::InvalidArgument { name: "max" });
    }
    let records = frame::dump(max as usize);
    let mut offset = out;
    for rec in records.iter() {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&rec.frame.to_le_bytes());
        bytes[4..8].copy_from_slice(&rec.allocated.to_le_bytes());
        bytes[8..12].copy_from_slice(&rec.pid.to_le_bytes());
        bytes[12..16].copy_from_slice(&rec.start_tick.to_le_bytes());
        copyout(proc, offset, &bytes)?;
        offset += 16;
    }
    Ok(records.len() as isize)
}

/// Report the software-TLB hit/miss counters. Both destination pointers
/// are validated before either write.
pub fn sys_tlbinfo(proc: &Arc<Process>, hits_out: u32, misses_out: u32) -> SyscallResult {
    let check: KernelResult<()> = (|| {
        validate_user_range(proc, hits_out, 4)?;
        validate_user_range(proc, misses_out, 4)
    })();
    check?;
    let (hits, misses) = swtlb::counters();
    copyout(proc, hits_out, &(hits as u32).to_le_bytes())?;
    copyout(proc, misses_out, &(misses as u32).to_le_bytes())?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PGSIZE;
    use crate::process::{fork, spawn};
    use crate::syscall::{copyin, syscall, Syscall};
    use crate::testing::kernel_test;

    fn read_u32(proc: &Arc<Process>, va: u32) -> u32 {
        let mut bytes = [0u8; 4];
        copyin(proc, va, &mut bytes).unwrap();
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn vtop_reports_present_and_counts_misses_then_hits() {
        kernel_test(|| {
            let p = spawn("vtop", 4).unwrap();
            let (pa_out, flags_out) = (0x100, 0x104);
            let (_, m0) = swtlb::counters();
            for page in 0..3u32 {
                assert_eq!(
                    syscall(Syscall::Vtop as usize, [page * PGSIZE as u32, pa_out, flags_out, 0]),
                    0
                );
            }
            let (h1, m1) = swtlb::counters();
            assert_eq!(m1, m0 + 3, "one miss per untranslated page");
            for page in 0..3u32 {
                assert_eq!(
                    syscall(Syscall::Vtop as usize, [page * PGSIZE as u32, pa_out, flags_out, 0]),
                    0
                );
            }
            let (h2, m2) = swtlb::counters();
            assert_eq!(m2, m1, "re-walk adds no misses");
            assert_eq!(h2, h1 + 3, "re-walk hits");

            let flags = PteFlags::from_bits_truncate(read_u32(&p, flags_out));
            assert!(flags.contains(PteFlags::P), "T reported as P");
            assert!(!flags.contains(PteFlags::T));
            let (pa, _) = p.pgdir().sw_vtop(VirtAddr::new(2 * PGSIZE as u32)).unwrap();
            assert_eq!(read_u32(&p, pa_out), pa.as_u32());
        });
    }

    #[test]
    fn vtop_of_unmapped_address_fails() {
        kernel_test(|| {
            spawn("vbad", 1).unwrap();
            assert_eq!(
                syscall(Syscall::Vtop as usize, [0x4000_0000, 0x10, 0x14, 0]),
                -1
            );
        });
    }

    #[test]
    fn phys2virt_lists_sharers_after_fork() {
        kernel_test(|| {
            let parent = spawn("p2v", 1).unwrap();
            let _child = fork(&parent).unwrap();
            let (pa, _) = parent.pgdir().sw_vtop(VirtAddr::new(0)).unwrap();
            let n = syscall(Syscall::Phys2Virt as usize, [pa.as_u32(), 0x200, 8, 0]);
            assert_eq!(n, 2, "parent and child both map the frame");
            let pid0 = read_u32(&parent, 0x200) as i32;
            let va0 = read_u32(&parent, 0x204);
            assert_eq!(pid0, parent.pid);
            assert_eq!(va0, 0);
        });
    }

    #[test]
    fn dump_respects_max_and_order() {
        kernel_test(|| {
            let p = spawn("dump", 1).unwrap();
            let n = syscall(Syscall::DumpPhysmemInfo as usize, [0x300, 4, 0, 0]);
            assert_eq!(n, 4);
            for i in 0..4u32 {
                assert_eq!(read_u32(&p, 0x300 + i * 16), i, "frame index ascending");
            }
        });
    }

    #[test]
    fn tlbinfo_validates_both_pointers() {
        kernel_test(|| {
            let p = spawn("tlbi", 1).unwrap();
            let (h, m) = swtlb::counters();
            assert_eq!(syscall(Syscall::TlbInfo as usize, [0x80, 0x84, 0, 0]), 0);
            assert_eq!(read_u32(&p, 0x80), h as u32);
            assert_eq!(read_u32(&p, 0x84), m as u32);
            // A bad misses pointer must fail without writing hits.
            let before = read_u32(&p, 0x80);
            assert_eq!(
                syscall(Syscall::TlbInfo as usize, [0x90, 0x4000_0000, 0, 0]),
                -1
            );
            assert_eq!(read_u32(&p, 0x90), 0, "no partial write");
            let _ = before;
        });
    }
}
