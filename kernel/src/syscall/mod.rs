//! System call interface.
//!
//! The dispatcher takes a syscall number plus raw argument words and
//! returns an `isize`: non-negative on success, −1 for generic failures
//! and bad pointers, −2 when a snapshot operation runs out of inodes.
//! Pointer arguments are translated through the *caller's* page tables
//! with the software walker — never the MMU — accepting both Present
//! and software-managed mappings, and breaking copy-on-write before any
//! kernel write lands in a shared page.

use alloc::string::String;
use alloc::sync::Arc;

use crate::error::{FsError, KernelError, KernelResult};
use crate::mm::{page_fault, phys, PteFlags, VirtAddr};
use crate::param::PGSIZE;
use crate::process::{self, Process};

mod info;
mod mem;
mod snap;

/// System call numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    HelloNumber = 1,
    GetProcinfo = 2,
    Vtop = 3,
    Phys2Virt = 4,
    DumpPhysmemInfo = 5,
    TlbInfo = 6,
    SnapshotCreate = 7,
    SnapshotRollback = 8,
    SnapshotDelete = 9,
    GetAddrs = 10,
    GetIndirectAddrs = 11,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(num: usize) -> Result<Syscall, ()> {
        match num {
            1 => Ok(Syscall::HelloNumber),
            2 => Ok(Syscall::GetProcinfo),
            3 => Ok(Syscall::Vtop),
            4 => Ok(Syscall::Phys2Virt),
            5 => Ok(Syscall::DumpPhysmemInfo),
            6 => Ok(Syscall::TlbInfo),
            7 => Ok(Syscall::SnapshotCreate),
            8 => Ok(Syscall::SnapshotRollback),
            9 => Ok(Syscall::SnapshotDelete),
            10 => Ok(Syscall::GetAddrs),
            11 => Ok(Syscall::GetIndirectAddrs),
            _ => Err(()),
        }
    }
}

/// Result type used by the individual handlers.
pub type SyscallResult = KernelResult<isize>;

/// System call entry point: dispatch and translate errors to codes.
pub fn syscall(num: usize, args: [u32; 4]) -> isize {
    let Ok(call) = Syscall::try_from(num) else {
        return -1;
    };
    let Some(proc) = process::current() else {
        return -1;
    };
    let result = handle_syscall(&proc, call, args);
    match result {
        Ok(value) => value,
        Err(err) => err.code(),
    }
}

fn handle_syscall(proc: &Arc<Process>, call: Syscall, args: [u32; 4]) -> SyscallResult {
    match call {
        Syscall::HelloNumber => info::sys_hello_number(args[0] as i32),
        Syscall::GetProcinfo => info::sys_get_procinfo(proc, args[0] as i32, args[1]),
        Syscall::Vtop => mem::sys_vtop(proc, args[0], args[1], args[2]),
        Syscall::Phys2Virt => mem::sys_phys2virt(proc, args[0], args[1], args[2] as i32),
        Syscall::DumpPhysmemInfo => mem::sys_dump_physmem_info(proc, args[0], args[1] as i32),
        Syscall::TlbInfo => mem::sys_tlbinfo(proc, args[0], args[1]),
        Syscall::SnapshotCreate => snap::sys_snapshot_create(),
        Syscall::SnapshotRollback => snap::sys_snapshot_rollback(args[0] as i32),
        Syscall::SnapshotDelete => snap::sys_snapshot_delete(args[0] as i32),
        Syscall::GetAddrs => snap::sys_get_addrs(proc, args[0], args[1]),
        Syscall::GetIndirectAddrs => snap::sys_get_indirect_addrs(proc, args[0], args[1]),
    }
}

/// Resolve one user page for a kernel-side copy.
///
/// Accepts Present or software-managed mappings; requires the user bit.
fn user_page(proc: &Arc<Process>, va: VirtAddr, write: bool) -> KernelResult<crate::mm::PhysAddr> {
    if !va.is_user() {
        return Err(KernelError::InvalidAddress { addr: va.as_u32() });
    }
    let pgdir = proc.pgdir();
    let (pa, flags) = pgdir
        .sw_vtop(va)
        .ok_or(KernelError::UnmappedMemory { addr: va.as_u32() })?;
    if !flags.contains(PteFlags::U) {
        return Err(KernelError::InvalidAddress { addr: va.as_u32() });
    }
    if write && flags.contains(PteFlags::C) {
        // Kernel writes must not land in a frame other processes share.
        let slot = pgdir
            .walk(va.page_base(), false)?
            .expect("mapped page has a slot");
        page_fault::resolve_cow(proc.pid, va.page_base(), slot)?;
        let (pa, _) = pgdir
            .sw_vtop(va)
            .ok_or(KernelError::UnmappedMemory { addr: va.as_u32() })?;
        return Ok(pa);
    }
    Ok(pa)
}

/// Check that `len` bytes at `va` are addressable for a future copyout
/// without writing anything yet.
pub(crate) fn validate_user_range(proc: &Arc<Process>, va: u32, len: usize) -> KernelResult<()> {
    let mut off = 0usize;
    while off < len {
        user_page(proc, VirtAddr::new(va + off as u32), false)?;
        off += PGSIZE - (va as usize + off) % PGSIZE;
    }
    Ok(())
}

/// Copy bytes from user space into a kernel buffer.
pub(crate) fn copyin(proc: &Arc<Process>, va: u32, buf: &mut [u8]) -> KernelResult<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let cur = VirtAddr::new(va + done as u32);
        let pa = user_page(proc, cur, false)?;
        let chunk = (PGSIZE as u32 - cur.page_offset()) as usize;
        let n = chunk.min(buf.len() - done);
        phys::read(pa, &mut buf[done..done + n]);
        done += n;
    }
    Ok(())
}

/// Copy bytes from a kernel buffer out to user space.
pub(crate) fn copyout(proc: &Arc<Process>, va: u32, data: &[u8]) -> KernelResult<()> {
    let mut done = 0usize;
    while done < data.len() {
        let cur = VirtAddr::new(va + done as u32);
        let pa = user_page(proc, cur, true)?;
        let chunk = (PGSIZE as u32 - cur.page_offset()) as usize;
        let n = chunk.min(data.len() - done);
        phys::write(pa, &data[done..done + n]);
        done += n;
    }
    Ok(())
}

/// Read a NUL-terminated string from user space (bounded).
pub(crate) fn copyinstr(proc: &Arc<Process>, va: u32, max: usize) -> KernelResult<String> {
    let mut out = alloc::vec::Vec::new();
    for i in 0..max {
        let mut byte = [0u8; 1];
        copyin(proc, va + i as u32, &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(out)
                .map_err(|_| KernelError::FsError(FsError::InvalidPath));
        }
        out.push(byte[0]);
    }
    Err(KernelError::InvalidArgument { name: "path" })
}
