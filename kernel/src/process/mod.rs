//! Minimal process substrate.
//!
//! The scheduler proper is out of scope; what lives here is exactly what
//! the address-translation subsystems need from a process table: a pid,
//! a page directory, the VA tracker, fork with copy-on-write sharing,
//! and exit-time reclamation of every translation resource.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicI32, Ordering};

use lazy_static::lazy_static;
use log::{debug, info};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::tracker::VaTracker;
use crate::mm::{frame, ipt, mmu, page_table::PageDir, swtlb, Pte, PteFlags, VirtAddr};
use crate::param::PGSIZE;

/// Scheduling state, as reported by `get_procinfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcState {
    Runnable = 0,
    Running = 1,
    Zombie = 2,
}

struct ProcInner {
    ppid: i32,
    name: [u8; 16],
    state: ProcState,
    sz: u32,
    pgdir: Option<PageDir>,
    tracker: VaTracker,
    killed: bool,
}

/// One process. Mutable state sits behind a spinlock; the pid is fixed
/// for the process's lifetime.
pub struct Process {
    pub pid: i32,
    inner: Mutex<ProcInner>,
}

/// The `get_procinfo` payload.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProcInfo {
    pub pid: i32,
    pub ppid: i32,
    pub state: u32,
    pub sz: u32,
    pub name: [u8; 16],
}

lazy_static! {
    static ref PTABLE: Mutex<Vec<Arc<Process>>> = Mutex::new(Vec::new());
    static ref CURRENT: Mutex<Option<Arc<Process>>> = Mutex::new(None);
}

static NEXT_PID: AtomicI32 = AtomicI32::new(1);
static CURRENT_PID: AtomicI32 = AtomicI32::new(-1);

fn name_bytes(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (dst, src) in out.iter_mut().zip(name.bytes().take(15)) {
        *dst = src;
    }
    out
}

/// Reset the process table (boot).
pub fn init() {
    PTABLE.lock().clear();
    *CURRENT.lock() = None;
    CURRENT_PID.store(-1, Ordering::SeqCst);
    NEXT_PID.store(1, Ordering::SeqCst);
}

/// Pid of the process running on this CPU, or −1.
///
/// Lock-free so the frame tracker can read it while holding its own lock.
pub fn current_pid() -> i32 {
    CURRENT_PID.load(Ordering::SeqCst)
}

/// The process running on this CPU.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.lock().clone()
}

/// Context switch: install `proc` (or none) as the running process.
///
/// Loading a new address space invalidates the hardware TLB, exactly as
/// `lcr3` would.
pub fn set_current(proc: Option<&Arc<Process>>) {
    let mut cur = CURRENT.lock();
    if let Some(prev) = cur.as_ref() {
        let mut inner = prev.inner.lock();
        if inner.state == ProcState::Running {
            inner.state = ProcState::Runnable;
        }
    }
    *cur = proc.cloned();
    CURRENT_PID.store(proc.map(|p| p.pid).unwrap_or(-1), Ordering::SeqCst);
    if let Some(p) = proc {
        p.inner.lock().state = ProcState::Running;
    }
    drop(cur);
    mmu::flush();
}

/// Look up a process by pid.
pub fn find(pid: i32) -> Option<Arc<Process>> {
    PTABLE.lock().iter().find(|p| p.pid == pid).cloned()
}

impl Process {
    /// This process's page directory. Panics after exit.
    pub fn pgdir(&self) -> PageDir {
        self.inner
            .lock()
            .pgdir
            .expect("process has no address space")
    }

    /// User address-space size in bytes.
    pub fn size(&self) -> u32 {
        self.inner.lock().sz
    }

    pub fn killed(&self) -> bool {
        self.inner.lock().killed
    }

    pub fn set_killed(&self) {
        self.inner.lock().killed = true;
    }

    /// Run `f` against the VA tracker under the process lock.
    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut VaTracker) -> R) -> R {
        f(&mut self.inner.lock().tracker)
    }

    /// Snapshot of the fields `get_procinfo` reports.
    pub fn info(&self) -> ProcInfo {
        let inner = self.inner.lock();
        ProcInfo {
            pid: self.pid,
            ppid: inner.ppid,
            state: inner.state as u32,
            sz: inner.sz,
            name: inner.name,
        }
    }
}

/// Create a process with `npages` of user memory and switch to it.
///
/// User pages are mapped `PTE_T | PTE_U | PTE_W` — software-managed from
/// birth, never Present, so the very first touch of every page traps into
/// the fault handler.
pub fn spawn(name: &str, npages: usize) -> KernelResult<Arc<Process>> {
    let pgdir = PageDir::new()?;
    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    let proc = Arc::new(Process {
        pid,
        inner: Mutex::new(ProcInner {
            ppid: current_pid(),
            name: name_bytes(name),
            state: ProcState::Runnable,
            sz: 0,
            pgdir: Some(pgdir),
            tracker: VaTracker::new(),
            killed: false,
        }),
    });
    PTABLE.lock().push(proc.clone());
    set_current(Some(&proc));
    if let Err(err) = grow(&proc, npages) {
        exit(&proc);
        return Err(err);
    }
    debug!("spawn: pid {} '{}' with {} pages", pid, name, npages);
    Ok(proc)
}

/// Extend the current process's address space by `npages`.
///
/// The caller must be the running process (frame ownership is recorded
/// from the current pid). Partially allocated pages are rolled back on
/// failure.
pub fn grow(proc: &Arc<Process>, npages: usize) -> KernelResult<()> {
    assert_eq!(proc.pid, current_pid(), "grow: process must be running");
    let pgdir = proc.pgdir();
    let base = proc.size();
    let flags = PteFlags::T | PteFlags::U | PteFlags::W;
    let mut done = 0usize;
    let result = (|| -> KernelResult<()> {
        while done < npages {
            let va = VirtAddr::new(base + (done * PGSIZE) as u32);
            // Page-table frames first, then the data frame, so the
            // frames a process owns come out of the free list
            // consecutively.
            let slot = pgdir
                .walk(va, true)?
                .expect("walk with alloc always yields a slot");
            let f = frame::kalloc(true).ok_or(KernelError::OutOfFrames)?;
            assert!(slot.get().is_zero(), "grow: remap of va 0x{:x}", va.as_u32());
            slot.set(crate::mm::Pte::new(f.as_addr(), flags));
            ipt::insert(va, f.as_addr(), flags, proc.pid)?;
            done += 1;
        }
        Ok(())
    })();
    if let Err(err) = result {
        for i in 0..done {
            let va = VirtAddr::new(base + (i * PGSIZE) as u32);
            if let Some(pte) = pgdir.unmap(va) {
                ipt::remove(va, pte.addr(), proc.pid);
                frame::kfree(pte.addr().frame());
            }
        }
        return Err(err);
    }
    proc.inner.lock().sz = base + (npages * PGSIZE) as u32;
    Ok(())
}

/// Fork the current process with copy-on-write sharing.
///
/// Every writable user page becomes read-only + `PTE_C` in both parent
/// and child; the frame's refcount and the child's IPT entries record
/// the sharing. The parent stays the running process.
pub fn fork(parent: &Arc<Process>) -> KernelResult<Arc<Process>> {
    let parent_pgdir = parent.pgdir();
    let sz = parent.size();
    let child_pgdir = PageDir::new()?;
    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);

    for (va, pte) in parent_pgdir.user_mappings(VirtAddr::new(sz)) {
        let flags = pte.flags();
        let shared = if flags.intersects(PteFlags::W | PteFlags::C) {
            (flags - PteFlags::W) | PteFlags::C
        } else {
            flags
        };
        if shared != flags {
            let slot = parent_pgdir
                .walk(va, false)?
                .expect("mapping just enumerated");
            slot.set(Pte::new(pte.addr(), shared));
            ipt::insert(va, pte.addr(), shared, parent.pid)?;
        }
        frame::incref(pte.addr().frame());
        child_pgdir.map(va, pte.addr().frame(), shared)?;
        ipt::insert(va, pte.addr(), shared, pid)?;
    }

    let (ppid, name) = {
        let inner = parent.inner.lock();
        (parent.pid, inner.name)
    };
    let child = Arc::new(Process {
        pid,
        inner: Mutex::new(ProcInner {
            ppid,
            name,
            state: ProcState::Runnable,
            sz,
            pgdir: Some(child_pgdir),
            tracker: VaTracker::new(),
            killed: false,
        }),
    });
    PTABLE.lock().push(child.clone());
    // Parent PTEs just lost their writable bit; stale hardware
    // translations must go before either side runs again.
    mmu::flush();
    debug!("fork: pid {} -> child {}", parent.pid, pid);
    Ok(child)
}

/// Tear a process down, reclaiming every translation resource: IPT
/// entries removed, frames released, software TLB scrubbed for the pid,
/// VA tracker cleared, paging structures freed.
pub fn exit(proc: &Arc<Process>) {
    let (pgdir, sz) = {
        let inner = proc.inner.lock();
        match inner.pgdir {
            Some(p) => (p, inner.sz),
            None => return, // already exited
        }
    };
    for (va, pte) in pgdir.user_mappings(VirtAddr::new(sz)) {
        ipt::remove(va, pte.addr(), proc.pid);
        frame::kfree(pte.addr().frame());
    }
    pgdir.free();
    swtlb::invalidate_pid(proc.pid);
    {
        let mut inner = proc.inner.lock();
        inner.pgdir = None;
        inner.sz = 0;
        inner.tracker.reset();
        inner.state = ProcState::Zombie;
    }
    if current_pid() == proc.pid {
        set_current(None);
    }
    PTABLE.lock().retain(|p| p.pid != proc.pid);
    info!("exit: pid {}", proc.pid);
}
