//! Inverted page table.
//!
//! Reverse map from physical frame to every `(pid, va)` mapping it,
//! bucketed by frame number. Entries come from a slab that grows one
//! frame's worth of cells at a time; exhaustion of physical memory
//! therefore surfaces here as an insert failure the caller must
//! propagate. Two locks: the coarse table lock and the slab-pool lock,
//! acquired in that order. IPT code never touches a PTE.

use alloc::vec;
use alloc::vec::Vec;

use core::mem::size_of;

use lazy_static::lazy_static;
use log::debug;
use spin::Mutex;

use super::{frame, swtlb, FrameNumber, PhysAddr, PteFlags, VirtAddr};
use crate::error::{KernelError, KernelResult};
use crate::param::{IPT_BUCKETS, PGSIZE};

const NO_CELL: u32 = u32::MAX;

/// Cells carved out of each slab page.
const CELLS_PER_SLAB: usize = PGSIZE / size_of::<IptEntry>();

/// One reverse mapping: `next` chains entries sharing a bucket, `cnext`
/// threads the slab free pool.
#[derive(Clone, Copy)]
struct IptEntry {
    pfn: u32,
    pid: i32,
    va: u32,
    flags: PteFlags,
    refcnt: u32,
    next: u32,
    cnext: u32,
}

impl IptEntry {
    const FREE: IptEntry = IptEntry {
        pfn: u32::MAX,
        pid: -1,
        va: 0,
        flags: PteFlags::empty(),
        refcnt: 0,
        next: NO_CELL,
        cnext: NO_CELL,
    };
}

/// A copied-out chain record (the `phys2virt` payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IptRecord {
    pub pid: i32,
    pub va: u32,
    pub flags: u32,
}

struct IptTable {
    buckets: Vec<u32>,
    cells: Vec<IptEntry>,
}

struct IptPool {
    free_head: u32,
    slabs: Vec<FrameNumber>,
}

lazy_static! {
    static ref IPT: Mutex<IptTable> = Mutex::new(IptTable {
        buckets: Vec::new(),
        cells: Vec::new(),
    });
    static ref POOL: Mutex<IptPool> = Mutex::new(IptPool {
        free_head: NO_CELL,
        slabs: Vec::new(),
    });
}

/// Reset table and slab (boot).
pub fn iptinit() {
    let mut table = IPT.lock();
    table.buckets = vec![NO_CELL; IPT_BUCKETS];
    table.cells.clear();
    let mut pool = POOL.lock();
    pool.free_head = NO_CELL;
    pool.slabs.clear();
    debug!(
        "ipt: {} buckets, {} cells per slab",
        IPT_BUCKETS, CELLS_PER_SLAB
    );
}

fn bucket_of(pa: PhysAddr) -> usize {
    pa.frame().as_index() % IPT_BUCKETS
}

/// Pop a free cell, growing the slab by one page of cells if needed.
///
/// Called with the table lock held; takes the pool lock inside.
fn alloc_cell(table: &mut IptTable) -> KernelResult<u32> {
    let mut pool = POOL.lock();
    if pool.free_head == NO_CELL {
        let slab = frame::kalloc(false).ok_or(KernelError::OutOfFrames)?;
        let base = table.cells.len() as u32;
        table.cells.resize(table.cells.len() + CELLS_PER_SLAB, IptEntry::FREE);
        for i in 0..CELLS_PER_SLAB as u32 {
            let idx = base + i;
            table.cells[idx as usize].cnext = if i + 1 < CELLS_PER_SLAB as u32 {
                idx + 1
            } else {
                NO_CELL
            };
        }
        pool.free_head = base;
        pool.slabs.push(slab);
    }
    let idx = pool.free_head;
    pool.free_head = table.cells[idx as usize].cnext;
    table.cells[idx as usize].cnext = NO_CELL;
    Ok(idx)
}

/// Return a cell to the slab free pool.
fn free_cell(table: &mut IptTable, idx: u32) {
    let mut pool = POOL.lock();
    table.cells[idx as usize] = IptEntry::FREE;
    table.cells[idx as usize].cnext = pool.free_head;
    pool.free_head = idx;
}

/// Record (or refresh) the mapping `(pid, va) -> pa`.
///
/// An existing entry for the same `(pfn, va, pid)` has its flags updated
/// and its refcnt bumped; otherwise a new entry is appended at the
/// chain tail. The stored flags always include `PTE_P`. The matching
/// software-TLB slot is invalidated either way. Fails only when the slab
/// cannot grow.
pub fn insert(va: VirtAddr, pa: PhysAddr, flags: PteFlags, pid: i32) -> KernelResult<()> {
    let va = va.page_base();
    let pfn = pa.frame().as_u32();
    let stored = flags | PteFlags::P;
    let mut guard = IPT.lock();
    let table = &mut *guard;
    assert!(!table.buckets.is_empty(), "ipt: not initialized");
    let bucket = bucket_of(pa);

    let mut prev = NO_CELL;
    let mut cur = table.buckets[bucket];
    while cur != NO_CELL {
        let entry = table.cells[cur as usize];
        if entry.pfn == pfn && entry.va == va.as_u32() && entry.pid == pid {
            let entry = &mut table.cells[cur as usize];
            entry.flags = stored;
            entry.refcnt += 1;
            drop(guard);
            swtlb::invalidate(pid, va);
            return Ok(());
        }
        prev = cur;
        cur = entry.next;
    }

    let idx = alloc_cell(table)?;
    table.cells[idx as usize] = IptEntry {
        pfn,
        pid,
        va: va.as_u32(),
        flags: stored,
        refcnt: 1,
        next: NO_CELL,
        cnext: NO_CELL,
    };
    if prev == NO_CELL {
        table.buckets[bucket] = idx;
    } else {
        table.cells[prev as usize].next = idx;
    }
    drop(guard);
    swtlb::invalidate(pid, va);
    Ok(())
}

/// Unlink the entry matching `(pfn(pa), va, pid)`. Returns whether an
/// entry was removed.
pub fn remove(va: VirtAddr, pa: PhysAddr, pid: i32) -> bool {
    let va = va.page_base();
    let pfn = pa.frame().as_u32();
    let mut guard = IPT.lock();
    let table = &mut *guard;
    if table.buckets.is_empty() {
        return false;
    }
    let bucket = bucket_of(pa);
    let mut prev = NO_CELL;
    let mut cur = table.buckets[bucket];
    while cur != NO_CELL {
        let entry = table.cells[cur as usize];
        if entry.pfn == pfn && entry.va == va.as_u32() && entry.pid == pid {
            if prev == NO_CELL {
                table.buckets[bucket] = entry.next;
            } else {
                table.cells[prev as usize].next = entry.next;
            }
            free_cell(table, cur);
            return true;
        }
        prev = cur;
        cur = entry.next;
    }
    false
}

/// Copy out up to `max` chain entries for the bucket of `pa`.
pub fn collect(pa: PhysAddr, max: usize) -> Vec<IptRecord> {
    let pfn = pa.frame().as_u32();
    let guard = IPT.lock();
    let table = &*guard;
    let mut out = Vec::new();
    if table.buckets.is_empty() {
        return out;
    }
    let mut cur = table.buckets[bucket_of(pa)];
    while cur != NO_CELL && out.len() < max {
        let entry = table.cells[cur as usize];
        if entry.pfn == pfn {
            out.push(IptRecord {
                pid: entry.pid,
                va: entry.va,
                flags: entry.flags.bits(),
            });
        }
        cur = entry.next;
    }
    out
}

/// Number of live entries for the frame of `pa`.
pub fn chain_len(pa: PhysAddr) -> usize {
    collect(pa, usize::MAX).len()
}

/// Drop every entry belonging to a pid (process exit).
pub fn remove_pid(pid: i32) {
    let mut guard = IPT.lock();
    let table = &mut *guard;
    for bucket in 0..table.buckets.len() {
        let mut prev = NO_CELL;
        let mut cur = table.buckets[bucket];
        while cur != NO_CELL {
            let entry = table.cells[cur as usize];
            if entry.pid == pid {
                if prev == NO_CELL {
                    table.buckets[bucket] = entry.next;
                } else {
                    table.cells[prev as usize].next = entry.next;
                }
                free_cell(table, cur);
            } else {
                prev = cur;
            }
            cur = entry.next;
        }
    }
}

/// `(live entries, slab pages)` — for logging and tests.
pub fn stats() -> (usize, usize) {
    let guard = IPT.lock();
    let live = guard
        .cells
        .iter()
        .filter(|c| c.pfn != u32::MAX)
        .count();
    let slabs = POOL.lock().slabs.len();
    (live, slabs)
}
