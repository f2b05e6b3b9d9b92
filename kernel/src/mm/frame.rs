//! Physical frame tracker.
//!
//! Per-frame metadata (`pf_info` in the old kernels) and the free list,
//! all behind a single lock. Frames are reference counted: `kfree` only
//! returns a frame to the free list once the last sharer lets go, which
//! is what makes fork-time COW sharing safe.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use log::debug;

use spin::Mutex;

use super::{phys, FrameNumber};
use crate::param::PFNNUM;
use crate::time;

const NO_FRAME: u32 = u32::MAX;

/// Owner pid recorded for frames not attributed to any process.
pub const NO_OWNER: i32 = -1;

#[derive(Clone, Copy)]
struct FrameInfo {
    allocated: bool,
    pid: i32,
    start_tick: u64,
    refcnt: u32,
    next_free: u32,
}

impl FrameInfo {
    const FREE: FrameInfo = FrameInfo {
        allocated: false,
        pid: NO_OWNER,
        start_tick: 0,
        refcnt: 0,
        next_free: NO_FRAME,
    };
}

/// One record of [`dump`] output, in frame-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FrameRecord {
    pub frame: u32,
    pub allocated: u32,
    pub pid: i32,
    pub start_tick: u32,
}

/// Allocator counters, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTrackerStats {
    pub total_frames: usize,
    pub free_frames: usize,
}

struct FrameTracker {
    info: Vec<FrameInfo>,
    free_head: u32,
    free_count: usize,
}

impl FrameTracker {
    const fn empty() -> Self {
        Self {
            info: Vec::new(),
            free_head: NO_FRAME,
            free_count: 0,
        }
    }

    fn reset(&mut self) {
        self.info.clear();
        self.info.resize(PFNNUM, FrameInfo::FREE);
        self.free_head = NO_FRAME;
        self.free_count = PFNNUM;
        // Pushed in descending order so a fresh boot pops frame 0 first
        // and hands out ascending, consecutive frames.
        for idx in (0..PFNNUM as u32).rev() {
            self.info[idx as usize].next_free = self.free_head;
            self.free_head = idx;
        }
    }
}

lazy_static! {
    static ref TRACKER: Mutex<FrameTracker> = Mutex::new(FrameTracker::empty());
}

/// Scan the physical range and build the free list (boot).
pub fn kinit() {
    phys::init();
    TRACKER.lock().reset();
    debug!("frame tracker: {} frames managed", PFNNUM);
}

/// Allocate one frame.
///
/// The frame comes back zeroed with `refcnt = 1`. With `store_owner` the
/// current pid is recorded as the owner; otherwise the frame is
/// kernel-owned (`pid = -1`). Returns `None` when memory is exhausted.
pub fn kalloc(store_owner: bool) -> Option<FrameNumber> {
    let mut guard = TRACKER.lock();
    let t = &mut *guard;
    let idx = t.free_head;
    if idx == NO_FRAME {
        return None;
    }
    let info = &mut t.info[idx as usize];
    t.free_head = info.next_free;
    info.next_free = NO_FRAME;
    info.allocated = true;
    info.refcnt = 1;
    info.pid = if store_owner {
        crate::process::current_pid()
    } else {
        NO_OWNER
    };
    info.start_tick = time::ticks();
    t.free_count -= 1;
    drop(guard);
    let frame = FrameNumber::new(idx);
    phys::zero_frame(frame);
    Some(frame)
}

/// Drop one reference to a frame.
///
/// The frame returns to the free list, with its metadata reset, only when
/// the count reaches zero. Panics if the address is not a managed,
/// allocated frame.
pub fn kfree(frame: FrameNumber) {
    let mut guard = TRACKER.lock();
    let t = &mut *guard;
    let idx = frame.as_index();
    assert!(idx < PFNNUM, "kfree: frame {} out of range", idx);
    let free_head = t.free_head;
    let info = &mut t.info[idx];
    assert!(info.allocated, "kfree: frame {} not allocated", idx);
    assert!(info.refcnt >= 1, "kfree: frame {} refcnt underflow", idx);
    info.refcnt -= 1;
    if info.refcnt == 0 {
        *info = FrameInfo::FREE;
        info.next_free = free_head;
        t.free_head = idx as u32;
        t.free_count += 1;
    }
}

/// Add one reference to an allocated frame (COW sharing).
pub fn incref(frame: FrameNumber) {
    let mut t = TRACKER.lock();
    let idx = frame.as_index();
    assert!(idx < PFNNUM, "incref: frame {} out of range", idx);
    let info = &mut t.info[idx];
    assert!(info.allocated, "incref: frame {} not allocated", idx);
    info.refcnt += 1;
}

/// Current reference count of a frame (0 for free frames).
pub fn refcnt(frame: FrameNumber) -> u32 {
    let t = TRACKER.lock();
    t.info
        .get(frame.as_index())
        .map(|i| i.refcnt)
        .unwrap_or(0)
}

/// Copy out up to `max` frame records, ascending by frame index.
///
/// The snapshot is atomic with respect to `kalloc`/`kfree`: the tracker
/// lock is held for the whole scan.
pub fn dump(max: usize) -> Vec<FrameRecord> {
    let t = TRACKER.lock();
    let n = max.min(PFNNUM);
    let mut out = Vec::with_capacity(n);
    for (idx, info) in t.info.iter().enumerate().take(n) {
        out.push(FrameRecord {
            frame: idx as u32,
            allocated: info.allocated as u32,
            pid: info.pid,
            start_tick: info.start_tick as u32,
        });
    }
    out
}

/// Allocator counters.
pub fn stats() -> FrameTrackerStats {
    let t = TRACKER.lock();
    FrameTrackerStats {
        total_frames: PFNNUM,
        free_frames: t.free_count,
    }
}
