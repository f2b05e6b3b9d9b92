//! Simulated physical memory.
//!
//! One flat array of [`PFNNUM`] frames standing in for RAM. Page tables,
//! user pages, and IPT slab pages all live here, so the software walkers
//! operate on the same bytes a hardware walker would. The lock is a leaf:
//! it is taken only inside the accessors below and never held across a
//! call, so it cannot participate in any lock-order cycle.

use alloc::boxed::Box;
use alloc::vec;

use lazy_static::lazy_static;
use spin::Mutex;

use super::{FrameNumber, PhysAddr};
use crate::param::{PFNNUM, PGSIZE};

struct PhysMem {
    bytes: Option<Box<[u8]>>,
}

lazy_static! {
    static ref PHYS: Mutex<PhysMem> = Mutex::new(PhysMem { bytes: None });
}

/// Bring up (or wipe, on reboot) the physical memory array.
pub fn init() {
    let mut mem = PHYS.lock();
    mem.bytes = Some(vec![0u8; PFNNUM * PGSIZE].into_boxed_slice());
}

fn check_range(pa: PhysAddr, len: usize) -> usize {
    let start = pa.as_u32() as usize;
    let end = start
        .checked_add(len)
        .unwrap_or_else(|| panic!("phys: address overflow at 0x{:x}", start));
    assert!(
        end <= PFNNUM * PGSIZE,
        "phys: access [0x{:x}, 0x{:x}) outside physical memory",
        start,
        end
    );
    start
}

/// Copy bytes out of physical memory.
pub fn read(pa: PhysAddr, buf: &mut [u8]) {
    let start = check_range(pa, buf.len());
    let mem = PHYS.lock();
    let bytes = mem.bytes.as_ref().expect("phys: not initialized");
    buf.copy_from_slice(&bytes[start..start + buf.len()]);
}

/// Copy bytes into physical memory.
pub fn write(pa: PhysAddr, data: &[u8]) {
    let start = check_range(pa, data.len());
    let mut mem = PHYS.lock();
    let bytes = mem.bytes.as_mut().expect("phys: not initialized");
    bytes[start..start + data.len()].copy_from_slice(data);
}

/// Read one aligned 32-bit word (PTE/PDE fetch).
pub fn read_u32(pa: PhysAddr) -> u32 {
    debug_assert_eq!(pa.as_u32() % 4, 0, "unaligned word read");
    let mut word = [0u8; 4];
    read(pa, &mut word);
    u32::from_le_bytes(word)
}

/// Write one aligned 32-bit word (PTE/PDE store).
pub fn write_u32(pa: PhysAddr, val: u32) {
    debug_assert_eq!(pa.as_u32() % 4, 0, "unaligned word write");
    write(pa, &val.to_le_bytes());
}

/// Zero a whole frame.
pub fn zero_frame(frame: FrameNumber) {
    let start = check_range(frame.as_addr(), PGSIZE);
    let mut mem = PHYS.lock();
    let bytes = mem.bytes.as_mut().expect("phys: not initialized");
    bytes[start..start + PGSIZE].fill(0);
}

/// Copy a whole frame (the COW duplication step).
pub fn copy_frame(src: FrameNumber, dst: FrameNumber) {
    let s = check_range(src.as_addr(), PGSIZE);
    let d = check_range(dst.as_addr(), PGSIZE);
    let mut mem = PHYS.lock();
    let bytes = mem.bytes.as_mut().expect("phys: not initialized");
    bytes.copy_within(s..s + PGSIZE, d);
}
