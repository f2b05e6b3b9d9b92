//! UmbraOS kernel library
//!
//! Two tightly coupled subsystems over a simulated 32-bit teaching
//! machine: a software address-translation layer (inverted page table,
//! software TLB, copy-on-write page-fault handling layered on
//! hardware-style paging) and a copy-on-write filesystem snapshotting
//! service over a block-allocated, journaled on-disk format.
//!
//! The crate is `no_std` + `alloc`; on the host target the standard
//! `#[test]` harness (and the `umbra` demo binary) link `std` and use
//! the system allocator, so the whole kernel is exercised as ordinary
//! code.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod fs;
pub mod mm;
pub mod param;
pub mod process;
pub mod syscall;
pub mod time;

pub use error::{KernelError, KernelResult};

/// Bring the machine up: physical memory and the frame tracker, the
/// inverted page table, the software TLB, the process table, then the
/// disk (formatted when blank) with log recovery and snapshot metadata.
///
/// Re-entrant: calling it again resets the whole simulated machine,
/// which is how the test suite gets a fresh kernel per case.
pub fn boot() {
    time::init();
    mm::frame::kinit();
    mm::ipt::iptinit();
    mm::swtlb::tlbinit();
    mm::mmu::flush();
    process::init();
    fs::blockdev::disk().wipe();
    fs::mount(param::ROOTDEV);
    log::info!("umbra: boot complete");
}
