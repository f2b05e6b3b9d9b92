//! Memory management
//!
//! Software address translation for a simulated 32-bit machine with
//! two-level hardware-style page tables: the frame tracker, the pure
//! software page walker, the inverted page table, the software TLB, the
//! per-process VA tracker, and the copy-on-write page-fault handler.

use bitflags::bitflags;

use crate::param::PGSIZE;

pub mod frame;
pub mod ipt;
pub mod mmu;
pub mod page_fault;
pub mod page_table;
pub mod phys;
pub mod swtlb;
pub mod tracker;

pub use frame::{FrameRecord, FrameTrackerStats};
pub use page_table::PageDir;

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u32);

impl FrameNumber {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_index(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 * PGSIZE as u32)
    }
}

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / PGSIZE as u32)
    }

    pub const fn page_offset(&self) -> u32 {
        self.0 % PGSIZE as u32
    }

    pub const fn offset(&self, off: u32) -> Self {
        Self::new(self.0 + off)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Round down to the containing page boundary.
    pub const fn page_base(&self) -> VirtAddr {
        Self::new(self.0 & !(PGSIZE as u32 - 1))
    }

    pub const fn page_offset(&self) -> u32 {
        self.0 % PGSIZE as u32
    }

    /// Virtual page number.
    pub const fn vpn(&self) -> u32 {
        self.0 >> 12
    }

    pub const fn is_user(&self) -> bool {
        self.0 < crate::param::KERNBASE
    }

    pub const fn add(&self, off: u32) -> Self {
        Self::new(self.0 + off)
    }
}

bitflags! {
    /// Page-table entry flag bits.
    ///
    /// `P`/`W`/`U` are the hardware bits; `T` and `C` live in the
    /// software-available range. `T` and `P` are mutually exclusive on a
    /// user mapping; `C` implies the mapping is non-writable and its
    /// frame is shared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Present
        const P = 1 << 0;
        /// Writable
        const W = 1 << 1;
        /// User-accessible
        const U = 1 << 2;
        /// Temporarily managed by the software TLB
        const T = 1 << 9;
        /// Copy-on-write pending
        const C = 1 << 10;
    }
}

/// Raw page-table / page-directory entry: frame address in the top 20
/// bits, flag bits in the bottom 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    const ADDR_MASK: u32 = !0xFFF;

    pub const ZERO: Pte = Pte(0);

    pub fn new(pa: PhysAddr, flags: PteFlags) -> Pte {
        Pte((pa.as_u32() & Self::ADDR_MASK) | flags.bits())
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn from_raw(raw: u32) -> Pte {
        Pte(raw)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & Self::ADDR_MASK)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    /// Mapped for translation purposes: hardware-present or
    /// software-managed.
    pub fn is_mapped(self) -> bool {
        self.flags().intersects(PteFlags::P | PteFlags::T)
    }

    pub fn with_flags(self, flags: PteFlags) -> Pte {
        Pte((self.0 & Self::ADDR_MASK) | flags.bits())
    }
}

/// Round an address down to a page boundary.
pub const fn page_round_down(addr: u32) -> u32 {
    addr & !(PGSIZE as u32 - 1)
}

/// Round an address up to a page boundary.
pub const fn page_round_up(addr: u32) -> u32 {
    (addr + PGSIZE as u32 - 1) & !(PGSIZE as u32 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_math() {
        let va = VirtAddr::new(0x1234);
        assert_eq!(va.page_base().as_u32(), 0x1000);
        assert_eq!(va.page_offset(), 0x234);
        assert_eq!(va.vpn(), 1);
        assert!(va.is_user());
        assert!(!VirtAddr::new(crate::param::KERNBASE).is_user());
        assert_eq!(page_round_up(1), PGSIZE as u32);
        assert_eq!(page_round_down(PGSIZE as u32 + 1), PGSIZE as u32);
    }

    #[test]
    fn pte_packing() {
        let pa = PhysAddr::new(0x5000);
        let pte = Pte::new(pa, PteFlags::T | PteFlags::U | PteFlags::W);
        assert_eq!(pte.addr(), pa);
        assert!(pte.is_mapped());
        assert!(!pte.is_present());
        let promoted = pte.with_flags(pte.flags() - PteFlags::T | PteFlags::P);
        assert!(promoted.is_present());
        assert_eq!(promoted.addr(), pa);
        assert!(!promoted.flags().contains(PteFlags::T));
    }

    #[test]
    fn frame_addr_round_trip() {
        let f = FrameNumber::new(7);
        assert_eq!(f.as_addr().as_u32(), 7 * PGSIZE as u32);
        assert_eq!(f.as_addr().frame(), f);
    }
}
