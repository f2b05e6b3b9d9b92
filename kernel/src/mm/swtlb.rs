//! Software TLB.
//!
//! Direct-mapped cache of `(pid, va_page)` → `(pa_page, flags)` with
//! monotonic hit/miss counters. The fault handler refills it on every
//! software-managed fault, and `vtop` consults it, so the counters make
//! the Present-bit emulation observable from user space.

use lazy_static::lazy_static;
use spin::Mutex;

use super::{PhysAddr, PteFlags, VirtAddr};
use crate::param::NUMTLB;

#[derive(Clone, Copy)]
struct TlbSlot {
    pid: i32,
    vpn: u32,
    pa_page: u32,
    flags: PteFlags,
    valid: bool,
}

impl TlbSlot {
    const INVALID: TlbSlot = TlbSlot {
        pid: -1,
        vpn: 0,
        pa_page: 0,
        flags: PteFlags::empty(),
        valid: false,
    };
}

struct SwTlb {
    slots: [TlbSlot; NUMTLB],
    hits: u64,
    misses: u64,
}

lazy_static! {
    static ref SWTLB: Mutex<SwTlb> = Mutex::new(SwTlb {
        slots: [TlbSlot::INVALID; NUMTLB],
        hits: 0,
        misses: 0,
    });
}

fn slot_index(pid: i32, va: VirtAddr) -> usize {
    ((pid as u32) ^ va.vpn()) as usize % NUMTLB
}

/// Reset all slots and counters (boot).
pub fn tlbinit() {
    let mut tlb = SWTLB.lock();
    tlb.slots = [TlbSlot::INVALID; NUMTLB];
    tlb.hits = 0;
    tlb.misses = 0;
}

/// Look up a translation; counts a hit or a miss either way.
pub fn lookup(pid: i32, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let mut tlb = SWTLB.lock();
    let slot = tlb.slots[slot_index(pid, va)];
    if slot.valid && slot.pid == pid && slot.vpn == va.vpn() {
        tlb.hits += 1;
        Some((PhysAddr::new(slot.pa_page << 12), slot.flags))
    } else {
        tlb.misses += 1;
        None
    }
}

/// Install a translation, overwriting whatever occupies the slot.
pub fn alloc(pid: i32, va: VirtAddr, pa: PhysAddr, flags: PteFlags) {
    let mut tlb = SWTLB.lock();
    tlb.slots[slot_index(pid, va)] = TlbSlot {
        pid,
        vpn: va.vpn(),
        pa_page: pa.as_u32() >> 12,
        flags,
        valid: true,
    };
}

/// Invalidate the slot for one `(pid, va)` if it holds that mapping.
pub fn invalidate(pid: i32, va: VirtAddr) {
    let mut tlb = SWTLB.lock();
    let slot = &mut tlb.slots[slot_index(pid, va)];
    if slot.valid && slot.pid == pid && slot.vpn == va.vpn() {
        *slot = TlbSlot::INVALID;
    }
}

/// Invalidate every entry belonging to a pid (process exit).
pub fn invalidate_pid(pid: i32) {
    let mut tlb = SWTLB.lock();
    for slot in tlb.slots.iter_mut() {
        if slot.valid && slot.pid == pid {
            *slot = TlbSlot::INVALID;
        }
    }
}

/// Drop every entry; counters are preserved (they are monotonic).
pub fn flush() {
    let mut tlb = SWTLB.lock();
    tlb.slots = [TlbSlot::INVALID; NUMTLB];
}

/// Current `(hits, misses)`.
pub fn counters() -> (u64, u64) {
    let tlb = SWTLB.lock();
    (tlb.hits, tlb.misses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::kernel_test;

    #[test]
    fn alloc_then_lookup_hits() {
        kernel_test(|| {
            let va = VirtAddr::new(0x7000);
            let pa = PhysAddr::new(0x2000);
            assert!(lookup(3, va).is_none());
            alloc(3, va, pa, PteFlags::U | PteFlags::W);
            let (hits0, misses0) = counters();
            let (got, flags) = lookup(3, va).expect("freshly installed entry");
            assert_eq!(got, pa);
            assert!(flags.contains(PteFlags::W));
            let (hits1, misses1) = counters();
            assert_eq!(hits1, hits0 + 1);
            assert_eq!(misses1, misses0);
        });
    }

    #[test]
    fn unrelated_invalidation_keeps_entry() {
        kernel_test(|| {
            let va = VirtAddr::new(0xa000);
            alloc(1, va, PhysAddr::new(0x3000), PteFlags::U);
            // Different pid and different va: both must leave the entry.
            invalidate(2, va);
            invalidate(1, VirtAddr::new(0xb000));
            invalidate_pid(9);
            assert!(lookup(1, va).is_some());
            invalidate(1, va);
            assert!(lookup(1, va).is_none());
        });
    }

    #[test]
    fn collision_overwrites() {
        kernel_test(|| {
            // Same slot: (1 ^ 1) % 128 == (1 ^ 129) % 128 == 0.
            let a = VirtAddr::new(1 << 12);
            let b = VirtAddr::new(129 << 12);
            assert_eq!(slot_index(1, a), slot_index(1, b));
            alloc(1, a, PhysAddr::new(0x4000), PteFlags::U);
            alloc(1, b, PhysAddr::new(0x5000), PteFlags::U);
            assert!(lookup(1, a).is_none(), "collision must evict");
            assert!(lookup(1, b).is_some());
        });
    }

    #[test]
    fn pid_invalidation_scrubs_all_entries() {
        kernel_test(|| {
            for page in 0..8u32 {
                alloc(5, VirtAddr::new(page << 12), PhysAddr::new(page << 12), PteFlags::U);
            }
            invalidate_pid(5);
            for page in 0..8u32 {
                assert!(lookup(5, VirtAddr::new(page << 12)).is_none());
            }
        });
    }
}
