//! End-to-end address-translation scenarios: fork/COW chains, the
//! software-TLB counters as seen through syscalls, frame accounting
//! under memory stress, and the Present-bit emulation cycle.

use std::sync::Mutex;

use umbra_kernel::mm::{frame, ipt, mmu, swtlb, PteFlags, VirtAddr};
use umbra_kernel::param::{MAX_TRACKERS, PGSIZE};
use umbra_kernel::process;
use umbra_kernel::syscall::{syscall, Syscall};

static MACHINE: Mutex<()> = Mutex::new(());

fn on_fresh_machine(f: impl FnOnce()) {
    let _guard = MACHINE.lock().unwrap_or_else(|p| p.into_inner());
    umbra_kernel::boot();
    f();
}

// Scratch buffers live in page 1 so syscall output never perturbs the
// page-0 sharing the tests assert on.
const PA_OUT: u32 = 0x1700;
const FLAGS_OUT: u32 = 0x1704;

fn vtop_via_syscall(proc: &std::sync::Arc<process::Process>, va: u32) -> (u32, u32) {
    assert_eq!(syscall(Syscall::Vtop as usize, [va, PA_OUT, FLAGS_OUT, 0]), 0);
    let mut word = [0u8; 4];
    mmu::load_user(proc, VirtAddr::new(PA_OUT), &mut word).unwrap();
    let pa = u32::from_le_bytes(word);
    mmu::load_user(proc, VirtAddr::new(FLAGS_OUT), &mut word).unwrap();
    (pa, u32::from_le_bytes(word))
}

#[test]
fn forked_children_share_then_diverge() {
    on_fresh_machine(|| {
        let parent = process::spawn("shared", 2).unwrap();
        mmu::store_user(&parent, VirtAddr::new(0), b"fork me").unwrap();

        let c1 = process::fork(&parent).unwrap();
        let c2 = process::fork(&parent).unwrap();
        let c3 = process::fork(&parent).unwrap();

        let (parent_pa, _) = parent.pgdir().sw_vtop(VirtAddr::new(0)).unwrap();
        assert_eq!(frame::refcnt(parent_pa.frame()), 4);
        assert_eq!(ipt::chain_len(parent_pa), 4);

        // Each child sees the parent's physical page through vtop.
        for child in [&c1, &c2, &c3] {
            process::set_current(Some(child));
            let (pa, _) = vtop_via_syscall(child, 0);
            assert_eq!(pa, parent_pa.as_u32());
            let n = syscall(
                Syscall::Phys2Virt as usize,
                [parent_pa.as_u32(), 0x1800, 8, 0],
            );
            assert_eq!(n, 4);
        }

        // One child writes; its translation moves, the old chain
        // shrinks by one, the new chain has one entry.
        process::set_current(Some(&c2));
        mmu::store_user(&c2, VirtAddr::new(0), b"C").unwrap();
        let (new_pa, _) = vtop_via_syscall(&c2, 0);
        assert_ne!(new_pa, parent_pa.as_u32());
        assert_eq!(ipt::chain_len(parent_pa), 3);
        assert_eq!(frame::refcnt(parent_pa.frame()), 3);
        let n = syscall(
            Syscall::Phys2Virt as usize,
            [parent_pa.as_u32(), 0x1800, 8, 0],
        );
        assert_eq!(n, 3, "phys2virt reflects the shorter chain");

        // Content: writer diverged, the others still read the original.
        let mut buf = [0u8; 7];
        mmu::load_user(&c2, VirtAddr::new(0), &mut buf).unwrap();
        assert_eq!(&buf, b"Cork me");
        process::set_current(Some(&c1));
        mmu::load_user(&c1, VirtAddr::new(0), &mut buf).unwrap();
        assert_eq!(&buf, b"fork me");
    });
}

#[test]
fn memstress_frames_are_consecutive_and_reclaimed() {
    on_fresh_machine(|| {
        let a = process::spawn("memstress", 31).unwrap();
        let b = process::spawn("memstress", 31).unwrap();

        let owned = |pid: i32| -> Vec<u32> {
            frame::dump(usize::MAX)
                .iter()
                .filter(|r| r.allocated == 1 && r.pid == pid)
                .map(|r| r.frame)
                .collect()
        };

        let a_frames = owned(a.pid);
        assert_eq!(a_frames.len(), 31);
        for pair in a_frames.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "owned frames are consecutive");
        }
        let b_frames = owned(b.pid);
        assert_eq!(b_frames.len(), 31);

        let free_before_exit = frame::stats().free_frames;
        process::exit(&a);
        process::exit(&b);
        assert!(owned(a.pid).is_empty());
        assert!(owned(b.pid).is_empty(), "memdump -p shows no rows after exit");
        // 31 data + 1 page table + 1 pgdir each.
        assert_eq!(frame::stats().free_frames, free_before_exit + 2 * 33);
    });
}

#[test]
fn vtop_counts_one_miss_per_new_page_then_hits() {
    on_fresh_machine(|| {
        let p = process::spawn("vtop", 8).unwrap();
        // Warm the scratch page so reading syscall output stops
        // generating faults of its own.
        let mut word = [0u8; 4];
        mmu::load_user(&p, VirtAddr::new(PA_OUT), &mut word).unwrap();

        let (_, misses_before) = swtlb::counters();
        for page in 2..8u32 {
            vtop_via_syscall(&p, page * PGSIZE as u32);
        }
        let (hits_mid, misses_mid) = swtlb::counters();
        assert_eq!(
            misses_mid,
            misses_before + 6,
            "one miss per previously-untranslated page"
        );
        for page in 2..8u32 {
            vtop_via_syscall(&p, page * PGSIZE as u32);
        }
        let (hits_after, misses_after) = swtlb::counters();
        assert_eq!(misses_after, misses_mid, "re-walk misses nothing");
        assert_eq!(hits_after, hits_mid + 6);

        // tlbinfo reports the same numbers.
        assert_eq!(syscall(Syscall::TlbInfo as usize, [0x1600, 0x1604, 0, 0]), 0);
        mmu::load_user(&p, VirtAddr::new(0x1600), &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word) as u64, hits_after);
    });
}

#[test]
fn present_bit_emulation_refaults_after_tracker_overflow() {
    on_fresh_machine(|| {
        let pages = MAX_TRACKERS + 1;
        let p = process::spawn("walker", pages).unwrap();
        let mut byte = [0u8; 1];

        // First sweep: every page faults once into the SW-TLB.
        let (_, m0) = swtlb::counters();
        for page in 0..pages {
            mmu::load_user(&p, VirtAddr::new((page * PGSIZE) as u32), &mut byte).unwrap();
        }
        let (_, m1) = swtlb::counters();
        assert_eq!(m1 - m0, pages as u64);

        // The overflow demoted the first batch: touching those pages
        // traps again, and this time the SW-TLB already holds them.
        let (h1, _) = swtlb::counters();
        for page in 0..MAX_TRACKERS {
            mmu::load_user(&p, VirtAddr::new((page * PGSIZE) as u32), &mut byte).unwrap();
        }
        let (h2, _) = swtlb::counters();
        assert_eq!(h2 - h1, MAX_TRACKERS as u64, "demoted pages re-fault into hits");

        // The second sweep overflowed the tracker once more (it still
        // held the last page of the first sweep), so the final fault is
        // the only promotion left standing.
        let (_, flags) = p
            .pgdir()
            .sw_vtop(VirtAddr::new(((MAX_TRACKERS - 1) * PGSIZE) as u32))
            .unwrap();
        assert!(flags.contains(PteFlags::P), "most recent fault stays promoted");
        let (_, flags) = p
            .pgdir()
            .sw_vtop(VirtAddr::new((MAX_TRACKERS * PGSIZE) as u32))
            .unwrap();
        assert!(
            flags.contains(PteFlags::T) && !flags.contains(PteFlags::P),
            "older promotion was demoted back to software management"
        );
    });
}

#[test]
fn exit_reclaims_translation_state_of_forked_tree() {
    on_fresh_machine(|| {
        let parent = process::spawn("tree", 3).unwrap();
        let child = process::fork(&parent).unwrap();
        let (pa, _) = parent.pgdir().sw_vtop(VirtAddr::new(0)).unwrap();
        assert_eq!(ipt::chain_len(pa), 2);

        process::exit(&child);
        assert_eq!(ipt::chain_len(pa), 1, "child's IPT entries dropped");
        assert_eq!(frame::refcnt(pa.frame()), 1);

        // Parent keeps working after the child is gone.
        process::set_current(Some(&parent));
        mmu::store_user(&parent, VirtAddr::new(16), b"alive").unwrap();
        let mut buf = [0u8; 5];
        mmu::load_user(&parent, VirtAddr::new(16), &mut buf).unwrap();
        assert_eq!(&buf, b"alive");
    });
}
