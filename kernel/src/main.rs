//! Hosted demo of the UmbraOS kernel subsystems.
//!
//! Boots the simulated machine, then walks the two showcase flows: a
//! fork with copy-on-write resolution observed through `vtop`-style
//! walks, and a snapshot create / clobber / rollback round trip.

use umbra_kernel::fs::{dir, inode, snapshot};
use umbra_kernel::mm::{frame, ipt, mmu, swtlb, VirtAddr};
use umbra_kernel::param::ROOTDEV;
use umbra_kernel::process;

fn main() {
    umbra_kernel::boot();
    println!("umbra: machine up ({} frames free)", frame::stats().free_frames);

    // --- fork / COW ---------------------------------------------------
    let parent = process::spawn("demo", 4).expect("spawn");
    mmu::store_user(&parent, VirtAddr::new(0), b"shared page").expect("store");
    let child = process::fork(&parent).expect("fork");
    let (pa, _) = parent.pgdir().sw_vtop(VirtAddr::new(0)).expect("vtop");
    println!(
        "fork: frame {} shared by {} mappings (refcnt {})",
        pa.frame().as_u32(),
        ipt::chain_len(pa),
        frame::refcnt(pa.frame())
    );

    process::set_current(Some(&child));
    mmu::store_user(&child, VirtAddr::new(0), b"C").expect("cow write");
    let (child_pa, _) = child.pgdir().sw_vtop(VirtAddr::new(0)).expect("vtop");
    println!(
        "cow: child moved to frame {}, old chain now {} entries",
        child_pa.frame().as_u32(),
        ipt::chain_len(pa)
    );
    let (hits, misses) = swtlb::counters();
    println!("swtlb: {} hits / {} misses", hits, misses);

    // --- snapshot / rollback ------------------------------------------
    let file = dir::create("/hello", inode::InodeType::File, 0, 0).expect("create");
    {
        let mut inner = file.lock();
        inode::writei(&mut inner, b"before snapshot", 0).expect("write");
    }
    inode::iput(file);
    let id = snapshot::snapshot_create(ROOTDEV).expect("snapshot");
    println!("snapshot created with id: {}", id);

    let file = dir::namei("/hello").expect("namei");
    {
        let mut inner = file.lock();
        inode::writei(&mut inner, b"CLOBBERED!!!!!!", 0).expect("write");
    }
    inode::iput(file);
    snapshot::snapshot_rollback(ROOTDEV, id).expect("rollback");

    let file = dir::namei("/hello").expect("namei");
    let mut buf = [0u8; 15];
    {
        let inner = file.lock();
        inode::readi(&inner, &mut buf, 0);
    }
    inode::iput(file);
    println!(
        "rollback: /hello reads {:?}",
        core::str::from_utf8(&buf).unwrap()
    );
    snapshot::snapshot_delete(ROOTDEV, id).expect("delete");
    println!("snapshot {} deleted", id);
}
