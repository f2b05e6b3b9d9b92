//! End-to-end snapshot scenarios, driven the way the user programs
//! drive them: through the syscall layer where a CLI would sit, and
//! through the filesystem API for setup the shell would do.

use std::sync::Mutex;

use umbra_kernel::fs::{dir, inode, snapshot};
use umbra_kernel::mm::{mmu, VirtAddr};
use umbra_kernel::param::{BSIZE, NDIRECT, NINODES, ROOTDEV};
use umbra_kernel::process::{self, Process};
use umbra_kernel::syscall::{syscall, Syscall};

static MACHINE: Mutex<()> = Mutex::new(());

fn on_fresh_machine(f: impl FnOnce()) {
    let _guard = MACHINE.lock().unwrap_or_else(|p| p.into_inner());
    umbra_kernel::boot();
    f();
}

fn mk_file(path: &str, content: &[u8]) {
    let ip = dir::create(path, inode::InodeType::File, 0, 0).unwrap();
    {
        let mut inner = ip.lock();
        inode::writei(&mut inner, content, 0).unwrap();
    }
    inode::iput(ip);
}

fn append(path: &str, data: &[u8]) {
    let ip = dir::namei(path).unwrap();
    {
        let mut inner = ip.lock();
        let size = inner.size;
        inode::writei(&mut inner, data, size).unwrap();
    }
    inode::iput(ip);
}

fn read_file(path: &str) -> Vec<u8> {
    let ip = dir::namei(path).unwrap();
    let inner = ip.lock();
    let mut out = vec![0u8; inner.size as usize];
    assert_eq!(inode::readi(&inner, &mut out, 0), out.len());
    drop(inner);
    inode::iput(ip);
    out
}

/// The `mk_test_file` shape: every direct block plus the first indirect
/// block populated, block `bn` tagged with its digit, and the tail left
/// mid-block so appends land in an occupied block.
fn mk_test_file(path: &str) -> Vec<u8> {
    let mut content = vec![0u8; (NDIRECT + 1) * BSIZE - 100];
    for bn in 0..=NDIRECT {
        content[bn * BSIZE] = b'0' + (bn % 10) as u8;
    }
    mk_file(path, &content);
    content
}

/// `print_addr`-style view of a file through the debug syscalls.
fn addrs_via_syscall(sh: &std::sync::Arc<Process>, path: &str) -> ([u32; NDIRECT + 1], Vec<u32>) {
    let path_va = 0x100u32;
    let out_va = 0x200u32;
    let mut bytes = Vec::from(path.as_bytes());
    bytes.push(0);
    mmu::store_user(sh, VirtAddr::new(path_va), &bytes).unwrap();
    assert_eq!(syscall(Syscall::GetAddrs as usize, [path_va, out_va, 0, 0]), 0);
    let mut raw = [0u8; (NDIRECT + 1) * 4];
    mmu::load_user(sh, VirtAddr::new(out_va), &mut raw).unwrap();
    let mut addrs = [0u32; NDIRECT + 1];
    for (i, addr) in addrs.iter_mut().enumerate() {
        *addr = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
    }

    let ind_va = 0x400u32;
    let indirect = if addrs[NDIRECT] != 0 {
        assert_eq!(
            syscall(Syscall::GetIndirectAddrs as usize, [path_va, ind_va, 0, 0]),
            0
        );
        let mut table = [0u8; BSIZE];
        mmu::load_user(sh, VirtAddr::new(ind_va), &mut table).unwrap();
        (0..BSIZE / 4)
            .map(|i| u32::from_le_bytes(table[i * 4..i * 4 + 4].try_into().unwrap()))
            .collect()
    } else {
        Vec::new()
    };
    (addrs, indirect)
}

#[test]
fn mk_test_file_then_append_diverges_only_the_touched_blocks() {
    on_fresh_machine(|| {
        let sh = process::spawn("sh", 2).unwrap();
        mk_test_file("/hi");

        let (before, ind_before) = addrs_via_syscall(&sh, "/hi");
        for (i, addr) in before.iter().enumerate() {
            assert_ne!(*addr, 0, "direct slot {} populated", i);
        }
        assert_ne!(ind_before[0], 0, "addr[12]->[0] is non-zero");

        let id = syscall(Syscall::SnapshotCreate as usize, [0; 4]);
        assert_eq!(id, 1, "snapshot created with id: 1");

        // The append point sits inside the first indirect block, so the
        // whole indirect subtree migrates while every direct address
        // stays shared with the snapshot.
        append("/hi", b"XYZ");
        let (after, ind_after) = addrs_via_syscall(&sh, "/hi");
        assert_ne!(after[NDIRECT], before[NDIRECT], "indirect pointer replaced");
        assert_ne!(ind_after[0], ind_before[0], "indirect data block migrated");
        for i in 0..NDIRECT {
            assert_eq!(after[i], before[i], "direct slot {} still shared", i);
        }

        // Direct-block case: append into a file whose tail is a direct
        // block clones exactly that block.
        mk_file("/direct", &vec![b'd'; 2 * BSIZE - 4]);
        let (dbefore, _) = addrs_via_syscall(&sh, "/direct");
        assert_eq!(syscall(Syscall::SnapshotCreate as usize, [0; 4]), 2);
        append("/direct", b"XYZ");
        let (dafter, _) = addrs_via_syscall(&sh, "/direct");
        assert_ne!(dafter[1], dbefore[1], "append point cloned");
        assert_eq!(dafter[0], dbefore[0], "untouched block still shared");
    });
}

#[test]
fn rollback_after_rm_restores_exact_content() {
    on_fresh_machine(|| {
        process::spawn("sh", 1).unwrap();
        let content = mk_test_file("/hi");
        let id = syscall(Syscall::SnapshotCreate as usize, [0; 4]);
        assert_eq!(id, 1);

        dir::unlink("/hi").unwrap();
        assert!(dir::namei("/hi").is_err());

        assert_eq!(
            syscall(Syscall::SnapshotRollback as usize, [id as u32, 0, 0, 0]),
            0
        );
        let restored = read_file("/hi");
        assert_eq!(restored, content);
        assert_eq!(restored[0], b'0', "first byte of block 0 survives");
    });
}

#[test]
fn round_trip_create_then_rollback_is_identity() {
    on_fresh_machine(|| {
        process::spawn("sh", 1).unwrap();
        let content: Vec<u8> = (0..3 * BSIZE + 17).map(|i| (i % 251) as u8).collect();
        mk_file("/f", &content);
        let before_inum = dir::namei("/f").map(|ip| {
            let inum = ip.inum;
            inode::iput(ip);
            inum
        });

        let id = syscall(Syscall::SnapshotCreate as usize, [0; 4]);
        assert!(id >= 1);
        assert_eq!(
            syscall(Syscall::SnapshotRollback as usize, [id as u32, 0, 0, 0]),
            0
        );
        assert_eq!(read_file("/f"), content, "content identical after round trip");
        // Inode numbers need not survive.
        let _ = before_inum;
    });
}

#[test]
fn delete_unblocks_admission_after_inode_exhaustion() {
    on_fresh_machine(|| {
        process::spawn("sh", 1).unwrap();
        // Populate enough live files that one mirror fits but two do not.
        let live_files = 66;
        for i in 0..live_files {
            mk_file(&format!("/f{:02}", i), b"payload");
        }
        let first = syscall(Syscall::SnapshotCreate as usize, [0; 4]);
        assert_eq!(first, 1);
        assert_eq!(
            syscall(Syscall::SnapshotCreate as usize, [0; 4]),
            -2,
            "second snapshot must hit OUT_OF_INODES"
        );
        assert_eq!(
            syscall(Syscall::SnapshotDelete as usize, [first as u32, 0, 0, 0]),
            0
        );
        let retry = syscall(Syscall::SnapshotCreate as usize, [0; 4]);
        assert_eq!(retry, 2, "admission passes once the mirror inodes are freed");
    });
}

#[test]
fn snapshot_reads_are_frozen_while_live_tree_moves_on() {
    on_fresh_machine(|| {
        process::spawn("sh", 1).unwrap();
        mk_file("/log", b"generation 1");
        let id1 = snapshot::snapshot_create(ROOTDEV).unwrap();
        let ip = dir::namei("/log").unwrap();
        {
            let mut inner = ip.lock();
            inode::writei(&mut inner, b"generation 2", 0).unwrap();
        }
        inode::iput(ip);
        let id2 = snapshot::snapshot_create(ROOTDEV).unwrap();

        assert_eq!(
            read_file(&format!("/snapshot/{:08x}/log", id1)),
            b"generation 1"
        );
        assert_eq!(
            read_file(&format!("/snapshot/{:08x}/log", id2)),
            b"generation 2"
        );
        assert_eq!(read_file("/log"), b"generation 2");

        // Rolling back to the older generation and re-reading.
        snapshot::snapshot_rollback(ROOTDEV, id1).unwrap();
        assert_eq!(read_file("/log"), b"generation 1");
        assert_eq!(
            read_file(&format!("/snapshot/{:08x}/log", id2)),
            b"generation 2",
            "newer snapshot unaffected by rollback"
        );
    });
}

#[test]
fn nested_directories_mirror_and_restore() {
    on_fresh_machine(|| {
        process::spawn("sh", 1).unwrap();
        dir::create("/a", inode::InodeType::Dir, 0, 0).map(inode::iput).unwrap();
        dir::create("/a/b", inode::InodeType::Dir, 0, 0).map(inode::iput).unwrap();
        mk_file("/a/b/deep", b"buried treasure");
        let id = snapshot::snapshot_create(ROOTDEV).unwrap();

        assert_eq!(
            read_file(&format!("/snapshot/{:08x}/a/b/deep", id)),
            b"buried treasure"
        );

        dir::unlink("/a/b/deep").unwrap();
        dir::unlink("/a/b").unwrap();
        dir::unlink("/a").unwrap();
        snapshot::snapshot_rollback(ROOTDEV, id).unwrap();
        assert_eq!(read_file("/a/b/deep"), b"buried treasure");

        // Sanity: the inode table is not leaking across the cycle.
        assert!(inode::allocated_count(ROOTDEV) < NINODES / 2);
    });
}
