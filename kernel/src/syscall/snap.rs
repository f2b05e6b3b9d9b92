//! Snapshot syscalls and the block-address debug calls.

use alloc::sync::Arc;

use super::{copyinstr, copyout, SyscallResult};
use crate::error::{FsError, KernelError};
use crate::fs::{buffer, dir, inode, snapshot};
use crate::param::{BSIZE, NDIRECT, ROOTDEV};
use crate::process::Process;

/// Longest path accepted from user space.
const MAXPATH: usize = 128;

pub fn sys_snapshot_create() -> SyscallResult {
    let id = snapshot::snapshot_create(ROOTDEV)?;
    Ok(id as isize)
}

pub fn sys_snapshot_rollback(id: i32) -> SyscallResult {
    if id <= 0 {
        return Err(KernelError::InvalidArgument { name: "id" });
    }
    snapshot::snapshot_rollback(ROOTDEV, id as u32)?;
    Ok(0)
}

pub fn sys_snapshot_delete(id: i32) -> SyscallResult {
    if id <= 0 {
        return Err(KernelError::InvalidArgument { name: "id" });
    }
    snapshot::snapshot_delete(ROOTDEV, id as u32)?;
    Ok(0)
}

/// Copy a file's direct-address array (including the indirect pointer
/// slot) out to user space.
pub fn sys_get_addrs(proc: &Arc<Process>, path: u32, out: u32) -> SyscallResult {
    let path = copyinstr(proc, path, MAXPATH)?;
    let ip = dir::namei(&path)?;
    let addrs = ip.lock().addrs;
    inode::iput(ip);
    let mut bytes = [0u8; (NDIRECT + 1) * 4];
    for (i, addr) in addrs.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&addr.to_le_bytes());
    }
    copyout(proc, out, &bytes)?;
    Ok(0)
}

/// Copy the contents of a file's indirect block out to user space.
pub fn sys_get_indirect_addrs(proc: &Arc<Process>, path: u32, out: u32) -> SyscallResult {
    let path = copyinstr(proc, path, MAXPATH)?;
    let ip = dir::namei(&path)?;
    let ind = {
        let inner = ip.lock();
        inner.addrs[NDIRECT]
    };
    inode::iput(ip);
    if ind == 0 {
        return Err(KernelError::FsError(FsError::NotFound));
    }
    let data = {
        let handle = buffer::bread(ROOTDEV, ind);
        let buf = handle.lock();
        buf.data
    };
    copyout(proc, out, &data[..BSIZE])?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::process::spawn;
    use crate::syscall::{copyin, copyout as kcopyout, syscall, Syscall};
    use crate::testing::kernel_test;

    fn put_path(proc: &Arc<Process>, va: u32, path: &str) {
        let mut bytes = alloc::vec::Vec::from(path.as_bytes());
        bytes.push(0);
        kcopyout(proc, va, &bytes).unwrap();
    }

    fn mk_file(path: &str, content: &[u8]) {
        let ip = dir::create(path, inode::InodeType::File, 0, 0).unwrap();
        {
            let mut inner = ip.lock();
            inode::writei(&mut inner, content, 0).unwrap();
        }
        inode::iput(ip);
    }

    #[test]
    fn snapshot_lifecycle_through_syscalls() {
        kernel_test(|| {
            spawn("snap", 2).unwrap();
            mk_file("/hi", b"first");
            let id = syscall(Syscall::SnapshotCreate as usize, [0; 4]);
            assert_eq!(id, 1, "snapshot created with id: 1");
            dir::unlink("/hi").unwrap();
            assert_eq!(
                syscall(Syscall::SnapshotRollback as usize, [id as u32, 0, 0, 0]),
                0
            );
            let ip = dir::namei("/hi").unwrap();
            {
                let inner = ip.lock();
                let mut buf = [0u8; 5];
                assert_eq!(inode::readi(&inner, &mut buf, 0), 5);
                assert_eq!(&buf, b"first");
            }
            inode::iput(ip);
            assert_eq!(
                syscall(Syscall::SnapshotDelete as usize, [id as u32, 0, 0, 0]),
                0
            );
            // Gone now.
            assert_eq!(
                syscall(Syscall::SnapshotDelete as usize, [id as u32, 0, 0, 0]),
                -1
            );
            assert_eq!(syscall(Syscall::SnapshotRollback as usize, [0, 0, 0, 0]), -1);
        });
    }

    #[test]
    fn get_addrs_reports_direct_and_indirect_layout() {
        kernel_test(|| {
            let p = spawn("addrs", 4).unwrap();
            // Thirteen blocks: every direct slot plus one indirect entry.
            let content = vec![b'0'; (NDIRECT + 1) * BSIZE];
            mk_file("/hi", &content);
            put_path(&p, 0x800, "/hi");
            assert_eq!(syscall(Syscall::GetAddrs as usize, [0x800, 0x900, 0, 0]), 0);
            let mut bytes = [0u8; (NDIRECT + 1) * 4];
            copyin(&p, 0x900, &mut bytes).unwrap();
            let addr =
                |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
            for i in 0..=NDIRECT {
                assert_ne!(addr(i), 0, "slot {} populated", i);
            }
            // Indirect table: first entry non-zero, rest empty.
            assert_eq!(
                syscall(Syscall::GetIndirectAddrs as usize, [0x800, 0x1000, 0, 0]),
                0
            );
            let mut table = [0u8; BSIZE];
            copyin(&p, 0x1000, &mut table).unwrap();
            let ind0 = u32::from_le_bytes(table[0..4].try_into().unwrap());
            let ind1 = u32::from_le_bytes(table[4..8].try_into().unwrap());
            assert_ne!(ind0, 0);
            assert_eq!(ind1, 0);
        });
    }

    #[test]
    fn get_indirect_addrs_requires_an_indirect_block(){
        kernel_test(|| {
            let p = spawn("small", 1).unwrap();
            mk_file("/small", b"tiny");
            put_path(&p, 0x800, "/small");
            assert_eq!(
                syscall(Syscall::GetIndirectAddrs as usize, [0x800, 0x1000, 0, 0]),
                -1
            );
            // Missing path is a generic error too.
            put_path(&p, 0x800, "/absent");
            assert_eq!(syscall(Syscall::GetAddrs as usize, [0x800, 0x900, 0, 0]), -1);
        });
    }
}
