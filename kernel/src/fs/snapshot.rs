//! Whole-filesystem snapshots.
//!
//! A snapshot is a mirror of `/` under `/snapshot/<08x-id>`: directories
//! are freshly built, file inodes share their data-block addresses with
//! the live file they shadow. The `smap` bitmap marks every shared
//! block; `bfree` refuses to release marked blocks and `writei` clones
//! them before overwriting. The bitmap and the next snapshot id persist
//! in `/snapshot/smap`.
//!
//! Delete is precise: it scans the other snapshots and the live tree
//! once, frees blocks only the dead snapshot referenced, and un-marks
//! blocks that fall back to live-only ownership.

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ::log::{info, warn};
use lazy_static::lazy_static;
use spin::Mutex;

use super::dir::{self, direntries};
use super::inode::{self, Inode, InodeInner, InodeType};
use super::{bfree, buffer, log};
use crate::error::{KernelError, KernelResult};
use crate::param::{FSSIZE, NDIRECT, NINDIRECT, NINODES, SMAP_FILE, SNAPDIR};

/// Bytes in the shared-block bitmap.
const SMAP_BYTES: usize = FSSIZE / 8;

/// Persisted size of the metadata file: `next_id` then the raw bitmap,
/// no padding.
const SMETA_BYTES: usize = 4 + SMAP_BYTES;

struct SnapMeta {
    next_id: u32,
    smap: [u8; SMAP_BYTES],
}

lazy_static! {
    static ref SMETA: Mutex<SnapMeta> = Mutex::new(SnapMeta {
        next_id: 1,
        smap: [0u8; SMAP_BYTES],
    });
}

fn snapshot_path(id: u32) -> String {
    format!("/{}/{:08x}", SNAPDIR, id)
}

fn smap_path() -> String {
    format!("/{}/{}", SNAPDIR, SMAP_FILE)
}

/// Load (or default-initialize) the snapshot metadata at mount.
pub fn sminit(dev: u32) {
    let _ = dev;
    {
        let mut meta = SMETA.lock();
        meta.next_id = 1;
        meta.smap = [0u8; SMAP_BYTES];
    }
    if let Ok(ip) = dir::namei(&smap_path()) {
        let mut bytes = [0u8; SMETA_BYTES];
        let n = {
            let inner = ip.lock();
            inode::readi(&inner, &mut bytes, 0)
        };
        inode::iput(ip);
        if n == SMETA_BYTES {
            let mut meta = SMETA.lock();
            meta.next_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            meta.smap.copy_from_slice(&bytes[4..]);
            info!("sminit: next id {}", meta.next_id);
        } else {
            warn!("sminit: short smap file ({} bytes), reinitialized", n);
        }
    }
}

/// Whether a snapshot references block `b`.
pub fn block_shared(b: u32) -> bool {
    let meta = SMETA.lock();
    meta.smap[(b / 8) as usize] & (1 << (b % 8)) != 0
}

pub(crate) fn set_shared(b: u32) {
    let mut meta = SMETA.lock();
    meta.smap[(b / 8) as usize] |= 1 << (b % 8);
}

pub(crate) fn clear_shared(b: u32) {
    let mut meta = SMETA.lock();
    meta.smap[(b / 8) as usize] &= !(1 << (b % 8));
}

#[cfg(test)]
pub fn set_shared_for_test(b: u32) {
    set_shared(b);
}

#[cfg(test)]
pub fn clear_shared_for_test(b: u32) {
    clear_shared(b);
}

/// Every block address a file inode references: direct blocks, the
/// indirect block itself, and everything the indirect table points at.
fn blocks_of(inner: &InodeInner) -> Vec<u32> {
    let mut out = Vec::new();
    for addr in inner.addrs.iter().take(NDIRECT) {
        if *addr != 0 {
            out.push(*addr);
        }
    }
    let ind = inner.addrs[NDIRECT];
    if ind != 0 {
        out.push(ind);
        let handle = buffer::bread(inner.dev, ind);
        let data = handle.lock().data;
        for i in 0..NINDIRECT {
            let addr = u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
            if addr != 0 {
                out.push(addr);
            }
        }
    }
    out
}

/// Mark every block of a (locked) file inode as snapshot-shared.
pub fn smapi(inner: &InodeInner) {
    for b in blocks_of(inner) {
        set_shared(b);
    }
}

/// Rewrite `/snapshot/smap` from the in-memory metadata, creating the
/// path on first use. Nests inside the caller's transaction when one is
/// open. Failure to materialize the metadata file is a kernel invariant
/// violation and panics.
pub fn persist(dev: u32) {
    let _ = dev;
    let mut bytes = [0u8; SMETA_BYTES];
    {
        let meta = SMETA.lock();
        bytes[0..4].copy_from_slice(&meta.next_id.to_le_bytes());
        bytes[4..].copy_from_slice(&meta.smap);
    }
    log::begin_op();
    let sdir = dir::create(&format!("/{}", SNAPDIR), InodeType::Dir, 0, 0)
        .expect("snapshot directory");
    inode::iput(sdir);
    let ip = dir::create(&smap_path(), InodeType::File, 0, 0).expect("snapshot metadata file");
    {
        let mut inner = ip.lock();
        inode::writei(&mut inner, &bytes, 0).expect("snapshot metadata write");
    }
    inode::iput(ip);
    log::end_op();
}

/// Admission control shared by create and rollback: the larger of the
/// on-disk and in-core inode usage, plus what the operation needs, must
/// fit the inode table. `req` may come out negative for rollback and
/// counts as zero.
fn admit(dev: u32, req: i64, extra: i64) -> KernelResult<()> {
    let used_disk = inode::allocated_count(dev) as i64;
    let used_core = inode::cached_count() as i64;
    let req = req.max(0);
    if used_disk.max(used_core) + req + extra > NINODES as i64 {
        return Err(KernelError::OutOfInodes);
    }
    Ok(())
}

/// Count the inodes a mirror of `dirip` would need: every file and
/// directory below it, devices excluded; `/snapshot` itself is excluded
/// when counting from the root.
fn icount(dev: u32, dirip: &Arc<Inode>, at_root: bool) -> i64 {
    let entries = {
        let inner = dirip.lock();
        direntries(&inner)
    };
    let mut count = 0i64;
    for de in entries {
        let name = de.name_string();
        if name == "." || name == ".." || (at_root && name == SNAPDIR) {
            continue;
        }
        let child = inode::iget(dev, de.inum as u32);
        let typ = child.lock().typ;
        match typ {
            InodeType::Dev | InodeType::Free => {}
            InodeType::File => count += 1,
            InodeType::Dir => count += 1 + icount(dev, &child, false),
        }
        inode::iput(child);
    }
    count
}

/// Mirror one file inode: fresh inode, shared block addresses, source
/// blocks marked shared.
fn icopy_file(dev: u32, src: &Arc<Inode>, dst_dir: &Arc<Inode>, name: &str) -> KernelResult<()> {
    log::begin_op();
    let result = (|| -> KernelResult<()> {
        let mirror = inode::ialloc(dev, InodeType::File)?;
        {
            let src_inner = src.lock();
            let mut m = mirror.lock();
            m.major = src_inner.major;
            m.minor = src_inner.minor;
            m.size = src_inner.size;
            m.addrs = src_inner.addrs;
            m.nlink = 1;
            inode::iupdate(&m);
            smapi(&src_inner);
        }
        {
            let mut d = dst_dir.lock();
            dir::dirlink(&mut d, name, mirror.inum)?;
        }
        inode::iput(mirror);
        Ok(())
    })();
    persist(dev);
    log::end_op();
    result
}

/// Mirror one directory level under `dst_dir` and recurse.
fn icopy_tree(
    dev: u32,
    src_dir: &Arc<Inode>,
    dst_dir: &Arc<Inode>,
    at_root: bool,
) -> KernelResult<()> {
    let entries = {
        let inner = src_dir.lock();
        direntries(&inner)
    };
    for de in entries {
        let name = de.name_string();
        if name == "." || name == ".." || (at_root && name == SNAPDIR) {
            continue;
        }
        let child = inode::iget(dev, de.inum as u32);
        let typ = child.lock().typ;
        let result = match typ {
            InodeType::Dev | InodeType::Free => Ok(()),
            InodeType::File => icopy_file(dev, &child, dst_dir, &name),
            InodeType::Dir => match create_dir_under(dev, dst_dir, &name) {
                Ok(sub) => {
                    let res = icopy_tree(dev, &child, &sub, false);
                    inode::iput(sub);
                    res
                }
                Err(err) => Err(err),
            },
        };
        inode::iput(child);
        result?;
    }
    Ok(())
}

/// Create a snapshot of `/`. Returns its id (≥ 1).
pub fn snapshot_create(dev: u32) -> KernelResult<u32> {
    let root = dir::namei("/")?;
    let req = icount(dev, &root, true);
    let admitted = admit(dev, req, 1);
    if let Err(err) = admitted {
        inode::iput(root);
        return Err(err);
    }

    let id = {
        let mut meta = SMETA.lock();
        let id = meta.next_id;
        meta.next_id += 1;
        id
    };
    persist(dev);

    let mirror = match dir::create(&snapshot_path(id), InodeType::Dir, 0, 0) {
        Ok(m) => m,
        Err(err) => {
            inode::iput(root);
            return Err(err);
        }
    };
    let result = icopy_tree(dev, &root, &mirror, true);
    inode::iput(mirror);
    inode::iput(root);
    result?;
    persist(dev);
    info!("snapshot {} created", id);
    Ok(id)
}

/// Restore one file from its snapshot mirror: protect the shared blocks,
/// then link a fresh inode sharing them into the target directory.
fn irestore(dev: u32, snap: &Arc<Inode>, dst_dir: &Arc<Inode>, name: &str) -> KernelResult<()> {
    log::begin_op();
    let result = (|| -> KernelResult<()> {
        {
            let snap_inner = snap.lock();
            smapi(&snap_inner);
        }
        persist(dev);
        let fresh = inode::ialloc(dev, InodeType::File)?;
        {
            let snap_inner = snap.lock();
            let mut f = fresh.lock();
            f.major = snap_inner.major;
            f.minor = snap_inner.minor;
            f.size = snap_inner.size;
            f.addrs = snap_inner.addrs;
            f.nlink = 1;
            inode::iupdate(&f);
        }
        {
            let mut d = dst_dir.lock();
            dir::dirlink(&mut d, name, fresh.inum)?;
        }
        inode::iput(fresh);
        Ok(())
    })();
    log::end_op();
    result
}

/// Unlink `name` (a file) from a target directory during rollback.
fn unlink_existing(dev: u32, dst_dir: &Arc<Inode>, name: &str) -> KernelResult<()> {
    log::begin_op();
    let result = (|| -> KernelResult<()> {
        let inum = {
            let mut d = dst_dir.lock();
            dir::dirunlink(&mut d, name)?
        };
        let victim = inode::iget(dev, inum);
        {
            let mut v = victim.lock();
            if v.typ == InodeType::Dir {
                let mut d = dst_dir.lock();
                d.nlink -= 1;
                inode::iupdate(&d);
            }
            v.nlink -= 1;
            inode::iupdate(&v);
        }
        inode::iput(victim);
        Ok(())
    })();
    log::end_op();
    result
}

fn restore_tree(dev: u32, snap_dir: &Arc<Inode>, dst_dir: &Arc<Inode>) -> KernelResult<()> {
    let entries = {
        let inner = snap_dir.lock();
        direntries(&inner)
    };
    for de in entries {
        let name = de.name_string();
        if name == "." || name == ".." {
            continue;
        }
        let child = inode::iget(dev, de.inum as u32);
        let typ = child.lock().typ;
        let result = match typ {
            InodeType::Dev | InodeType::Free => Ok(()),
            InodeType::Dir => (|| {
                let existing = {
                    let d = dst_dir.lock();
                    dir::dirlookup(&d, &name)
                };
                let target = match existing {
                    Some((inum, _)) => {
                        let t = inode::iget(dev, inum);
                        if t.lock().typ == InodeType::Dir {
                            t
                        } else {
                            // A file shadows the directory name: replace it.
                            inode::iput(t);
                            unlink_existing(dev, dst_dir, &name)?;
                            create_dir_under(dev, dst_dir, &name)?
                        }
                    }
                    None => create_dir_under(dev, dst_dir, &name)?,
                };
                let res = restore_tree(dev, &child, &target);
                inode::iput(target);
                res
            })(),
            InodeType::File => (|| {
                let exists = {
                    let d = dst_dir.lock();
                    dir::dirlookup(&d, &name).is_some()
                };
                if exists {
                    unlink_existing(dev, dst_dir, &name)?;
                }
                irestore(dev, &child, dst_dir, &name)
            })(),
        };
        inode::iput(child);
        result?;
    }
    Ok(())
}

/// Allocate an empty directory `name` under a parent (rollback helper).
fn create_dir_under(dev: u32, parent: &Arc<Inode>, name: &str) -> KernelResult<Arc<Inode>> {
    log::begin_op();
    let result = (|| -> KernelResult<Arc<Inode>> {
        let sub = inode::ialloc(dev, InodeType::Dir)?;
        {
            let mut s = sub.lock();
            s.nlink = 1;
            inode::iupdate(&s);
            dir::dirlink(&mut s, ".", sub.inum)?;
            dir::dirlink(&mut s, "..", parent.inum)?;
        }
        {
            let mut p = parent.lock();
            p.nlink += 1;
            inode::iupdate(&p);
            dir::dirlink(&mut p, name, sub.inum)?;
        }
        Ok(sub)
    })();
    log::end_op();
    result
}

/// Roll the live tree back to snapshot `id`.
///
/// Directories are found-or-created, files are replaced by fresh inodes
/// sharing the snapshot's blocks. Inode numbers are not preserved.
pub fn snapshot_rollback(dev: u32, id: u32) -> KernelResult<()> {
    let snap_dir =
        dir::namei(&snapshot_path(id)).map_err(|_| KernelError::SnapshotNotFound { id })?;
    let root = match dir::namei("/") {
        Ok(r) => r,
        Err(err) => {
            inode::iput(snap_dir);
            return Err(err);
        }
    };
    let req = icount(dev, &snap_dir, false) - icount(dev, &root, true);
    let admitted = admit(dev, req, 0);
    let result = match admitted {
        Ok(()) => restore_tree(dev, &snap_dir, &root),
        Err(err) => Err(err),
    };
    inode::iput(root);
    inode::iput(snap_dir);
    result?;
    persist(dev);
    info!("snapshot {} rolled back", id);
    Ok(())
}

/// Gather every block referenced by file inodes below `dirip`.
fn collect_tree_blocks(dev: u32, dirip: &Arc<Inode>, skip_at_root: Option<&str>, out: &mut BTreeSet<u32>) {
    let entries = {
        let inner = dirip.lock();
        direntries(&inner)
    };
    for de in entries {
        let name = de.name_string();
        if name == "." || name == ".." {
            continue;
        }
        if let Some(skip) = skip_at_root {
            if name == skip {
                continue;
            }
        }
        let child = inode::iget(dev, de.inum as u32);
        let typ = child.lock().typ;
        match typ {
            InodeType::File => {
                let inner = child.lock();
                for b in blocks_of(&inner) {
                    out.insert(b);
                }
            }
            InodeType::Dir => collect_tree_blocks(dev, &child, None, out),
            InodeType::Dev | InodeType::Free => {}
        }
        inode::iput(child);
    }
}

/// Blocks still referenced by snapshots other than `id`, and by the
/// live tree.
fn reference_sets(dev: u32, id: u32) -> (BTreeSet<u32>, BTreeSet<u32>) {
    let mut snap_refs = BTreeSet::new();
    if let Ok(snaproot) = dir::namei(&format!("/{}", SNAPDIR)) {
        let entries = {
            let inner = snaproot.lock();
            direntries(&inner)
        };
        let keep_out = format!("{:08x}", id);
        for de in entries {
            let name = de.name_string();
            if name == "." || name == ".." || name == SMAP_FILE || name == keep_out {
                continue;
            }
            let child = inode::iget(dev, de.inum as u32);
            if child.lock().typ == InodeType::Dir {
                collect_tree_blocks(dev, &child, None, &mut snap_refs);
            }
            inode::iput(child);
        }
        inode::iput(snaproot);
    }
    let mut live_refs = BTreeSet::new();
    if let Ok(root) = dir::namei("/") {
        collect_tree_blocks(dev, &root, Some(SNAPDIR), &mut live_refs);
        inode::iput(root);
    }
    (snap_refs, live_refs)
}

/// Release one mirror file inode: free the blocks only this snapshot
/// referenced, un-mark the ones the live tree still owns, leave the
/// ones other snapshots share, then drop the inode without letting
/// `itrunc` touch the (shared) addresses again.
fn delete_file(
    dev: u32,
    dirip: &Arc<Inode>,
    child: &Arc<Inode>,
    name: &str,
    snap_refs: &BTreeSet<u32>,
    live_refs: &BTreeSet<u32>,
) -> KernelResult<()> {
    log::begin_op();
    let result = (|| -> KernelResult<()> {
        {
            let mut inner = child.lock();
            for b in blocks_of(&inner) {
                if snap_refs.contains(&b) {
                    continue;
                }
                clear_shared(b);
                if !live_refs.contains(&b) {
                    bfree(dev, b);
                }
            }
            inner.addrs = [0; NDIRECT + 1];
            inner.size = 0;
            inner.nlink -= 1;
            inode::iupdate(&inner);
        }
        {
            let mut d = dirip.lock();
            dir::dirunlink(&mut d, name)?;
        }
        Ok(())
    })();
    log::end_op();
    result
}

fn delete_tree(
    dev: u32,
    dirip: &Arc<Inode>,
    snap_refs: &BTreeSet<u32>,
    live_refs: &BTreeSet<u32>,
) -> KernelResult<()> {
    let entries = {
        let inner = dirip.lock();
        direntries(&inner)
    };
    for de in entries {
        let name = de.name_string();
        if name == "." || name == ".." {
            continue;
        }
        let child = inode::iget(dev, de.inum as u32);
        let typ = child.lock().typ;
        let result = match typ {
            InodeType::File => {
                let r = delete_file(dev, dirip, &child, &name, snap_refs, live_refs);
                inode::iput(child);
                r
            }
            InodeType::Dir => {
                let r = delete_tree(dev, &child, snap_refs, live_refs).and_then(|()| {
                    log::begin_op();
                    let res = (|| -> KernelResult<()> {
                        {
                            let mut d = dirip.lock();
                            dir::dirunlink(&mut d, &name)?;
                            d.nlink -= 1;
                            inode::iupdate(&d);
                        }
                        {
                            let mut c = child.lock();
                            c.nlink -= 1;
                            inode::iupdate(&c);
                        }
                        Ok(())
                    })();
                    log::end_op();
                    res
                });
                inode::iput(child);
                r
            }
            InodeType::Dev | InodeType::Free => {
                inode::iput(child);
                Ok(())
            }
        };
        result?;
    }
    Ok(())
}

/// Delete snapshot `id`, releasing every inode and every block no other
/// snapshot or live file still needs.
pub fn snapshot_delete(dev: u32, id: u32) -> KernelResult<()> {
    let snap_dir =
        dir::namei(&snapshot_path(id)).map_err(|_| KernelError::SnapshotNotFound { id })?;
    let (snap_refs, live_refs) = reference_sets(dev, id);
    let result = delete_tree(dev, &snap_dir, &snap_refs, &live_refs);
    inode::iput(snap_dir);
    result?;
    dir::unlink(&snapshot_path(id))?;
    persist(dev);
    info!("snapshot {} deleted", id);
    Ok(())
}
