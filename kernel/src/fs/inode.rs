//! Inodes.
//!
//! On-disk inodes are 64 bytes: type, device numbers, link count, size,
//! twelve direct block addresses and one singly-indirect block. The
//! in-core cache hands out `Arc<Inode>` keyed by `(dev, inum)`; locking
//! an inode demand-loads it from disk.
//!
//! `writei` carries the copy-on-write write path: before any byte moves,
//! every touched block position is checked against the snapshot bitmap,
//! and shared blocks are either cloned individually (direct) or migrated
//! wholesale with their indirect table (indirect).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use ::log::debug;
use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

use super::{balloc, bfree, buffer, log, sb, snapshot, IPB};
use crate::error::{FsError, KernelError, KernelResult};
use crate::param::{BSIZE, MAXFILE, NDIRECT, NINDIRECT, NINODES};

/// Size of one on-disk inode.
pub const DINODE_SIZE: usize = 64;

/// On-disk inode type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum InodeType {
    Free = 0,
    Dir = 1,
    File = 2,
    Dev = 3,
}

impl InodeType {
    fn from_i16(raw: i16) -> InodeType {
        match raw {
            1 => InodeType::Dir,
            2 => InodeType::File,
            3 => InodeType::Dev,
            _ => InodeType::Free,
        }
    }
}

/// On-disk inode layout.
#[derive(Debug, Clone, Copy)]
pub struct DiskInode {
    pub typ: InodeType,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

impl DiskInode {
    pub fn empty() -> DiskInode {
        DiskInode {
            typ: InodeType::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    /// Serialize into slot `idx` of an inode block.
    pub fn encode_into(&self, block: &mut [u8; BSIZE], idx: usize) {
        let base = idx * DINODE_SIZE;
        block[base..base + 2].copy_from_slice(&(self.typ as i16).to_le_bytes());
        block[base + 2..base + 4].copy_from_slice(&self.major.to_le_bytes());
        block[base + 4..base + 6].copy_from_slice(&self.minor.to_le_bytes());
        block[base + 6..base + 8].copy_from_slice(&self.nlink.to_le_bytes());
        block[base + 8..base + 12].copy_from_slice(&self.size.to_le_bytes());
        for (i, addr) in self.addrs.iter().enumerate() {
            let off = base + 12 + i * 4;
            block[off..off + 4].copy_from_slice(&addr.to_le_bytes());
        }
    }

    /// Deserialize slot `idx` of an inode block.
    pub fn decode(block: &[u8; BSIZE], idx: usize) -> DiskInode {
        let base = idx * DINODE_SIZE;
        let i16_at = |o: usize| i16::from_le_bytes(block[base + o..base + o + 2].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(block[base + o..base + o + 4].try_into().unwrap());
        let mut addrs = [0u32; NDIRECT + 1];
        for (i, addr) in addrs.iter_mut().enumerate() {
            *addr = u32_at(12 + i * 4);
        }
        DiskInode {
            typ: InodeType::from_i16(i16_at(0)),
            major: i16_at(2),
            minor: i16_at(4),
            nlink: i16_at(6),
            size: u32_at(8),
            addrs,
        }
    }
}

/// In-core inode body; reachable only through [`Inode::lock`].
#[derive(Debug)]
pub struct InodeInner {
    pub dev: u32,
    pub inum: u32,
    valid: bool,
    pub typ: InodeType,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

/// Cache entry for one `(dev, inum)`.
#[derive(Debug)]
pub struct Inode {
    pub dev: u32,
    pub inum: u32,
    inner: Mutex<InodeInner>,
}

impl Inode {
    /// Lock the inode, reading it from disk on first use.
    pub fn lock(&self) -> MutexGuard<'_, InodeInner> {
        let mut inner = self.inner.lock();
        if !inner.valid {
            let handle = buffer::bread(self.dev, sb().iblock(self.inum));
            let dinode = DiskInode::decode(&handle.lock().data, self.inum as usize % IPB);
            inner.typ = dinode.typ;
            inner.major = dinode.major;
            inner.minor = dinode.minor;
            inner.nlink = dinode.nlink;
            inner.size = dinode.size;
            inner.addrs = dinode.addrs;
            inner.valid = true;
            assert!(
                inner.typ != InodeType::Free,
                "ilock: inode {} has no type",
                self.inum
            );
        }
        inner
    }
}

lazy_static! {
    static ref ICACHE: Mutex<BTreeMap<(u32, u32), Arc<Inode>>> = Mutex::new(BTreeMap::new());
}

/// Reset the inode cache (mount).
pub fn iinit() {
    ICACHE.lock().clear();
}

/// In-memory referenced-inode count (snapshot admission input).
pub fn cached_count() -> usize {
    ICACHE.lock().len()
}

/// Get the in-core inode for `(dev, inum)` without reading it.
pub fn iget(dev: u32, inum: u32) -> Arc<Inode> {
    let mut cache = ICACHE.lock();
    cache
        .entry((dev, inum))
        .or_insert_with(|| {
            Arc::new(Inode {
                dev,
                inum,
                inner: Mutex::new(InodeInner {
                    dev,
                    inum,
                    valid: false,
                    typ: InodeType::Free,
                    major: 0,
                    minor: 0,
                    nlink: 0,
                    size: 0,
                    addrs: [0; NDIRECT + 1],
                }),
            })
        })
        .clone()
}

/// Allocate a fresh on-disk inode of the given type. Returns it
/// unlocked; callers lock explicitly. Must run inside a transaction.
pub fn ialloc(dev: u32, typ: InodeType) -> KernelResult<Arc<Inode>> {
    let sb = sb();
    for inum in 1..NINODES as u32 {
        let bno = sb.iblock(inum);
        let handle = buffer::bread(dev, bno);
        let slot = inum as usize % IPB;
        let free = {
            let buf = handle.lock();
            DiskInode::decode(&buf.data, slot).typ == InodeType::Free
        };
        if free {
            let mut dinode = DiskInode::empty();
            dinode.typ = typ;
            {
                let mut buf = handle.lock();
                dinode.encode_into(&mut buf.data, slot);
            }
            log::log_write(dev, bno);
            debug!("ialloc: inum {} ({:?})", inum, typ);
            return Ok(iget(dev, inum));
        }
    }
    Err(KernelError::FsError(FsError::NoInodes))
}

/// Count of allocated on-disk inodes (`s_isize` in the admission math).
pub fn allocated_count(dev: u32) -> usize {
    let sb = sb();
    let mut used = 0;
    for inum in 1..NINODES as u32 {
        let handle = buffer::bread(dev, sb.iblock(inum));
        let buf = handle.lock();
        if DiskInode::decode(&buf.data, inum as usize % IPB).typ != InodeType::Free {
            used += 1;
        }
    }
    used
}

/// Write a locked inode's fields back to its disk slot. Must run inside
/// a transaction.
pub fn iupdate(inner: &InodeInner) {
    let bno = sb().iblock(inner.inum);
    let handle = buffer::bread(inner.dev, bno);
    {
        let mut buf = handle.lock();
        let dinode = DiskInode {
            typ: inner.typ,
            major: inner.major,
            minor: inner.minor,
            nlink: inner.nlink,
            size: inner.size,
            addrs: inner.addrs,
        };
        dinode.encode_into(&mut buf.data, inner.inum as usize % IPB);
    }
    log::log_write(inner.dev, bno);
}

/// Release a reference to an inode.
///
/// When the last reference goes and the link count is zero, the inode's
/// content is freed and its on-disk slot released. Runs its own
/// transaction scope so callers may invoke it bare.
pub fn iput(ip: Arc<Inode>) {
    {
        let mut cache = ICACHE.lock();
        // Two strong refs: the cache's and the caller's.
        if Arc::strong_count(&ip) != 2 {
            return;
        }
        cache.remove(&(ip.dev, ip.inum));
    }
    let free_content = {
        let inner = ip.inner.lock();
        inner.valid && inner.nlink == 0
    };
    if free_content {
        log::begin_op();
        let mut inner = ip.inner.lock();
        itrunc(&mut inner);
        inner.typ = InodeType::Free;
        iupdate(&inner);
        inner.valid = false;
        drop(inner);
        log::end_op();
    }
}

/// Free every data block of an inode and zero its size. Must run inside
/// a transaction; blocks a snapshot still references are left alone by
/// `bfree`.
pub fn itrunc(inner: &mut InodeInner) {
    for addr in inner.addrs.iter_mut().take(NDIRECT) {
        if *addr != 0 {
            bfree(inner.dev, *addr);
            *addr = 0;
        }
    }
    let ind = inner.addrs[NDIRECT];
    if ind != 0 {
        let handle = buffer::bread(inner.dev, ind);
        let table = read_indirect(&handle.lock().data);
        for addr in table.iter().filter(|a| **a != 0) {
            bfree(inner.dev, *addr);
        }
        bfree(inner.dev, ind);
        inner.addrs[NDIRECT] = 0;
    }
    inner.size = 0;
    iupdate(inner);
}

fn read_indirect(data: &[u8; BSIZE]) -> [u32; NINDIRECT] {
    let mut table = [0u32; NINDIRECT];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
    }
    table
}

fn write_indirect(data: &mut [u8; BSIZE], table: &[u32; NINDIRECT]) {
    for (i, slot) in table.iter().enumerate() {
        data[i * 4..i * 4 + 4].copy_from_slice(&slot.to_le_bytes());
    }
}

/// Resolve block position `bn`, allocating as needed. Must run inside a
/// transaction.
pub fn bmap(inner: &mut InodeInner, bn: usize) -> u32 {
    assert!(bn < MAXFILE, "bmap: block position {} out of range", bn);
    if bn < NDIRECT {
        if inner.addrs[bn] == 0 {
            inner.addrs[bn] = balloc(inner.dev);
        }
        return inner.addrs[bn];
    }
    let bn = bn - NDIRECT;
    if inner.addrs[NDIRECT] == 0 {
        inner.addrs[NDIRECT] = balloc(inner.dev);
    }
    let ind = inner.addrs[NDIRECT];
    let handle = buffer::bread(inner.dev, ind);
    let mut table = read_indirect(&handle.lock().data);
    if table[bn] == 0 {
        table[bn] = balloc(inner.dev);
        write_indirect(&mut handle.lock().data, &table);
        log::log_write(inner.dev, ind);
    }
    table[bn]
}

/// Read-only lookup of block position `bn`: 0 when absent, never
/// allocates.
pub fn bmmap(inner: &InodeInner, bn: usize) -> u32 {
    if bn < NDIRECT {
        return inner.addrs[bn];
    }
    let bn = bn - NDIRECT;
    if bn >= NINDIRECT || inner.addrs[NDIRECT] == 0 {
        return 0;
    }
    let handle = buffer::bread(inner.dev, inner.addrs[NDIRECT]);
    let table = read_indirect(&handle.lock().data);
    table[bn]
}

/// Read up to `dst.len()` bytes at `off`. Returns bytes read.
pub fn readi(inner: &InodeInner, dst: &mut [u8], off: u32) -> usize {
    if off >= inner.size {
        return 0;
    }
    let n = dst.len().min((inner.size - off) as usize);
    let mut done = 0;
    while done < n {
        let pos = off as usize + done;
        let addr = bmmap(inner, pos / BSIZE);
        let in_block = BSIZE - pos % BSIZE;
        let chunk = in_block.min(n - done);
        if addr == 0 {
            // Hole: reads as zeroes.
            dst[done..done + chunk].fill(0);
        } else {
            let handle = buffer::bread(inner.dev, addr);
            let buf = handle.lock();
            dst[done..done + chunk].copy_from_slice(&buf.data[pos % BSIZE..pos % BSIZE + chunk]);
        }
        done += chunk;
    }
    n
}

/// Copy-on-write scan preceding a file write: clone shared direct
/// blocks, note whether the indirect subtree must migrate.
fn cow_scan(inner: &mut InodeInner, off: u32, len: usize) -> (bool, bool) {
    let mut cowed = false;
    let mut migrate = false;
    let first_bn = off as usize / BSIZE;
    let last_bn = (off as usize + len - 1) / BSIZE;
    for bn in first_bn..=last_bn {
        let addr = bmmap(inner, bn);
        if addr == 0 || !snapshot::block_shared(addr) {
            continue;
        }
        snapshot::clear_shared(addr);
        cowed = true;
        if bn >= NDIRECT {
            migrate = true;
            continue;
        }
        // Per-block clone: detach the shared block and copy it into a
        // freshly allocated one.
        let old = {
            let handle = buffer::bread(inner.dev, addr);
            let data = handle.lock().data;
            data
        };
        inner.addrs[bn] = 0;
        let fresh = bmap(inner, bn);
        {
            let handle = buffer::bread(inner.dev, fresh);
            handle.lock().data = old;
        }
        log::log_write(inner.dev, fresh);
        debug!("cow: inum {} bn {} block {} -> {}", inner.inum, bn, addr, fresh);
    }
    (cowed, migrate)
}

/// Migrate the whole indirect subtree away from snapshot-shared blocks:
/// every non-zero referenced data block is copied into a fresh block and
/// a fresh indirect table replaces `addrs[NDIRECT]`. The old blocks stay
/// behind for the snapshots that reference them.
fn migrate_indirect(inner: &mut InodeInner) {
    let old_ind = inner.addrs[NDIRECT];
    assert!(old_ind != 0, "indirect migration without an indirect block");
    let mut table = {
        let handle = buffer::bread(inner.dev, old_ind);
        let table = read_indirect(&handle.lock().data);
        table
    };
    for slot in table.iter_mut() {
        if *slot == 0 {
            continue;
        }
        let fresh = balloc(inner.dev);
        let data = {
            let handle = buffer::bread(inner.dev, *slot);
            let data = handle.lock().data;
            data
        };
        {
            let handle = buffer::bread(inner.dev, fresh);
            handle.lock().data = data;
        }
        log::log_write(inner.dev, fresh);
        *slot = fresh;
    }
    let new_ind = balloc(inner.dev);
    {
        let handle = buffer::bread(inner.dev, new_ind);
        write_indirect(&mut handle.lock().data, &table);
    }
    log::log_write(inner.dev, new_ind);
    inner.addrs[NDIRECT] = new_ind;
    debug!(
        "cow: inum {} migrated indirect {} -> {}",
        inner.inum, old_ind, new_ind
    );
}

/// Write `src` at byte offset `off`, growing the file as needed.
///
/// For regular files, any touched block that a snapshot still references
/// is cloned first (whole-indirect migration for indirect positions),
/// and the snapshot bitmap is persisted afterwards. The scan, the byte
/// write, and the metadata update all share one transaction.
pub fn writei(inner: &mut InodeInner, src: &[u8], off: u32) -> KernelResult<usize> {
    if inner.typ == InodeType::Dev {
        return Err(KernelError::FsError(FsError::NotAFile));
    }
    if off > inner.size {
        return Err(KernelError::InvalidArgument { name: "off" });
    }
    if off as usize + src.len() > MAXFILE * BSIZE {
        return Err(KernelError::FsError(FsError::FileTooLarge));
    }
    if src.is_empty() {
        return Ok(0);
    }

    log::begin_op();

    let mut cowed = false;
    if inner.typ == InodeType::File {
        let (c, migrate) = cow_scan(inner, off, src.len());
        cowed = c;
        if migrate {
            migrate_indirect(inner);
        }
    }

    let mut done = 0;
    while done < src.len() {
        let pos = off as usize + done;
        let addr = bmap(inner, pos / BSIZE);
        let in_block = BSIZE - pos % BSIZE;
        let chunk = in_block.min(src.len() - done);
        {
            let handle = buffer::bread(inner.dev, addr);
            let mut buf = handle.lock();
            buf.data[pos % BSIZE..pos % BSIZE + chunk].copy_from_slice(&src[done..done + chunk]);
        }
        log::log_write(inner.dev, addr);
        done += chunk;
    }

    if off + done as u32 > inner.size {
        inner.size = off + done as u32;
    }
    iupdate(inner);
    if cowed {
        snapshot::persist(inner.dev);
    }
    log::end_op();
    Ok(done)
}
