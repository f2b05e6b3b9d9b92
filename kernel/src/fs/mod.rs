//! On-disk filesystem: superblock, allocation bitmap, mkfs and mount.
//!
//! Layout: `[ boot | superblock | log | inode blocks | bitmap | data ]`.
//! The block allocator lives here; `bfree` consults the snapshot bitmap
//! and refuses to release blocks a snapshot still references.

use ::log::info;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::param::{BSIZE, FSSIZE, LOGSIZE, NINODES};

pub mod blockdev;
pub mod buffer;
pub mod dir;
pub mod inode;
pub mod log;
pub mod snapshot;

use blockdev::BlockDevice;

/// Identifies a formatted UmbraOS disk.
pub const FSMAGIC: u32 = 0x554D_4252;

/// Bits per bitmap block.
pub const BPB: usize = BSIZE * 8;

/// Inodes per inode block (64-byte on-disk inodes).
pub const IPB: usize = BSIZE / inode::DINODE_SIZE;

/// On-disk superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,
    /// Total blocks on the device
    pub size: u32,
    /// Data blocks
    pub nblocks: u32,
    pub ninodes: u32,
    /// Log-area blocks
    pub nlog: u32,
    pub logstart: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
}

impl SuperBlock {
    fn encode(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, word) in [
            self.magic,
            self.size,
            self.nblocks,
            self.ninodes,
            self.nlog,
            self.logstart,
            self.inodestart,
            self.bmapstart,
        ]
        .iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> SuperBlock {
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        SuperBlock {
            magic: word(0),
            size: word(1),
            nblocks: word(2),
            ninodes: word(3),
            nlog: word(4),
            logstart: word(5),
            inodestart: word(6),
            bmapstart: word(7),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == FSMAGIC
    }

    /// Block holding inode `inum`.
    pub fn iblock(&self, inum: u32) -> u32 {
        self.inodestart + inum / IPB as u32
    }

    /// Bitmap block covering data block `b`.
    pub fn bblock(&self, b: u32) -> u32 {
        self.bmapstart + b / BPB as u32
    }
}

lazy_static! {
    static ref SB: Mutex<Option<SuperBlock>> = Mutex::new(None);
}

/// The mounted superblock (panics before mount).
pub fn sb() -> SuperBlock {
    let sb = *SB.lock();
    sb.expect("filesystem not mounted")
}

fn geometry() -> SuperBlock {
    let ninodeblocks = NINODES as u32 / IPB as u32 + 1;
    let nbitmap = FSSIZE as u32 / BPB as u32 + 1;
    let logstart = 2;
    let inodestart = logstart + LOGSIZE as u32;
    let bmapstart = inodestart + ninodeblocks;
    let nmeta = bmapstart + nbitmap;
    SuperBlock {
        magic: FSMAGIC,
        size: FSSIZE as u32,
        nblocks: FSSIZE as u32 - nmeta,
        ninodes: NINODES as u32,
        nlog: LOGSIZE as u32,
        logstart,
        inodestart,
        bmapstart,
    }
}

/// First data block.
fn first_data_block(sb: &SuperBlock) -> u32 {
    sb.size - sb.nblocks
}

/// Format a blank disk: superblock, bitmap with the metadata region
/// pre-allocated, and a root directory holding `.` and `..`.
pub fn mkfs(dev: u32) {
    let _ = dev;
    let sb = geometry();
    let disk = blockdev::disk();

    let mut block = [0u8; BSIZE];
    block[..32].copy_from_slice(&sb.encode());
    disk.write_block(1, &block);

    // Bitmap: metadata blocks plus the root directory's first data block
    // are in use.
    let rootdata = first_data_block(&sb);
    let used = rootdata + 1;
    let mut bno = sb.bmapstart;
    let mut marked = 0u32;
    while marked < used {
        let mut bits = [0u8; BSIZE];
        let in_this = (used - marked).min(BPB as u32);
        for i in 0..in_this {
            bits[(i / 8) as usize] |= 1 << (i % 8);
        }
        disk.write_block(bno, &bits);
        marked += BPB as u32;
        bno += 1;
    }

    // Root directory inode (inum 1; inum 0 stays reserved).
    let mut root = inode::DiskInode::empty();
    root.typ = inode::InodeType::Dir;
    root.nlink = 1;
    root.size = 2 * dir::DIRENT_SIZE as u32;
    root.addrs[0] = rootdata;
    let mut iblk = [0u8; BSIZE];
    disk.read_block(sb.iblock(crate::param::ROOTINO), &mut iblk);
    root.encode_into(&mut iblk, crate::param::ROOTINO as usize % IPB);
    disk.write_block(sb.iblock(crate::param::ROOTINO), &iblk);

    let mut rootdir = [0u8; BSIZE];
    dir::Dirent::new(crate::param::ROOTINO, ".").encode_into(&mut rootdir, 0);
    dir::Dirent::new(crate::param::ROOTINO, "..").encode_into(&mut rootdir, 1);
    disk.write_block(rootdata, &rootdir);

    info!(
        "mkfs: {} blocks ({} data), {} inodes",
        sb.size, sb.nblocks, sb.ninodes
    );
}

/// Mount the disk: read (or create) the superblock, recover the log,
/// reset the inode cache, and load the snapshot metadata.
pub fn mount(dev: u32) {
    buffer::binit();
    let handle = buffer::bread(dev, 1);
    let mut sb = SuperBlock::decode(&handle.lock().data);
    if !sb.is_valid() {
        drop(handle);
        buffer::binit();
        mkfs(dev);
        let handle = buffer::bread(dev, 1);
        sb = SuperBlock::decode(&handle.lock().data);
    }
    assert!(sb.is_valid(), "mkfs produced an invalid superblock");
    *SB.lock() = Some(sb);
    log::loginit(dev, sb.logstart, sb.nlog);
    inode::iinit();
    snapshot::sminit(dev);
}

/// Zero a disk block inside the current transaction.
fn bzero(dev: u32, bno: u32) {
    let handle = buffer::bread(dev, bno);
    handle.lock().data = [0u8; BSIZE];
    log::log_write(dev, bno);
}

/// Allocate a zeroed data block. Panics when the disk is full.
pub fn balloc(dev: u32) -> u32 {
    let sb = sb();
    let mut base = 0u32;
    while base < sb.size {
        let handle = buffer::bread(dev, sb.bblock(base));
        let mut found = None;
        {
            let mut buf = handle.lock();
            for bi in 0..BPB as u32 {
                let b = base + bi;
                if b >= sb.size {
                    break;
                }
                let mask = 1u8 << (bi % 8);
                if buf.data[(bi / 8) as usize] & mask == 0 {
                    buf.data[(bi / 8) as usize] |= mask;
                    found = Some(b);
                    break;
                }
            }
        }
        if let Some(b) = found {
            log::log_write(dev, sb.bblock(base));
            bzero(dev, b);
            return b;
        }
        base += BPB as u32;
    }
    panic!("balloc: out of blocks");
}

/// Release a data block — unless a snapshot still references it, in
/// which case the bitmap is left untouched.
pub fn bfree(dev: u32, b: u32) {
    if snapshot::block_shared(b) {
        return;
    }
    let sb = sb();
    let handle = buffer::bread(dev, sb.bblock(b));
    {
        let mut buf = handle.lock();
        let mask = 1u8 << (b % 8);
        let byte = (b % BPB as u32 / 8) as usize;
        assert!(buf.data[byte] & mask != 0, "bfree: freeing free block {}", b);
        buf.data[byte] &= !mask;
    }
    log::log_write(dev, sb.bblock(b));
}

/// Whether a block is marked allocated in the bitmap (tests and the
/// snapshot reference scan use this).
pub fn block_allocated(dev: u32, b: u32) -> bool {
    let sb = sb();
    let handle = buffer::bread(dev, sb.bblock(b));
    let buf = handle.lock();
    let mask = 1u8 << (b % 8);
    buf.data[(b % BPB as u32 / 8) as usize] & mask != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ROOTDEV;
    use crate::testing::kernel_test;

    #[test]
    fn mount_formats_blank_disk() {
        kernel_test(|| {
            let sb = sb();
            assert!(sb.is_valid());
            assert_eq!(sb.size, FSSIZE as u32);
            assert!(sb.nblocks > 1000, "most of the disk is data");
        });
    }

    #[test]
    fn balloc_bfree_round_trip() {
        kernel_test(|| {
            log::begin_op();
            let b = balloc(ROOTDEV);
            assert!(block_allocated(ROOTDEV, b));
            bfree(ROOTDEV, b);
            assert!(!block_allocated(ROOTDEV, b));
            log::end_op();
        });
    }

    #[test]
    fn balloc_returns_zeroed_blocks() {
        kernel_test(|| {
            log::begin_op();
            let b = balloc(ROOTDEV);
            let handle = buffer::bread(ROOTDEV, b);
            assert_eq!(handle.lock().data, [0u8; BSIZE]);
            bfree(ROOTDEV, b);
            log::end_op();
        });
    }

    #[test]
    fn bfree_skips_snapshot_protected_blocks() {
        kernel_test(|| {
            log::begin_op();
            let b = balloc(ROOTDEV);
            snapshot::set_shared_for_test(b);
            bfree(ROOTDEV, b);
            assert!(
                block_allocated(ROOTDEV, b),
                "protected block must survive bfree"
            );
            snapshot::clear_shared_for_test(b);
            bfree(ROOTDEV, b);
            assert!(!block_allocated(ROOTDEV, b));
            log::end_op();
        });
    }
}
