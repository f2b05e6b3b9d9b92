//! Block buffer cache.
//!
//! Shared `Arc<Mutex<Buf>>` handles keyed by `(dev, blockno)`. The cache
//! holds every block it has ever seen — the disk is small and
//! memory-resident, so there is no eviction and nothing to pin during a
//! log commit.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

use super::blockdev::{self, BlockDevice};
use crate::param::BSIZE;

/// One cached block.
pub struct Buf {
    pub dev: u32,
    pub blockno: u32,
    pub valid: bool,
    pub data: [u8; BSIZE],
}

pub type BufHandle = Arc<Mutex<Buf>>;

lazy_static! {
    static ref BCACHE: Mutex<BTreeMap<(u32, u32), BufHandle>> = Mutex::new(BTreeMap::new());
}

/// Drop every cached block (boot / remount).
pub fn binit() {
    BCACHE.lock().clear();
}

/// Get the cache slot for a block without touching the disk.
pub fn bget(dev: u32, blockno: u32) -> BufHandle {
    let mut cache = BCACHE.lock();
    cache
        .entry((dev, blockno))
        .or_insert_with(|| {
            Arc::new(Mutex::new(Buf {
                dev,
                blockno,
                valid: false,
                data: [0u8; BSIZE],
            }))
        })
        .clone()
}

/// Get a block's buffer with its contents loaded.
pub fn bread(dev: u32, blockno: u32) -> BufHandle {
    let handle = bget(dev, blockno);
    {
        let mut buf = handle.lock();
        if !buf.valid {
            blockdev::disk().read_block(blockno, &mut buf.data);
            buf.valid = true;
        }
    }
    handle
}

/// Write a buffer's contents home. Only the log calls this; everything
/// else goes through `log_write`.
pub fn bwrite(buf: &Buf) {
    blockdev::disk().write_block(buf.blockno, &buf.data);
}
