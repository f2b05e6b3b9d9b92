//! Write-ahead log.
//!
//! Every durable filesystem mutation happens between `begin_op` and
//! `end_op`; dirtied blocks are announced with `log_write`. Operations
//! nest — inner helpers open their own scope and the commit happens when
//! the outermost scope closes, so a whole snapshot step or COW write
//! lands on disk atomically. Recovery at mount replays a committed but
//! uninstalled transaction.

use alloc::vec::Vec;

use ::log::{debug, info};
use lazy_static::lazy_static;
use spin::Mutex;

use super::blockdev::{self, BlockDevice};
use super::buffer;
use crate::param::BSIZE;

/// Blocks at the head of the log area reserved for the header.
const HEADER_BLOCKS: usize = 4;

struct Log {
    dev: u32,
    start: u32,
    size: u32,
    depth: u32,
    absorbed: Vec<u32>,
}

impl Log {
    const fn capacity(&self) -> usize {
        self.size as usize - HEADER_BLOCKS
    }
}

lazy_static! {
    static ref LOG: Mutex<Log> = Mutex::new(Log {
        dev: 0,
        start: 0,
        size: 0,
        depth: 0,
        absorbed: Vec::new(),
    });
}

fn read_header(dev: u32, start: u32) -> Vec<u32> {
    let _ = dev;
    let mut bytes = [0u8; HEADER_BLOCKS * BSIZE];
    for i in 0..HEADER_BLOCKS {
        let mut block = [0u8; BSIZE];
        blockdev::disk().read_block(start + i as u32, &mut block);
        bytes[i * BSIZE..(i + 1) * BSIZE].copy_from_slice(&block);
    }
    let n = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut entries = Vec::with_capacity(n);
    for i in 0..n {
        let off = 4 + i * 4;
        entries.push(u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()));
    }
    entries
}

fn write_header(dev: u32, start: u32, entries: &[u32]) {
    let _ = dev;
    let mut bytes = [0u8; HEADER_BLOCKS * BSIZE];
    bytes[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, bno) in entries.iter().enumerate() {
        let off = 4 + i * 4;
        bytes[off..off + 4].copy_from_slice(&bno.to_le_bytes());
    }
    for i in 0..HEADER_BLOCKS {
        let mut block = [0u8; BSIZE];
        block.copy_from_slice(&bytes[i * BSIZE..(i + 1) * BSIZE]);
        blockdev::disk().write_block(start + i as u32, &block);
    }
}

/// Replay a committed transaction left in the log, then clear it.
fn recover(dev: u32, start: u32) {
    let entries = read_header(dev, start);
    if !entries.is_empty() {
        info!("log: recovering {} blocks", entries.len());
        for (i, bno) in entries.iter().enumerate() {
            let mut data = [0u8; BSIZE];
            blockdev::disk().read_block(start + (HEADER_BLOCKS + i) as u32, &mut data);
            blockdev::disk().write_block(*bno, &data);
        }
        write_header(dev, start, &[]);
    }
}

/// Set up the log over its on-disk area and run recovery.
pub fn loginit(dev: u32, start: u32, size: u32) {
    assert!(size as usize > HEADER_BLOCKS, "log area too small");
    let mut log = LOG.lock();
    log.dev = dev;
    log.start = start;
    log.size = size;
    log.depth = 0;
    log.absorbed.clear();
    drop(log);
    recover(dev, start);
    debug!("log: {} blocks at {}", size, start);
}

/// Open a transaction scope. Scopes nest; only the outermost commits.
pub fn begin_op() {
    LOG.lock().depth += 1;
}

/// Record that a cached block belongs to the current transaction.
pub fn log_write(dev: u32, blockno: u32) {
    let mut log = LOG.lock();
    assert!(log.depth > 0, "log_write outside a transaction");
    assert_eq!(dev, log.dev, "log_write: wrong device");
    if !log.absorbed.contains(&blockno) {
        assert!(
            log.absorbed.len() < log.capacity(),
            "log overflow: transaction touches too many blocks"
        );
        log.absorbed.push(blockno);
    }
}

/// Close a transaction scope; the outermost close commits.
pub fn end_op() {
    let mut guard = LOG.lock();
    assert!(guard.depth > 0, "end_op without begin_op");
    guard.depth -= 1;
    if guard.depth > 0 || guard.absorbed.is_empty() {
        return;
    }
    let log = &mut *guard;
    // Copy dirtied blocks into the log area, then the header: once the
    // header lands, the transaction is durable.
    for (i, bno) in log.absorbed.iter().enumerate() {
        let handle = buffer::bread(log.dev, *bno);
        let buf = handle.lock();
        blockdev::disk().write_block(log.start + (HEADER_BLOCKS + i) as u32, &buf.data);
    }
    write_header(log.dev, log.start, &log.absorbed);
    // Install home, then clear the header.
    for bno in log.absorbed.iter() {
        let handle = buffer::bread(log.dev, *bno);
        let buf = handle.lock();
        buffer::bwrite(&buf);
    }
    write_header(log.dev, log.start, &[]);
    log.absorbed.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::FSSIZE;
    use crate::testing::kernel_test;

    // Scratch log area and target blocks deep in the data region, away
    // from anything the freshly formatted filesystem cares about.
    const LSTART: u32 = FSSIZE as u32 - 64;
    const TARGET: u32 = FSSIZE as u32 - 80;

    fn point_log_at_scratch_area() {
        buffer::binit();
        loginit(1, LSTART, 64);
    }

    #[test]
    fn commit_installs_at_outermost_end() {
        kernel_test(|| {
            point_log_at_scratch_area();
            begin_op();
            {
                let handle = buffer::bread(1, TARGET);
                handle.lock().data[0] = 7;
                log_write(1, TARGET);
            }
            begin_op();
            {
                let handle = buffer::bread(1, TARGET + 1);
                handle.lock().data[0] = 9;
                log_write(1, TARGET + 1);
            }
            end_op(); // inner: must not commit yet
            let mut raw = [0u8; BSIZE];
            blockdev::disk().read_block(TARGET, &mut raw);
            assert_eq!(raw[0], 0, "no install before outermost end_op");
            end_op();
            blockdev::disk().read_block(TARGET, &mut raw);
            assert_eq!(raw[0], 7);
            blockdev::disk().read_block(TARGET + 1, &mut raw);
            assert_eq!(raw[0], 9);
        });
    }

    #[test]
    fn absorption_dedupes_blocks() {
        kernel_test(|| {
            point_log_at_scratch_area();
            begin_op();
            let handle = buffer::bread(1, TARGET + 2);
            handle.lock().data[1] = 1;
            log_write(1, TARGET + 2);
            handle.lock().data[2] = 2;
            log_write(1, TARGET + 2);
            assert_eq!(LOG.lock().absorbed.len(), 1);
            end_op();
            let mut raw = [0u8; BSIZE];
            blockdev::disk().read_block(TARGET + 2, &mut raw);
            assert_eq!((raw[1], raw[2]), (1, 2));
        });
    }

    #[test]
    fn recovery_replays_committed_header() {
        kernel_test(|| {
            point_log_at_scratch_area();
            // Hand-craft a committed-but-not-installed transaction: the
            // target block's new contents sit in the log with a
            // nonempty header.
            let mut payload = [0u8; BSIZE];
            payload[0] = 0x5A;
            blockdev::disk().write_block(LSTART + HEADER_BLOCKS as u32, &payload);
            write_header(1, LSTART, &[TARGET + 3]);
            recover(1, LSTART);
            let mut raw = [0u8; BSIZE];
            blockdev::disk().read_block(TARGET + 3, &mut raw);
            assert_eq!(raw[0], 0x5A);
            assert!(read_header(1, LSTART).is_empty(), "header cleared");
        });
    }
}
