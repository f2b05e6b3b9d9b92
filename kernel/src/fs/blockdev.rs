//! Block device abstraction and the RAM-backed disk.
//!
//! The filesystem only ever sees [`BlockDevice`]; the simulation backs
//! it with an in-memory disk.

use alloc::vec;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::param::{BSIZE, FSSIZE};

/// A device that moves whole blocks.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]);
    fn write_block(&self, blockno: u32, data: &[u8; BSIZE]);
    fn nblocks(&self) -> u32;
}

/// Memory-resident disk.
pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
}

impl RamDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0u8; BSIZE]; nblocks]),
        }
    }

    /// Zero every block (fresh disk).
    pub fn wipe(&self) {
        let mut blocks = self.blocks.lock();
        for b in blocks.iter_mut() {
            *b = [0u8; BSIZE];
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock();
        *buf = blocks[blockno as usize];
    }

    fn write_block(&self, blockno: u32, data: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock();
        blocks[blockno as usize] = *data;
    }

    fn nblocks(&self) -> u32 {
        self.blocks.lock().len() as u32
    }
}

lazy_static! {
    static ref DISK: RamDisk = RamDisk::new(FSSIZE);
}

/// The root disk. `dev` numbers in the FS layer all resolve here.
pub fn disk() -> &'static RamDisk {
    &DISK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let disk = RamDisk::new(8);
        let mut data = [0u8; BSIZE];
        data[0] = 0xAB;
        data[BSIZE - 1] = 0xCD;
        disk.write_block(5, &data);
        let mut out = [0u8; BSIZE];
        disk.read_block(5, &mut out);
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[BSIZE - 1], 0xCD);
        disk.wipe();
        disk.read_block(5, &mut out);
        assert_eq!(out, [0u8; BSIZE]);
    }
}
