//! Directories and path resolution.
//!
//! 16-byte directory entries, `dirlookup`/`dirlink`, and the `namei`
//! path walk. Creation helpers return *unlocked* inodes; callers lock
//! explicitly.

use alloc::string::String;
use alloc::sync::Arc;

use super::inode::{self, Inode, InodeInner, InodeType};
use super::log;
use crate::error::{FsError, KernelError, KernelResult};
use crate::param::{BSIZE, DIRSIZ, ROOTDEV, ROOTINO};

/// Size of one directory entry on disk.
pub const DIRENT_SIZE: usize = 16;

/// One directory entry: inode number and a NUL-padded name.
#[derive(Debug, Clone, Copy)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl Dirent {
    pub fn new(inum: u32, name: &str) -> Dirent {
        let mut bytes = [0u8; DIRSIZ];
        for (dst, src) in bytes.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        Dirent {
            inum: inum as u16,
            name: bytes,
        }
    }

    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        out[0..2].copy_from_slice(&self.inum.to_le_bytes());
        out[2..2 + DIRSIZ].copy_from_slice(&self.name);
        out
    }

    pub fn decode(bytes: &[u8]) -> Dirent {
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&bytes[2..2 + DIRSIZ]);
        Dirent {
            inum: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            name,
        }
    }

    /// Serialize directly into slot `slot` of a raw directory block
    /// (mkfs builds the root directory this way).
    pub fn encode_into(&self, block: &mut [u8; BSIZE], slot: usize) {
        let bytes = self.encode();
        block[slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE].copy_from_slice(&bytes);
    }

    pub fn name_matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        if bytes.len() > DIRSIZ {
            return false;
        }
        let mut padded = [0u8; DIRSIZ];
        padded[..bytes.len()].copy_from_slice(bytes);
        padded == self.name
    }

    pub fn name_string(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// Find `name` in a locked directory: `(inum, byte offset)`.
pub fn dirlookup(dp: &InodeInner, name: &str) -> Option<(u32, u32)> {
    assert_eq!(dp.typ, InodeType::Dir, "dirlookup: not a directory");
    let mut off = 0u32;
    let mut entry = [0u8; DIRENT_SIZE];
    while off < dp.size {
        assert_eq!(inode::readi(dp, &mut entry, off), DIRENT_SIZE);
        let de = Dirent::decode(&entry);
        if de.inum != 0 && de.name_matches(name) {
            return Some((de.inum as u32, off));
        }
        off += DIRENT_SIZE as u32;
    }
    None
}

/// Every live entry of a locked directory.
pub fn direntries(dp: &InodeInner) -> alloc::vec::Vec<Dirent> {
    let mut out = alloc::vec::Vec::new();
    let mut off = 0u32;
    let mut entry = [0u8; DIRENT_SIZE];
    while off < dp.size {
        assert_eq!(inode::readi(dp, &mut entry, off), DIRENT_SIZE);
        let de = Dirent::decode(&entry);
        if de.inum != 0 {
            out.push(de);
        }
        off += DIRENT_SIZE as u32;
    }
    out
}

/// Link `name -> inum` into a locked directory, reusing a free slot or
/// appending. Must run inside a transaction.
pub fn dirlink(dp: &mut InodeInner, name: &str, inum: u32) -> KernelResult<()> {
    if name.len() > DIRSIZ {
        return Err(KernelError::FsError(FsError::NameTooLong));
    }
    if dirlookup(dp, name).is_some() {
        return Err(KernelError::FsError(FsError::AlreadyExists));
    }
    let mut off = 0u32;
    let mut entry = [0u8; DIRENT_SIZE];
    while off < dp.size {
        assert_eq!(inode::readi(dp, &mut entry, off), DIRENT_SIZE);
        if Dirent::decode(&entry).inum == 0 {
            break;
        }
        off += DIRENT_SIZE as u32;
    }
    let de = Dirent::new(inum, name);
    inode::writei(dp, &de.encode(), off)?;
    Ok(())
}

/// Erase the entry for `name` from a locked directory, returning the
/// inum it pointed at. Must run inside a transaction.
pub fn dirunlink(dp: &mut InodeInner, name: &str) -> KernelResult<u32> {
    let (inum, off) = dirlookup(dp, name).ok_or(KernelError::FsError(FsError::NotFound))?;
    inode::writei(dp, &[0u8; DIRENT_SIZE], off)?;
    Ok(inum)
}

/// Whether a locked directory holds only `.` and `..`.
pub fn dir_is_empty(dp: &InodeInner) -> bool {
    direntries(dp)
        .iter()
        .all(|de| de.name_matches(".") || de.name_matches(".."))
}

/// Split the leading element off a path: `"a/b/c"` → `("a", "b/c")`.
fn skipelem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    match path.find('/') {
        Some(idx) => Some((&path[..idx], &path[idx..])),
        None => Some((path, "")),
    }
}

/// Resolve a path to its inode (unlocked).
pub fn namei(path: &str) -> KernelResult<Arc<Inode>> {
    let mut ip = inode::iget(ROOTDEV, ROOTINO);
    let mut rest = path;
    while let Some((elem, tail)) = skipelem(rest) {
        let next = {
            let inner = ip.lock();
            if inner.typ != InodeType::Dir {
                drop(inner);
                inode::iput(ip);
                return Err(KernelError::FsError(FsError::NotADirectory));
            }
            dirlookup(&inner, elem)
        };
        match next {
            Some((inum, _)) => {
                inode::iput(ip);
                ip = inode::iget(ROOTDEV, inum);
            }
            None => {
                inode::iput(ip);
                return Err(KernelError::FsError(FsError::NotFound));
            }
        }
        rest = tail;
    }
    Ok(ip)
}

/// Resolve a path to its parent directory (unlocked) plus the final
/// name.
pub fn nameiparent(path: &str) -> KernelResult<(Arc<Inode>, String)> {
    let trimmed = path.trim_end_matches('/');
    let split = trimmed.rfind('/').map(|i| (&trimmed[..i], &trimmed[i + 1..]));
    let (dir_part, name) = match split {
        Some((d, n)) if !n.is_empty() => (d, n),
        _ => (
            "",
            trimmed.trim_start_matches('/'),
        ),
    };
    if name.is_empty() {
        return Err(KernelError::FsError(FsError::InvalidPath));
    }
    let parent = namei(dir_part)?;
    Ok((parent, String::from(name)))
}

/// Create `path` as `typ`, or return the existing inode when one of the
/// same type is already there. The result is unlocked.
pub fn create(path: &str, typ: InodeType, major: i16, minor: i16) -> KernelResult<Arc<Inode>> {
    log::begin_op();
    let result = create_locked(path, typ, major, minor);
    log::end_op();
    result
}

fn create_locked(path: &str, typ: InodeType, major: i16, minor: i16) -> KernelResult<Arc<Inode>> {
    let (parent, name) = nameiparent(path)?;
    let mut pinner = parent.lock();
    if let Some((inum, _)) = dirlookup(&pinner, &name) {
        drop(pinner);
        inode::iput(parent);
        let existing = inode::iget(ROOTDEV, inum);
        let matches = existing.lock().typ == typ;
        if matches {
            return Ok(existing);
        }
        inode::iput(existing);
        return Err(KernelError::FsError(FsError::AlreadyExists));
    }

    let child = match inode::ialloc(ROOTDEV, typ) {
        Ok(child) => child,
        Err(err) => {
            drop(pinner);
            inode::iput(parent);
            return Err(err);
        }
    };
    {
        let mut cinner = child.lock();
        cinner.major = major;
        cinner.minor = minor;
        cinner.nlink = 1;
        inode::iupdate(&cinner);
        if typ == InodeType::Dir {
            // `..` inside the child references the parent.
            pinner.nlink += 1;
            inode::iupdate(&pinner);
            dirlink(&mut cinner, ".", child.inum)?;
            dirlink(&mut cinner, "..", parent.inum)?;
        }
        dirlink(&mut pinner, &name, child.inum)?;
    }
    drop(pinner);
    inode::iput(parent);
    Ok(child)
}

/// Remove the link at `path`; directories must be empty.
pub fn unlink(path: &str) -> KernelResult<()> {
    log::begin_op();
    let result = unlink_locked(path);
    log::end_op();
    result
}

fn unlink_locked(path: &str) -> KernelResult<()> {
    let (parent, name) = nameiparent(path)?;
    if name == "." || name == ".." {
        inode::iput(parent);
        return Err(KernelError::FsError(FsError::InvalidPath));
    }
    let mut pinner = parent.lock();
    let Some((inum, _)) = dirlookup(&pinner, &name) else {
        drop(pinner);
        inode::iput(parent);
        return Err(KernelError::FsError(FsError::NotFound));
    };
    let child = inode::iget(ROOTDEV, inum);
    {
        let mut cinner = child.lock();
        if cinner.typ == InodeType::Dir && !dir_is_empty(&cinner) {
            drop(cinner);
            drop(pinner);
            inode::iput(child);
            inode::iput(parent);
            return Err(KernelError::FsError(FsError::DirectoryNotEmpty));
        }
        dirunlink(&mut pinner, &name)?;
        if cinner.typ == InodeType::Dir {
            pinner.nlink -= 1;
            inode::iupdate(&pinner);
        }
        cinner.nlink -= 1;
        inode::iupdate(&cinner);
    }
    drop(pinner);
    inode::iput(child);
    inode::iput(parent);
    Ok(())
}
