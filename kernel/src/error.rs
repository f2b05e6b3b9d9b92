//! Error types for the UmbraOS kernel
//!
//! Central error enum used across the address-translation and snapshot
//! subsystems. Low-level helpers panic on contract violations; everything
//! above them returns `Result` and lets the syscall layer translate to the
//! numeric codes user programs see.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No free physical frame
    OutOfFrames,
    /// Address is outside the user range or malformed
    InvalidAddress {
        addr: u32,
    },
    /// No translation exists for the address
    UnmappedMemory {
        addr: u32,
    },
    /// A user access could not be resolved; the process must die
    UserFault {
        addr: u32,
        reason: &'static str,
    },
    ProcessNotFound {
        pid: i32,
    },
    /// Filesystem-level errors
    FsError(FsError),
    InvalidArgument {
        name: &'static str,
    },
    /// Snapshot id does not name an existing snapshot
    SnapshotNotFound {
        id: u32,
    },
    /// Snapshot admission check failed: not enough free inodes
    OutOfInodes,
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path component or file not found
    NotFound,
    /// Directory entry already exists
    AlreadyExists,
    /// Path component is not a directory
    NotADirectory,
    /// Operation needs a regular file
    NotAFile,
    /// Inode table is full
    NoInodes,
    /// Name longer than DIRSIZ
    NameTooLong,
    /// Invalid path format
    InvalidPath,
    /// Write past the maximum file size
    FileTooLarge,
    /// Directory is not empty
    DirectoryNotEmpty,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::InvalidAddress { addr } => write!(f, "invalid address 0x{:x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at 0x{:x}", addr),
            Self::UserFault { addr, reason } => {
                write!(f, "unresolvable user fault at 0x{:x}: {}", addr, reason)
            }
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::FsError(e) => write!(f, "filesystem error: {:?}", e),
            Self::InvalidArgument { name } => write!(f, "invalid argument '{}'", name),
            Self::SnapshotNotFound { id } => write!(f, "snapshot {} not found", id),
            Self::OutOfInodes => write!(f, "out of inodes"),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

impl KernelError {
    /// Numeric code returned to user space for this error.
    ///
    /// Snapshot admission failures are distinguishable (−2); everything
    /// else collapses to the generic −1.
    pub fn code(&self) -> isize {
        match self {
            Self::OutOfInodes => -2,
            _ => -1,
        }
    }
}
