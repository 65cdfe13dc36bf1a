//! Filesystem-facing types and the path-based adapter.
/// Path-based filesystem operations over a [`DeviceClient`](crate::device::DeviceClient).
pub mod adbfs;
/// Open file handle state.
pub mod handles;
/// Inode number to device path mapping.
pub mod inode_table;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`adbfs::AdbFs`].
pub mod fuser;

pub use adbfs::{AdbFs, FsOptions};

use std::fmt;
use std::time::SystemTime;

use bitflags::bitflags;

use crate::wire::DirEntry;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

bitflags! {
    /// Permission bits of a device file, as in Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;

        /// Other: read, write, and execute.
        const OTHER_RWX = Self::OTHER_READ.bits()
            | Self::OTHER_WRITE.bits()
            | Self::OTHER_EXECUTE.bits();
        /// Group: read, write, and execute.
        const GROUP_RWX = Self::GROUP_READ.bits()
            | Self::GROUP_WRITE.bits()
            | Self::GROUP_EXECUTE.bits();
        /// Owner: read, write, and execute.
        const OWNER_RWX = Self::OWNER_READ.bits()
            | Self::OWNER_WRITE.bits()
            | Self::OWNER_EXECUTE.bits();
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// Whether these flags request write access.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// The type of a device file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// A regular file.
    RegularFile,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A character device.
    CharDevice,
    /// A block device.
    BlockDevice,
    /// A FIFO.
    NamedPipe,
    /// A Unix domain socket.
    Socket,
}

/// Raw Unix `st_mode` bits as reported by the device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileMode(pub u32);

impl FileMode {
    const TYPE_MASK: u32 = 0o170_000;
    const PERM_MASK: u32 = 0o7777;

    /// Mode of a regular file with the given permission bits.
    #[must_use]
    pub fn regular(perm: u32) -> Self {
        Self(0o100_000 | (perm & Self::PERM_MASK))
    }

    /// Mode of a directory with the given permission bits.
    #[must_use]
    pub fn directory(perm: u32) -> Self {
        Self(0o040_000 | (perm & Self::PERM_MASK))
    }

    /// The file type encoded in the mode, if it is one we know.
    #[must_use]
    pub fn kind(self) -> Option<FileKind> {
        match self.0 & Self::TYPE_MASK {
            0o100_000 => Some(FileKind::RegularFile),
            0o040_000 => Some(FileKind::Directory),
            0o120_000 => Some(FileKind::Symlink),
            0o020_000 => Some(FileKind::CharDevice),
            0o060_000 => Some(FileKind::BlockDevice),
            0o010_000 => Some(FileKind::NamedPipe),
            0o140_000 => Some(FileKind::Socket),
            _ => None,
        }
    }

    /// Permission bits, including setuid/setgid/sticky.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "masked to 12 bits before narrowing"
    )]
    pub fn permissions(self) -> Permissions {
        Permissions::from_bits_truncate((self.0 & Self::PERM_MASK) as u16)
    }

    /// Whether the mode describes a directory.
    #[must_use]
    pub fn is_dir(self) -> bool {
        self.kind() == Some(FileKind::Directory)
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMode({:#o})", self.0)
    }
}

/// Attributes of a device file, as served to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    /// The type of the file.
    pub kind: FileKind,
    /// Permission bits.
    pub perm: Permissions,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: SystemTime,
}

impl From<&DirEntry> for Attr {
    fn from(entry: &DirEntry) -> Self {
        Self {
            // Modes we can't classify are served as regular files; the kernel refuses unknown
            // types outright.
            kind: entry.mode.kind().unwrap_or(FileKind::RegularFile),
            perm: entry.mode.permissions(),
            size: u64::try_from(entry.size).unwrap_or(0),
            mtime: entry.modified_at,
        }
    }
}
