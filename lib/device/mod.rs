//! Operations against the remote device.
//!
//! [`DeviceClient`] is the seam every filesystem operation goes through. The adb-backed client
//! lives in [`adb`], and [`caching`] decorates any client with the directory-listing cache.

pub mod adb;
pub mod caching;

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

use crate::fs::FileMode;
use crate::oplog::OperationLog;
use crate::wire::{DecodeError, DirEntry, TransportError, TransportErrorKind};

/// A directory's entries, in the order the device reported them.
pub type Listing = Arc<[DirEntry]>;

/// Called when an operation finds that the device has disconnected.
///
/// May be invoked many times and from many threads at once.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Failure of a device operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A directory listing could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The name is missing from a cached listing of its parent.
    #[error("{name} does not exist")]
    NotInListing {
        /// Full path that was looked up.
        name: String,
    },

    /// A shell command ran but reported a failure.
    #[error("{command} failed: {output}")]
    Command {
        /// The command line that was run.
        command: String,
        /// What the command printed.
        output: String,
    },
}

impl DeviceError {
    /// Whether this error means the device has disconnected.
    #[must_use]
    pub fn is_device_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_device_not_found(),
            Self::Decode(e) => e
                .transport_error()
                .is_some_and(TransportError::is_device_not_found),
            Self::NotInListing { .. } | Self::Command { .. } => false,
        }
    }

    /// The errno to report to the kernel for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Transport(e) => transport_errno(e),
            Self::Decode(_) if self.is_device_not_found() => libc::ENODEV,
            Self::Decode(_) => libc::EIO,
            Self::NotInListing { .. } => libc::ENOENT,
            Self::Command { output, .. } => command_output_errno(output),
        }
    }
}

fn transport_errno(e: &TransportError) -> i32 {
    match e.kind {
        TransportErrorKind::DeviceNotFound => libc::ENODEV,
        TransportErrorKind::FileNoExist => libc::ENOENT,
        TransportErrorKind::ServerNotAvailable
        | TransportErrorKind::ConnectionReset
        | TransportErrorKind::Parse
        | TransportErrorKind::Adb => libc::EIO,
    }
}

/// Error strings printed by Android's toolbox and their errnos. Checked in order.
const OUTPUT_ERRNOS: &[(&str, i32)] = &[
    ("readlink: Invalid argument", libc::EINVAL),
    ("readlink: Permission denied", libc::EACCES),
    ("No such file or directory", libc::ENOENT),
    ("Permission denied", libc::EACCES),
    ("Read-only file system", libc::EROFS),
    ("File exists", libc::EEXIST),
    ("Directory not empty", libc::ENOTEMPTY),
    ("Not a directory", libc::ENOTDIR),
    ("Is a directory", libc::EISDIR),
];

/// Classify the output of a failed shell command.
#[must_use]
pub fn command_output_errno(output: &str) -> i32 {
    OUTPUT_ERRNOS
        .iter()
        .find(|(needle, _)| output.contains(needle))
        .map_or(libc::EIO, |(_, errno)| *errno)
}

/// A sequential read stream of one device file.
pub trait FileReader: Send + 'static {
    /// Read up to `max` bytes. An empty buffer means end of file.
    fn read(&mut self, max: usize) -> impl Future<Output = Result<Bytes, DeviceError>> + Send;

    /// Release the stream.
    fn close(self) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// A write stream replacing the contents of one device file.
///
/// The file's mode and mtime are applied by the device when the stream is closed, and the data is
/// only guaranteed to be on the device once [`close`](Self::close) returns `Ok`.
pub trait FileWriter: Send + 'static {
    /// Append `data` to the stream.
    fn write(&mut self, data: Bytes) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Finish the transfer.
    fn close(self) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// Operations against a remote device.
///
/// Every method takes the [`OperationLog`] of the filesystem operation it serves, so that layers
/// such as the cache can annotate it.
pub trait DeviceClient: Send + Sync + 'static {
    /// Stream returned by [`open_read`](Self::open_read).
    type Reader: FileReader;
    /// Stream returned by [`open_write`](Self::open_write).
    type Writer: FileWriter;

    /// Open `path` for reading.
    fn open_read(
        &self,
        path: &str,
        log: &OperationLog,
    ) -> impl Future<Output = Result<Self::Reader, DeviceError>> + Send;

    /// Open `path` for writing. `mode` and `mtime` are applied when the writer closes.
    fn open_write(
        &self,
        path: &str,
        mode: FileMode,
        mtime: SystemTime,
        log: &OperationLog,
    ) -> impl Future<Output = Result<Self::Writer, DeviceError>> + Send;

    /// Metadata of `path`.
    fn stat(
        &self,
        path: &str,
        log: &OperationLog,
    ) -> impl Future<Output = Result<DirEntry, DeviceError>> + Send;

    /// Entries of the directory at `path`.
    fn list(
        &self,
        path: &str,
        log: &OperationLog,
    ) -> impl Future<Output = Result<Listing, DeviceError>> + Send;

    /// Run a shell command on the device and return what it printed.
    fn run_command(
        &self,
        cmd: &str,
        args: &[&str],
        log: &OperationLog,
    ) -> impl Future<Output = Result<String, DeviceError>> + Send;

    /// Drop anything remembered about the directory `dir`.
    fn invalidate(&self, _dir: &str) {}
}
