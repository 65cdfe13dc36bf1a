//! The adb sync protocol as seen by the filesystem: framed primitive values in, directory
//! entries out.
//!
//! Byte-level transport (sockets, framing of requests) lives outside this crate. The decoder only
//! needs something that can hand it already-framed values, which is what [`SyncScanner`]
//! describes.

mod dir_entries;
mod scanner;

pub use dir_entries::{DecodeError, DirEntries, EntryField};
pub use scanner::IoScanner;

use std::time::SystemTime;

use thiserror::Error;

use crate::fs::FileMode;

/// Metadata of one node on the device, as reported by a `DENT` record or a stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name of the node within its parent directory.
    pub name: String,
    /// File type and permission bits.
    pub mode: FileMode,
    /// Size in bytes. The protocol only carries 32 bits.
    pub size: i32,
    /// Last modification time.
    pub modified_at: SystemTime,
}

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The device is gone: unplugged, rebooted, or deauthorized.
    DeviceNotFound,
    /// The requested path does not exist on the device.
    FileNoExist,
    /// The adb server could not be reached.
    ServerNotAvailable,
    /// The connection broke mid-request.
    ConnectionReset,
    /// The peer sent something that could not be parsed.
    Parse,
    /// Any other failure reported by the adb server or device.
    Adb,
}

/// A failure of the underlying transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    /// What went wrong.
    pub kind: TransportErrorKind,
    /// Human-readable detail from the transport.
    pub message: String,
}

impl TransportError {
    /// Create a new transport error.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error means the device has disconnected.
    #[must_use]
    pub fn is_device_not_found(&self) -> bool {
        self.kind == TransportErrorKind::DeviceNotFound
    }
}

impl From<std::io::Error> for TransportError {
    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "ErrorKind is non_exhaustive; Adb is the safe default"
    )]
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => TransportErrorKind::FileNoExist,
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::ServerNotAvailable,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => TransportErrorKind::ConnectionReset,
            std::io::ErrorKind::InvalidData => TransportErrorKind::Parse,
            _ => TransportErrorKind::Adb,
        };
        Self::new(kind, e.to_string())
    }
}

/// Sequential, blocking source of framed protocol values.
///
/// Every read may fail with a [`TransportError`]. [`close`](Self::close) releases the underlying
/// connection.
pub trait SyncScanner {
    /// Read a string of exactly `len` bytes, such as a record id.
    fn read_fixed_string(&mut self, len: usize) -> Result<String, TransportError>;

    /// Read a length-prefixed string.
    fn read_string(&mut self) -> Result<String, TransportError>;

    /// Read a signed 32-bit integer.
    fn read_i32(&mut self) -> Result<i32, TransportError>;

    /// Read a file mode.
    fn read_file_mode(&mut self) -> Result<FileMode, TransportError>;

    /// Read a timestamp.
    fn read_time(&mut self) -> Result<SystemTime, TransportError>;

    /// Release the underlying connection.
    fn close(&mut self) -> Result<(), TransportError>;
}
