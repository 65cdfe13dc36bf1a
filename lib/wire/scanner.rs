//! [`SyncScanner`] over any byte stream using the adb sync framing.
//!
//! Ids are fixed-width ASCII. Integers, modes, and timestamps are little-endian `u32`s
//! (timestamps in seconds since the Unix epoch). Strings are a `u32` byte length followed by
//! UTF-8 bytes.

use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{SyncScanner, TransportError, TransportErrorKind};
use crate::fs::FileMode;

/// Longest string we accept. Android caps paths well below this.
const MAX_STRING_LEN: usize = 64 * 1024;

/// Decodes sync protocol values from a reader.
///
/// [`close`](SyncScanner::close) drops the reader, releasing whatever connection it wraps.
pub struct IoScanner<R> {
    reader: Option<R>,
}

impl<R: Read> IoScanner<R> {
    /// Wrap a reader positioned at the start of a sync response.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
        }
    }

    /// Whether [`close`](SyncScanner::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            TransportError::new(TransportErrorKind::ConnectionReset, "scanner is closed")
        })?;
        let mut buf = vec![0; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_u32(&mut self) -> Result<u32, TransportError> {
        let mut word = [0; 4];
        word.copy_from_slice(&self.read_bytes(4)?);
        Ok(u32::from_le_bytes(word))
    }

    fn utf8(bytes: Vec<u8>) -> Result<String, TransportError> {
        String::from_utf8(bytes)
            .map_err(|e| TransportError::new(TransportErrorKind::Parse, e.to_string()))
    }
}

impl<R: Read> SyncScanner for IoScanner<R> {
    fn read_fixed_string(&mut self, len: usize) -> Result<String, TransportError> {
        let bytes = self.read_bytes(len)?;
        Self::utf8(bytes)
    }

    fn read_string(&mut self) -> Result<String, TransportError> {
        let len = usize::try_from(self.read_u32()?).unwrap_or(usize::MAX);
        if len > MAX_STRING_LEN {
            return Err(TransportError::new(
                TransportErrorKind::Parse,
                format!("string length {len} exceeds {MAX_STRING_LEN}"),
            ));
        }
        let bytes = self.read_bytes(len)?;
        Self::utf8(bytes)
    }

    fn read_i32(&mut self) -> Result<i32, TransportError> {
        Ok(self.read_u32()?.cast_signed())
    }

    fn read_file_mode(&mut self) -> Result<FileMode, TransportError> {
        Ok(FileMode(self.read_u32()?))
    }

    fn read_time(&mut self) -> Result<SystemTime, TransportError> {
        let secs = self.read_u32()?;
        Ok(UNIX_EPOCH + Duration::from_secs(u64::from(secs)))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        drop(self.reader.take());
        Ok(())
    }
}
