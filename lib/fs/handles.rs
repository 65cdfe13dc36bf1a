//! State behind open file handles.
//!
//! Reads stream from the device. Writes are buffered in memory for the whole file and pushed to
//! the device on flush, since the sync protocol can only replace a file, not patch it.

use bytes::{Bytes, BytesMut};

use crate::device::{DeviceClient, DeviceError, FileReader};
use crate::fs::FileMode;

/// Largest chunk requested from the device when skipping forward.
const SKIP_CHUNK: usize = 64 * 1024;

/// A file opened for reading.
///
/// The device stream is strictly sequential. Reads at or after the current position skip ahead;
/// reads before it need a fresh stream, see [`needs_reopen`](Self::needs_reopen).
pub struct ReadHandle<R> {
    path: String,
    reader: Option<R>,
    pos: u64,
}

impl<R: FileReader> ReadHandle<R> {
    /// A handle reading `path` from the start of `reader`.
    pub fn new(path: String, reader: R) -> Self {
        Self {
            path,
            reader: Some(reader),
            pos: 0,
        }
    }

    /// The device path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Offset of the next byte the stream will produce.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Whether a read at `offset` needs a new stream.
    #[must_use]
    pub fn needs_reopen(&self, offset: u64) -> bool {
        self.reader.is_none() || offset < self.pos
    }

    /// Replace the stream with `reader`, positioned at the start of the file.
    pub async fn reopen(&mut self, reader: R) -> Result<(), DeviceError> {
        let old = self.reader.replace(reader);
        self.pos = 0;
        match old {
            Some(old) => old.close().await,
            None => Ok(()),
        }
    }

    /// Read up to `size` bytes at `offset`. `offset` must not be behind the current position.
    pub async fn read_at(&mut self, offset: u64, size: usize) -> Result<Bytes, DeviceError> {
        debug_assert!(offset >= self.pos, "backward read on a sequential stream");
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Bytes::new());
        };

        while self.pos < offset {
            let want = usize::try_from(offset - self.pos)
                .unwrap_or(usize::MAX)
                .min(SKIP_CHUNK);
            let skipped = reader.read(want).await?;
            if skipped.is_empty() {
                return Ok(Bytes::new());
            }
            self.pos += skipped.len() as u64;
        }

        let mut out = BytesMut::with_capacity(size);
        while out.len() < size {
            let chunk = reader.read(size - out.len()).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        self.pos += out.len() as u64;
        Ok(out.freeze())
    }

    /// Release the stream. Later reads need a [`reopen`](Self::reopen).
    pub async fn close(&mut self) -> Result<(), DeviceError> {
        match self.reader.take() {
            Some(reader) => reader.close().await,
            None => Ok(()),
        }
    }
}

/// A file opened for writing, buffered whole in memory.
#[derive(Debug)]
pub struct WriteHandle {
    path: String,
    buffer: Vec<u8>,
    mode: FileMode,
    dirty: bool,
}

impl WriteHandle {
    /// A handle for `path` starting from `contents`.
    #[must_use]
    pub fn new(path: String, contents: Vec<u8>, mode: FileMode, dirty: bool) -> Self {
        Self {
            path,
            buffer: contents,
            mode,
            dirty,
        }
    }

    /// The device path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mode applied to the file when it is pushed.
    #[must_use]
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// Current size of the buffered file.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Whether the buffer has changes the device has not seen.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Up to `size` bytes at `offset`.
    #[must_use]
    pub fn read_at(&self, offset: u64, size: usize) -> Bytes {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.buffer.len());
        let end = start.saturating_add(size).min(self.buffer.len());
        Bytes::copy_from_slice(&self.buffer[start..end])
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let end = start.saturating_add(data.len());
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(data);
        self.dirty = true;
        data.len()
    }

    /// Resize the buffered file to `size` bytes.
    pub fn truncate(&mut self, size: u64) {
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        if size != self.buffer.len() {
            self.buffer.resize(size, 0);
            self.dirty = true;
        }
    }

    /// Snapshot of the buffered contents.
    #[must_use]
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// Record that the device now has the buffered contents.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// Either kind of open file.
pub enum OpenHandle<C: DeviceClient> {
    /// Opened read-only.
    Read(ReadHandle<C::Reader>),
    /// Opened with write access.
    Write(WriteHandle),
}

impl<C: DeviceClient> OpenHandle<C> {
    /// The device path of the open file.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Read(h) => h.path(),
            Self::Write(h) => h.path(),
        }
    }
}
