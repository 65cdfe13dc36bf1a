#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use adb_fs::device::adb::{DeviceTransport, RemoteSink};
use adb_fs::fs::FileMode;
use adb_fs::wire::{DirEntry, IoScanner, TransportError, TransportErrorKind};

/// Appends one `DENT` record in sync framing.
pub fn encode_dent(out: &mut Vec<u8>, mode: u32, size: i32, mtime_secs: u32, name: &str) {
    out.extend_from_slice(b"DENT");
    out.extend_from_slice(&mode.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&mtime_secs.to_le_bytes());
    out.extend_from_slice(&u32::try_from(name.len()).unwrap().to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

/// Appends the `DONE` terminator, with its zeroed trailing fields.
pub fn encode_done(out: &mut Vec<u8>) {
    out.extend_from_slice(b"DONE");
    out.extend_from_slice(&[0; 16]);
}

/// A complete listing of regular files, `(name, size)` each.
pub fn encode_listing(files: &[(&str, i32)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, size) in files {
        encode_dent(&mut out, 0o100_644, *size, 1_700_000_000, name);
    }
    encode_done(&mut out);
    out
}

#[derive(Debug, Default)]
pub struct TransportState {
    pub listings: Mutex<HashMap<String, Vec<u8>>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    /// Uploads committed on close: path to `(contents, mode, mtime)`.
    pub uploads: Mutex<HashMap<String, (Vec<u8>, FileMode, SystemTime)>>,
    /// When set, every call fails with this kind.
    pub failure: Mutex<Option<TransportErrorKind>>,
    pub calls: AtomicUsize,
}

/// A blocking transport serving canned responses. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    pub state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing(self, dir: &str, bytes: Vec<u8>) -> Self {
        self.state
            .listings
            .lock()
            .unwrap()
            .insert(dir.to_owned(), bytes);
        self
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), contents.to_vec());
        self
    }

    pub fn fail_with(&self, kind: TransportErrorKind) {
        *self.state.failure.lock().unwrap() = Some(kind);
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn upload(&self, path: &str) -> Option<(Vec<u8>, FileMode, SystemTime)> {
        self.state.uploads.lock().unwrap().get(path).cloned()
    }

    fn check(&self) -> Result<(), TransportError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        match *self.state.failure.lock().unwrap() {
            Some(kind) => Err(TransportError::new(kind, "injected failure")),
            None => Ok(()),
        }
    }

    fn missing(path: &str) -> TransportError {
        TransportError::new(TransportErrorKind::FileNoExist, format!("{path}: no such file"))
    }
}

impl DeviceTransport for MockTransport {
    type Reader = Cursor<Vec<u8>>;
    type Writer = MockSink;
    type Scanner = IoScanner<Cursor<Vec<u8>>>;

    fn open_read(&self, path: &str) -> Result<Self::Reader, TransportError> {
        self.check()?;
        let files = self.state.files.lock().unwrap();
        let contents = files.get(path).ok_or_else(|| Self::missing(path))?;
        Ok(Cursor::new(contents.clone()))
    }

    fn open_write(
        &self,
        path: &str,
        mode: FileMode,
        mtime: SystemTime,
    ) -> Result<Self::Writer, TransportError> {
        self.check()?;
        Ok(MockSink {
            state: Arc::clone(&self.state),
            path: path.to_owned(),
            mode,
            mtime,
            buffer: Vec::new(),
        })
    }

    fn stat(&self, path: &str) -> Result<DirEntry, TransportError> {
        self.check()?;
        let files = self.state.files.lock().unwrap();
        let contents = files.get(path).ok_or_else(|| Self::missing(path))?;
        Ok(DirEntry {
            name: path.rsplit('/').next().unwrap_or_default().to_owned(),
            mode: FileMode::regular(0o644),
            size: i32::try_from(contents.len()).unwrap(),
            modified_at: UNIX_EPOCH,
        })
    }

    fn list_dir(&self, path: &str) -> Result<Self::Scanner, TransportError> {
        self.check()?;
        let listings = self.state.listings.lock().unwrap();
        let bytes = listings.get(path).ok_or_else(|| Self::missing(path))?;
        Ok(IoScanner::new(Cursor::new(bytes.clone())))
    }

    fn run_command(&self, cmd: &str, args: &[String]) -> Result<String, TransportError> {
        self.check()?;
        Ok(format!("{cmd} {}", args.join(" ")))
    }
}

/// Upload sink committing to `TransportState::uploads` on close.
pub struct MockSink {
    state: Arc<TransportState>,
    path: String,
    mode: FileMode,
    mtime: SystemTime,
    buffer: Vec<u8>,
}

impl Write for MockSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl RemoteSink for MockSink {
    fn close(self) -> Result<(), TransportError> {
        if let Some(kind) = *self.state.failure.lock().unwrap() {
            return Err(TransportError::new(kind, "injected failure"));
        }
        self.state
            .uploads
            .lock()
            .unwrap()
            .insert(self.path, (self.buffer, self.mode, self.mtime));
        Ok(())
    }
}
