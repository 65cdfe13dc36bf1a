//! Path-based filesystem operations over a [`DeviceClient`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

use super::handles::{OpenHandle, ReadHandle, WriteHandle};
use super::{Attr, FileHandle, FileKind, FileMode, OpenFlags};
use crate::device::{DeviceClient, DeviceError, FileReader as _, FileWriter as _, Listing};
use crate::oplog::{OperationLog, Status};
use crate::paths;

/// Chunk size used when pulling a whole file into a write buffer.
const PULL_CHUNK: usize = 64 * 1024;

/// Largest file the sync protocol can describe. Sizes travel as `i32`.
pub const MAX_FILE_SIZE: u64 = 0x7fff_ffff;

/// Fails with [`FsError::TooLarge`] when `size` bytes cannot live on the device.
fn check_size(path: &str, size: u64) -> Result<(), FsError> {
    if size > MAX_FILE_SIZE {
        return Err(FsError::TooLarge {
            path: path.to_owned(),
            size,
        });
    }
    Ok(())
}

/// Failure of a filesystem operation.
#[derive(Debug, Error)]
pub enum FsError {
    /// The device operation failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// No open file has this handle.
    #[error("no open file with handle {0}")]
    BadHandle(FileHandle),

    /// The handle was opened read-only.
    #[error("handle {0} is not open for writing")]
    NotWritable(FileHandle),

    /// The file would be larger than the device or the write buffer can hold.
    #[error("{path} is too large to buffer ({size} bytes)")]
    TooLarge {
        /// Device path.
        path: String,
        /// Reported size.
        size: u64,
    },
}

impl FsError {
    /// The errno to report to the kernel.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Device(e) => e.errno(),
            Self::BadHandle(_) | Self::NotWritable(_) => libc::EBADF,
            Self::TooLarge { .. } => libc::EFBIG,
        }
    }
}

/// Mount-wide settings for [`AdbFs`].
#[derive(Debug, Clone)]
pub struct FsOptions {
    /// Where the filesystem is mounted on the host.
    pub mount_point: PathBuf,
    /// Owner reported for every file.
    pub uid: u32,
    /// Group reported for every file.
    pub gid: u32,
}

/// Records the outcome of an operation on its log and converts errors to errnos.
fn finish<T>(log: &OperationLog, result: Result<T, FsError>) -> io::Result<T> {
    match result {
        Ok(value) => {
            log.status(Status::Ok);
            Ok(value)
        }
        Err(e) => {
            log.error(&e);
            let errno = e.errno();
            log.status(Status::Errno(errno));
            Err(io::Error::from_raw_os_error(errno))
        }
    }
}

/// Fails with the command's output when a shell command printed anything.
fn expect_silent(command: String, output: String) -> Result<(), FsError> {
    let output = output.trim();
    if output.is_empty() {
        Ok(())
    } else {
        Err(DeviceError::Command {
            command,
            output: output.to_owned(),
        }
        .into())
    }
}

type SharedHandle<C> = Arc<Mutex<OpenHandle<C>>>;

/// The device filesystem, addressed by path.
///
/// Every operation logs an [`OperationLog`] and reports failures as [`io::Error`]s carrying the
/// errno to return to the kernel.
pub struct AdbFs<C: DeviceClient> {
    client: C,
    options: FsOptions,
    handles: scc::HashMap<FileHandle, SharedHandle<C>>,
    next_handle: AtomicU64,
}

impl<C: DeviceClient> AdbFs<C> {
    /// Serve the device reached through `client`.
    pub fn new(client: C, options: FsOptions) -> Self {
        Self {
            client,
            options,
            handles: scc::HashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Mount-wide settings.
    #[must_use]
    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// The device client.
    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Number of open file handles.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    fn insert_handle(&self, handle: OpenHandle<C>) -> FileHandle {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        drop(
            self.handles
                .insert_sync(fh, Arc::new(Mutex::new(handle))),
        );
        fh
    }

    async fn handle(&self, fh: FileHandle) -> Result<SharedHandle<C>, FsError> {
        self.handles
            .read_async(&fh, |_, h| Arc::clone(h))
            .await
            .ok_or(FsError::BadHandle(fh))
    }

    /// Attributes of `path`.
    #[instrument(name = "AdbFs::getattr", skip(self))]
    pub async fn getattr(&self, path: &str) -> io::Result<Attr> {
        let log = OperationLog::start("GetAttr", path);
        let result = self
            .client
            .stat(path, &log)
            .await
            .map(|entry| Attr::from(&entry))
            .map_err(FsError::from);
        finish(&log, result)
    }

    /// Entries of the directory at `path`.
    #[instrument(name = "AdbFs::readdir", skip(self))]
    pub async fn readdir(&self, path: &str) -> io::Result<Listing> {
        let log = OperationLog::start("OpenDir", path);
        let result = self.client.list(path, &log).await.map_err(FsError::from);
        if let Ok(entries) = &result {
            log.result(format_args!("{} entries", entries.len()));
        }
        finish(&log, result)
    }

    /// Open `path`.
    ///
    /// Read-only opens start a device stream right away, so a missing file fails here rather than
    /// on the first read. Opens with write access buffer the file, starting empty with `O_TRUNC`.
    #[instrument(name = "AdbFs::open", skip(self))]
    pub async fn open(&self, path: &str, flags: OpenFlags) -> io::Result<FileHandle> {
        let log = OperationLog::start("Open", path);
        let result = self.open_inner(path, flags, &log).await;
        if let Ok(fh) = &result {
            log.result(format_args!("fh={fh}"));
        }
        finish(&log, result)
    }

    async fn open_inner(
        &self,
        path: &str,
        flags: OpenFlags,
        log: &OperationLog,
    ) -> Result<FileHandle, FsError> {
        if !flags.is_writable() {
            let reader = self.client.open_read(path, log).await?;
            return Ok(self.insert_handle(OpenHandle::Read(ReadHandle::new(
                path.to_owned(),
                reader,
            ))));
        }

        let entry = self.client.stat(path, log).await?;
        let truncate = flags.contains(OpenFlags::TRUNC);
        let contents = if truncate {
            Vec::new()
        } else {
            self.pull(path, u64::try_from(entry.size).unwrap_or(0), log)
                .await?
        };
        let dirty = truncate && entry.size != 0;
        let handle = WriteHandle::new(path.to_owned(), contents, entry.mode, dirty);
        Ok(self.insert_handle(OpenHandle::Write(handle)))
    }

    /// Read the whole file at `path`.
    async fn pull(&self, path: &str, size_hint: u64, log: &OperationLog) -> Result<Vec<u8>, FsError> {
        let capacity = usize::try_from(size_hint).map_err(|_| FsError::TooLarge {
            path: path.to_owned(),
            size: size_hint,
        })?;
        let mut reader = self.client.open_read(path, log).await?;
        let mut contents = Vec::with_capacity(capacity);
        let read = loop {
            match reader.read(PULL_CHUNK).await {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => contents.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        let closed = reader.close().await;
        read?;
        closed?;
        trace!(bytes = contents.len(), "pulled file");
        Ok(contents)
    }

    /// Replace the device file with the handle's buffer.
    ///
    /// The mtime is set to now. The remote writer is closed even when writing fails, and the data
    /// is only on the device once the close succeeds.
    async fn push(&self, handle: &mut WriteHandle, log: &OperationLog) -> Result<(), FsError> {
        let mtime = SystemTime::now();
        let mut writer = self
            .client
            .open_write(handle.path(), handle.mode(), mtime, log)
            .await?;
        let contents = handle.contents();
        let written = if contents.is_empty() {
            Ok(())
        } else {
            writer.write(contents).await
        };
        let closed = writer.close().await;
        written?;
        closed?;
        handle.mark_clean();
        debug!(path = handle.path(), size = handle.size(), "pushed file");
        Ok(())
    }

    /// Create `path` with permission bits `mode` and open it for writing.
    #[instrument(name = "AdbFs::create", skip(self))]
    pub async fn create(&self, path: &str, mode: u32) -> io::Result<(FileHandle, Attr)> {
        let log = OperationLog::start("Create", path);
        let result = async {
            let file_mode = FileMode::regular(mode);
            let mut handle = WriteHandle::new(path.to_owned(), Vec::new(), file_mode, true);
            self.push(&mut handle, &log).await?;
            let attr = Attr {
                kind: FileKind::RegularFile,
                perm: file_mode.permissions(),
                size: 0,
                mtime: SystemTime::now(),
            };
            Ok::<_, FsError>((self.insert_handle(OpenHandle::Write(handle)), attr))
        }
        .await;
        finish(&log, result)
    }

    /// Read up to `size` bytes at `offset` from an open file.
    #[instrument(name = "AdbFs::read", skip(self))]
    pub async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> io::Result<Bytes> {
        let log = OperationLog::start_file("Read", format_args!("fh={fh} off={offset} size={size}"));
        let result = self.read_inner(fh, offset, size as usize, &log).await;
        if let Ok(data) = &result {
            log.result(format_args!("{} bytes", data.len()));
        }
        finish(&log, result)
    }

    async fn read_inner(
        &self,
        fh: FileHandle,
        offset: u64,
        size: usize,
        log: &OperationLog,
    ) -> Result<Bytes, FsError> {
        let shared = self.handle(fh).await?;
        let mut guard = shared.lock().await;
        match &mut *guard {
            OpenHandle::Read(handle) => {
                if handle.needs_reopen(offset) {
                    debug!(
                        from = handle.position(),
                        to = offset,
                        "seeking backwards, reopening stream"
                    );
                    let reader = self.client.open_read(handle.path(), log).await?;
                    handle.reopen(reader).await?;
                }
                Ok(handle.read_at(offset, size).await?)
            }
            OpenHandle::Write(handle) => Ok(handle.read_at(offset, size)),
        }
    }

    /// Write `data` at `offset` into an open file. Returns the number of bytes written.
    #[instrument(name = "AdbFs::write", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> io::Result<usize> {
        let log = OperationLog::start_file(
            "Write",
            format_args!("fh={fh} off={offset} len={}", data.len()),
        );
        let result = async {
            let shared = self.handle(fh).await?;
            let mut guard = shared.lock().await;
            match &mut *guard {
                OpenHandle::Write(handle) => {
                    let end = offset.saturating_add(data.len() as u64);
                    check_size(handle.path(), end)?;
                    Ok::<_, FsError>(handle.write_at(offset, data))
                }
                OpenHandle::Read(_) => Err(FsError::NotWritable(fh)),
            }
        }
        .await;
        finish(&log, result)
    }

    /// Resize `path` to `size` bytes, through the open handle `fh` when there is one.
    #[instrument(name = "AdbFs::truncate", skip(self))]
    pub async fn truncate(&self, path: &str, fh: Option<FileHandle>, size: u64) -> io::Result<()> {
        let log = OperationLog::start("Truncate", path);
        let result = self.truncate_inner(path, fh, size, &log).await;
        finish(&log, result)
    }

    async fn truncate_inner(
        &self,
        path: &str,
        fh: Option<FileHandle>,
        size: u64,
        log: &OperationLog,
    ) -> Result<(), FsError> {
        check_size(path, size)?;
        if let Some(fh) = fh {
            let shared = self.handle(fh).await?;
            let mut guard = shared.lock().await;
            if let OpenHandle::Write(handle) = &mut *guard {
                handle.truncate(size);
                return Ok(());
            }
        }

        let entry = self.client.stat(path, log).await?;
        let current = u64::try_from(entry.size).unwrap_or(0);
        let contents = if size == 0 {
            Vec::new()
        } else {
            self.pull(path, current, log).await?
        };
        let mut handle = WriteHandle::new(path.to_owned(), contents, entry.mode, false);
        handle.truncate(size);
        if handle.is_dirty() || current != size {
            self.push(&mut handle, log).await?;
        }
        Ok(())
    }

    /// Push buffered writes of `fh` to the device.
    #[instrument(name = "AdbFs::flush", skip(self))]
    pub async fn flush(&self, fh: FileHandle) -> io::Result<()> {
        let log = OperationLog::start_file("Flush", format_args!("fh={fh}"));
        let result = async {
            let shared = self.handle(fh).await?;
            let mut guard = shared.lock().await;
            match &mut *guard {
                OpenHandle::Write(handle) if handle.is_dirty() => self.push(handle, &log).await,
                OpenHandle::Write(_) | OpenHandle::Read(_) => Ok::<_, FsError>(()),
            }
        }
        .await;
        finish(&log, result)
    }

    /// Close `fh`, pushing any buffered writes first.
    #[instrument(name = "AdbFs::release", skip(self))]
    pub async fn release(&self, fh: FileHandle) -> io::Result<()> {
        let log = OperationLog::start_file("Release", format_args!("fh={fh}"));
        let result = async {
            let (_, shared) = self
                .handles
                .remove_async(&fh)
                .await
                .ok_or(FsError::BadHandle(fh))?;
            let mut guard = shared.lock().await;
            match &mut *guard {
                OpenHandle::Write(handle) if handle.is_dirty() => self.push(handle, &log).await?,
                OpenHandle::Write(_) => {}
                OpenHandle::Read(handle) => handle.close().await?,
            }
            Ok::<_, FsError>(())
        }
        .await;
        finish(&log, result)
    }

    /// Target of the symlink at `path`.
    ///
    /// Absolute targets point into the device's namespace, so they are rebased under the mount
    /// point to resolve through this filesystem.
    #[instrument(name = "AdbFs::readlink", skip(self))]
    pub async fn readlink(&self, path: &str) -> io::Result<PathBuf> {
        let log = OperationLog::start("ReadLink", path);
        let result = async {
            let output = self.client.run_command("readlink", &[path], &log).await?;
            let target = output.trim_end_matches(['\r', '\n']);
            if target.is_empty() || target.starts_with("readlink:") {
                return Err(FsError::from(DeviceError::Command {
                    command: format!("readlink {path}"),
                    output: target.to_owned(),
                }));
            }
            Ok::<_, FsError>(self.rebase_link_target(target))
        }
        .await;
        if let Ok(target) = &result {
            log.result(target.display());
        }
        finish(&log, result)
    }

    fn rebase_link_target(&self, target: &str) -> PathBuf {
        match target.strip_prefix('/') {
            Some(relative) => self.options.mount_point.join(relative),
            None => Path::new(target).to_path_buf(),
        }
    }

    /// Create the directory `path` with permission bits `mode`.
    #[instrument(name = "AdbFs::mkdir", skip(self))]
    pub async fn mkdir(&self, path: &str, mode: u32) -> io::Result<Attr> {
        let log = OperationLog::start("Mkdir", path);
        let result = async {
            let mode_arg = format!("{:o}", mode & 0o7777);
            let output = self
                .client
                .run_command("mkdir", &["-m", mode_arg.as_str(), path], &log)
                .await?;
            expect_silent(format!("mkdir -m {mode_arg} {path}"), output)?;
            self.client.invalidate(&paths::parent(path));
            Ok::<_, FsError>(Attr {
                kind: FileKind::Directory,
                perm: FileMode::directory(mode).permissions(),
                size: 0,
                mtime: SystemTime::now(),
            })
        }
        .await;
        finish(&log, result)
    }

    /// Remove the file at `path`.
    #[instrument(name = "AdbFs::unlink", skip(self))]
    pub async fn unlink(&self, path: &str) -> io::Result<()> {
        let log = OperationLog::start("Unlink", path);
        let result = self.remove_with(&log, "rm", path).await;
        finish(&log, result)
    }

    /// Remove the empty directory at `path`.
    #[instrument(name = "AdbFs::rmdir", skip(self))]
    pub async fn rmdir(&self, path: &str) -> io::Result<()> {
        let log = OperationLog::start("Rmdir", path);
        let result = self.remove_with(&log, "rmdir", path).await;
        finish(&log, result)
    }

    async fn remove_with(&self, log: &OperationLog, cmd: &str, path: &str) -> Result<(), FsError> {
        let output = self.client.run_command(cmd, &[path], log).await?;
        expect_silent(format!("{cmd} {path}"), output)?;
        self.client.invalidate(&paths::parent(path));
        Ok(())
    }

    /// Move `from` to `to`.
    #[instrument(name = "AdbFs::rename", skip(self))]
    pub async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let log = OperationLog::start("Rename", format!("{from} -> {to}"));
        let result = async {
            let output = self.client.run_command("mv", &[from, to], &log).await?;
            expect_silent(format!("mv {from} {to}"), output)?;
            self.client.invalidate(&paths::parent(from));
            self.client.invalidate(&paths::parent(to));
            Ok::<_, FsError>(())
        }
        .await;
        finish(&log, result)
    }
}
