//! [`DeviceClient`] backed by a blocking adb transport.

use std::io::{Read, Write};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{DeviceClient, DeviceError, DisconnectCallback, FileReader, FileWriter, Listing};
use crate::fs::FileMode;
use crate::oplog::OperationLog;
use crate::wire::{DirEntries, DirEntry, SyncScanner, TransportError, TransportErrorKind};

/// The remote end of a file upload.
pub trait RemoteSink: Write + Send + 'static {
    /// Finish the upload. The device applies the file's mode and mtime at this point.
    fn close(self) -> Result<(), TransportError>;
}

/// Blocking device operations provided by an adb connection.
///
/// Implementations own connection setup and request framing, and are responsible for quoting
/// shell arguments. Each call may block for a network round trip.
pub trait DeviceTransport: Clone + Send + Sync + 'static {
    /// Byte stream of a file being downloaded.
    type Reader: Read + Send + 'static;
    /// Byte sink of a file being uploaded.
    type Writer: RemoteSink;
    /// Framed value stream of a directory listing.
    type Scanner: SyncScanner + Send + 'static;

    /// Start downloading `path`.
    fn open_read(&self, path: &str) -> Result<Self::Reader, TransportError>;

    /// Start uploading to `path`. `mode` and `mtime` are sent when the upload is closed.
    fn open_write(
        &self,
        path: &str,
        mode: FileMode,
        mtime: SystemTime,
    ) -> Result<Self::Writer, TransportError>;

    /// Metadata of `path`. A missing path is reported as [`TransportErrorKind::FileNoExist`].
    fn stat(&self, path: &str) -> Result<DirEntry, TransportError>;

    /// Start listing the directory at `path`.
    fn list_dir(&self, path: &str) -> Result<Self::Scanner, TransportError>;

    /// Run `cmd` with `args` in a device shell and return its combined output.
    fn run_command(&self, cmd: &str, args: &[String]) -> Result<String, TransportError>;
}

/// Runs `f` on the blocking pool. Panics inside `f` are re-raised on the calling task.
async fn run_blocking<R, F>(f: F) -> Result<R, DeviceError>
where
    F: FnOnce() -> Result<R, DeviceError> + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(TransportError::new(TransportErrorKind::ConnectionReset, e.to_string()).into()),
    }
}

/// Invokes the disconnect callback for errors that mean the device is gone.
#[derive(Clone, Default)]
struct DisconnectCheck(Option<DisconnectCallback>);

impl DisconnectCheck {
    fn check<R>(&self, result: Result<R, DeviceError>) -> Result<R, DeviceError> {
        if let Err(e) = &result
            && e.is_device_not_found()
        {
            warn!(error = %e, "device disconnected");
            if let Some(callback) = &self.0 {
                callback();
            }
        }
        result
    }
}

/// Device client that forwards every operation to a [`DeviceTransport`].
///
/// Blocking transport calls run on the tokio blocking pool. Whenever a call fails because the
/// device is gone, the disconnect callback runs once for that call and the original error is
/// still returned.
#[derive(Clone)]
pub struct AdbDeviceClient<T> {
    transport: T,
    disconnect: DisconnectCheck,
}

impl<T: DeviceTransport> AdbDeviceClient<T> {
    /// Create a client without a disconnect callback.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            disconnect: DisconnectCheck::default(),
        }
    }

    /// Register the callback to run when the device is found disconnected.
    #[must_use]
    pub fn with_disconnect_callback(mut self, callback: DisconnectCallback) -> Self {
        self.disconnect = DisconnectCheck(Some(callback));
        self
    }

    async fn call<R, F>(&self, f: F) -> Result<R, DeviceError>
    where
        F: FnOnce(T) -> Result<R, DeviceError> + Send + 'static,
        R: Send + 'static,
    {
        let transport = self.transport.clone();
        self.disconnect
            .check(run_blocking(move || f(transport)).await)
    }
}

impl<T: DeviceTransport> DeviceClient for AdbDeviceClient<T> {
    type Reader = AdbReader<T::Reader>;
    type Writer = AdbWriter<T::Writer>;

    async fn open_read(&self, path: &str, _log: &OperationLog) -> Result<Self::Reader, DeviceError> {
        let path = path.to_owned();
        let inner = self
            .call(move |t| t.open_read(&path).map_err(DeviceError::from))
            .await?;
        Ok(AdbReader {
            inner: Some(inner),
            disconnect: self.disconnect.clone(),
        })
    }

    async fn open_write(
        &self,
        path: &str,
        mode: FileMode,
        mtime: SystemTime,
        _log: &OperationLog,
    ) -> Result<Self::Writer, DeviceError> {
        let path = path.to_owned();
        let inner = self
            .call(move |t| t.open_write(&path, mode, mtime).map_err(DeviceError::from))
            .await?;
        Ok(AdbWriter {
            inner: Some(inner),
            disconnect: self.disconnect.clone(),
        })
    }

    async fn stat(&self, path: &str, _log: &OperationLog) -> Result<DirEntry, DeviceError> {
        let path = path.to_owned();
        self.call(move |t| t.stat(&path).map_err(DeviceError::from))
            .await
    }

    async fn list(&self, path: &str, _log: &OperationLog) -> Result<Listing, DeviceError> {
        let path = path.to_owned();
        let entries = self
            .call(move |t| {
                let scanner = t.list_dir(&path)?;
                DirEntries::new(scanner)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(DeviceError::from)
            })
            .await?;
        debug!(count = entries.len(), "listed directory");
        Ok(entries.into())
    }

    async fn run_command(
        &self,
        cmd: &str,
        args: &[&str],
        _log: &OperationLog,
    ) -> Result<String, DeviceError> {
        let cmd = cmd.to_owned();
        let args: Vec<String> = args.iter().map(|&a| a.to_owned()).collect();
        self.call(move |t| t.run_command(&cmd, &args).map_err(DeviceError::from))
            .await
    }
}

fn closed_stream() -> DeviceError {
    TransportError::new(TransportErrorKind::ConnectionReset, "stream is closed").into()
}

/// Download stream of an [`AdbDeviceClient`].
pub struct AdbReader<R> {
    inner: Option<R>,
    disconnect: DisconnectCheck,
}

impl<R: Read + Send + 'static> FileReader for AdbReader<R> {
    async fn read(&mut self, max: usize) -> Result<Bytes, DeviceError> {
        let mut reader = self.inner.take().ok_or_else(closed_stream)?;
        let (reader, result) = run_blocking(move || {
            let mut buf = vec![0; max];
            let mut filled = 0;
            let result = loop {
                if filled == buf.len() {
                    break Ok(());
                }
                match reader.read(&mut buf[filled..]) {
                    Ok(0) => break Ok(()),
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => break Err(DeviceError::from(TransportError::from(e))),
                }
            };
            buf.truncate(filled);
            Ok((reader, result.map(|()| Bytes::from(buf))))
        })
        .await?;
        self.inner = Some(reader);
        self.disconnect.check(result)
    }

    async fn close(mut self) -> Result<(), DeviceError> {
        drop(self.inner.take());
        Ok(())
    }
}

/// Upload stream of an [`AdbDeviceClient`].
pub struct AdbWriter<W> {
    inner: Option<W>,
    disconnect: DisconnectCheck,
}

impl<W: RemoteSink> FileWriter for AdbWriter<W> {
    async fn write(&mut self, data: Bytes) -> Result<(), DeviceError> {
        let mut writer = self.inner.take().ok_or_else(closed_stream)?;
        let (writer, result) = run_blocking(move || {
            let result = writer
                .write_all(&data)
                .map_err(|e| DeviceError::from(TransportError::from(e)));
            Ok((writer, result))
        })
        .await?;
        self.inner = Some(writer);
        self.disconnect.check(result)
    }

    async fn close(mut self) -> Result<(), DeviceError> {
        let writer = self.inner.take().ok_or_else(closed_stream)?;
        let result = run_blocking(move || writer.close().map_err(DeviceError::from)).await;
        self.disconnect.check(result)
    }
}
