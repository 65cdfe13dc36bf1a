//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`AdbFs`].
//!
//! Inode numbers are resolved to device paths synchronously through the [`InodeTable`]. The rest
//! of every request runs as its own task on the tokio runtime, so one slow device round trip does
//! not hold up the FUSE session thread.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, instrument};

use super::inode_table::{InodeTable, UNKNOWN_INO};
use super::{AdbFs, Attr, FileKind, InodeAddr, OpenFlags};
use crate::device::DeviceClient;
use crate::oplog::CALLER_PID;
use crate::paths;

/// Convert an I/O error to the corresponding errno value for FUSE replies.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        _ => libc::EIO,
    })
}

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyCreate,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
);

/// Extension trait on `Result<T, std::io::Error>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, std::io::Error> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
            }
        }
    }
}

fn kind_to_fuser(kind: FileKind) -> fuser::FileType {
    match kind {
        FileKind::RegularFile => fuser::FileType::RegularFile,
        FileKind::Directory => fuser::FileType::Directory,
        FileKind::Symlink => fuser::FileType::Symlink,
        FileKind::CharDevice => fuser::FileType::CharDevice,
        FileKind::BlockDevice => fuser::FileType::BlockDevice,
        FileKind::NamedPipe => fuser::FileType::NamedPipe,
        FileKind::Socket => fuser::FileType::Socket,
    }
}

const BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy)]
struct Owner {
    uid: u32,
    gid: u32,
}

fn attr_to_fuser(ino: InodeAddr, attr: &Attr, owner: Owner) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.mtime,
        mtime: attr.mtime,
        ctime: attr.mtime,
        crtime: attr.mtime,
        kind: kind_to_fuser(attr.kind),
        perm: attr.perm.bits(),
        nlink: if attr.kind == FileKind::Directory { 2 } else { 1 },
        uid: owner.uid,
        gid: owner.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Bridges [`AdbFs`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter<C: DeviceClient> {
    fs: Arc<AdbFs<C>>,
    inodes: Arc<InodeTable>,
    owner: Owner,
    runtime: tokio::runtime::Handle,
}

impl<C: DeviceClient> FuserAdapter<C> {
    // TODO: Raise this once writes and namespace changes notify the kernel through
    // notify_inval_entry/notify_inval_inode instead of relying on a short attribute TTL.
    const SHAMEFUL_TTL: Duration = Duration::from_secs(1);

    /// Serve `fs` through FUSE, running requests on `runtime`.
    pub fn new(fs: AdbFs<C>, runtime: tokio::runtime::Handle) -> Self {
        let owner = Owner {
            uid: fs.options().uid,
            gid: fs.options().gid,
        };
        Self {
            fs: Arc::new(fs),
            inodes: Arc::new(InodeTable::new()),
            owner,
            runtime,
        }
    }

    /// The inode table.
    #[must_use]
    pub fn inodes(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    /// Run `fut` on the runtime with the caller's pid in scope for operation logs.
    fn spawn(&self, req: &fuser::Request<'_>, fut: impl Future<Output = ()> + Send + 'static) {
        self.runtime.spawn(CALLER_PID.scope(req.pid(), fut));
    }

    fn path_of(&self, ino: InodeAddr) -> Result<String, i32> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: InodeAddr, name: &OsStr) -> Result<String, i32> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(paths::join(&parent, name))
    }
}

/// Resolve a path or reply with the errno and return from the callback.
macro_rules! resolve_or_reply {
    ($resolved:expr, $reply:expr) => {
        match $resolved {
            Ok(path) => path,
            Err(errno) => {
                debug!(errno, "could not resolve inode, replying error");
                $reply.error(errno);
                return;
            }
        }
    };
}

impl<C: DeviceClient> fuser::Filesystem for FuserAdapter<C> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, req, reply))]
    fn lookup(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let path = resolve_or_reply!(self.child_path(parent, name), reply);
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let owner = self.owner;
        self.spawn(req, async move {
            fs.getattr(&path).await.fuse_reply(reply, |attr, reply| {
                let ino = inodes.lookup(&path);
                let f_attr = attr_to_fuser(ino, &attr, owner);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::SHAMEFUL_TTL, &f_attr, 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, req, _fh, reply))]
    fn getattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let path = resolve_or_reply!(self.path_of(ino), reply);
        let fs = Arc::clone(&self.fs);
        let owner = self.owner;
        self.spawn(req, async move {
            fs.getattr(&path).await.fuse_reply(reply, |attr, reply| {
                let f_attr = attr_to_fuser(ino, &attr, owner);
                debug!(?f_attr, "replying...");
                reply.attr(&Self::SHAMEFUL_TTL, &f_attr);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(
            self, req, mode, uid, gid, _atime, _mtime, _ctime, _crtime, _chgtime, _bkuptime,
            _flags, reply
        )
    )]
    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        if mode.is_some() || uid.is_some() || gid.is_some() {
            debug!("ownership and mode changes are not supported by the device");
        }
        let path = resolve_or_reply!(self.path_of(ino), reply);
        let fs = Arc::clone(&self.fs);
        let owner = self.owner;
        self.spawn(req, async move {
            let result = async {
                if let Some(size) = size {
                    fs.truncate(&path, fh, size).await?;
                }
                let mut attr = fs.getattr(&path).await?;
                if let Some(size) = size {
                    // An open write handle holds the new size until it is flushed.
                    attr.size = size;
                }
                Ok::<_, std::io::Error>(attr)
            }
            .await;
            result.fuse_reply(reply, |attr, reply| {
                reply.attr(&Self::SHAMEFUL_TTL, &attr_to_fuser(ino, &attr, owner));
            });
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let path = resolve_or_reply!(self.path_of(ino), reply);
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.spawn(req, async move {
            let entries = match fs.readdir(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(io_to_errno(&e));
                    return;
                }
            };

            let parent_ino = inodes.peek(&paths::parent(&path)).unwrap_or(UNKNOWN_INO);
            let dots = [
                (ino, fuser::FileType::Directory, ".".to_owned()),
                (parent_ino, fuser::FileType::Directory, "..".to_owned()),
            ];
            let listed = entries.iter().map(|entry| {
                let child = paths::join(&path, &entry.name);
                let kind = entry.mode.kind().unwrap_or(FileKind::RegularFile);
                (
                    inodes.peek(&child).unwrap_or(UNKNOWN_INO),
                    kind_to_fuser(kind),
                    entry.name.clone(),
                )
            });

            #[expect(
                clippy::cast_possible_truncation,
                reason = "fuser offset is i64 but always non-negative"
            )]
            for (i, (entry_ino, kind, name)) in dots
                .into_iter()
                .chain(listed)
                .enumerate()
                .skip(offset.cast_unsigned() as usize)
            {
                let Ok(idx): Result<i64, _> = (i + 1).try_into() else {
                    error!("Directory entry index {} too large for fuser", i + 1);
                    reply.error(libc::EIO);
                    return;
                };

                debug!(name, ino = entry_ino, "adding entry to reply...");
                if reply.add(entry_ino, idx, kind, &name) {
                    debug!("buffer full for now, stopping readdir");
                    break;
                }
            }

            debug!("finalizing reply...");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, req, flags, reply))]
    fn open(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let path = resolve_or_reply!(self.path_of(ino), reply);
        let fs = Arc::clone(&self.fs);
        let flags = OpenFlags::from_bits_truncate(flags);
        self.spawn(req, async move {
            fs.open(&path, flags).await.fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::create", skip(self, req, mode, umask, _flags, reply))]
    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let path = resolve_or_reply!(self.child_path(parent, name), reply);
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let owner = self.owner;
        self.spawn(req, async move {
            fs.create(&path, mode & !umask)
                .await
                .fuse_reply(reply, |(fh, attr), reply| {
                    let ino = inodes.lookup(&path);
                    debug!(handle = fh, ino, "replying...");
                    reply.created(
                        &Self::SHAMEFUL_TTL,
                        &attr_to_fuser(ino, &attr, owner),
                        0,
                        fh,
                        0,
                    );
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let fs = Arc::clone(&self.fs);
        self.spawn(req, async move {
            fs.read(fh, offset.cast_unsigned(), size)
                .await
                .fuse_reply(reply, |data, reply| {
                    debug!(read_bytes = data.len(), "replying...");
                    reply.data(&data);
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, req, _ino, fh, offset, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let fs = Arc::clone(&self.fs);
        let data = data.to_vec();
        self.spawn(req, async move {
            fs.write(fh, offset.cast_unsigned(), &data)
                .await
                .fuse_reply(reply, |written, reply| {
                    let written = u32::try_from(written).unwrap_or(u32::MAX);
                    debug!(written, "replying...");
                    reply.written(written);
                });
        });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        self.spawn(req, async move {
            fs.flush(fh).await.fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        self.spawn(req, async move {
            fs.release(fh).await.fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, req, reply))]
    fn readlink(&mut self, req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let path = resolve_or_reply!(self.path_of(ino), reply);
        let fs = Arc::clone(&self.fs);
        self.spawn(req, async move {
            fs.readlink(&path).await.fuse_reply(reply, |target, reply| {
                debug!(target = %target.display(), "replying...");
                reply.data(target.as_os_str().as_bytes());
            });
        });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, req, mode, umask, reply))]
    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let path = resolve_or_reply!(self.child_path(parent, name), reply);
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let owner = self.owner;
        self.spawn(req, async move {
            fs.mkdir(&path, mode & !umask)
                .await
                .fuse_reply(reply, |attr, reply| {
                    let ino = inodes.lookup(&path);
                    reply.entry(&Self::SHAMEFUL_TTL, &attr_to_fuser(ino, &attr, owner), 0);
                });
        });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, req, reply))]
    fn unlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let path = resolve_or_reply!(self.child_path(parent, name), reply);
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.spawn(req, async move {
            fs.unlink(&path).await.fuse_reply(reply, |(), reply| {
                inodes.detach(&path);
                reply.ok();
            });
        });
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, req, reply))]
    fn rmdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let path = resolve_or_reply!(self.child_path(parent, name), reply);
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.spawn(req, async move {
            fs.rmdir(&path).await.fuse_reply(reply, |(), reply| {
                inodes.detach(&path);
                reply.ok();
            });
        });
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, req, _flags, reply))]
    fn rename(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let from = resolve_or_reply!(self.child_path(parent, name), reply);
        let to = resolve_or_reply!(self.child_path(newparent, newname), reply);
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.spawn(req, async move {
            fs.rename(&from, &to).await.fuse_reply(reply, |(), reply| {
                inodes.rename(&from, &to);
                reply.ok();
            });
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req, nlookup))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }
}
