//! Mounting the device filesystem with FUSE.
//!
//! fuser only does a regular unmount when a `BackgroundSession` is dropped. We want to be
//! aggressive and force an unmount, since a vanished device leaves a mount that can never serve
//! another request.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fuser::BackgroundSession;
use nix::errno::Errno;
use tracing::{debug, error, info, warn};

use crate::app_config::Config;
use crate::device::adb::{AdbDeviceClient, DeviceTransport};
use crate::device::caching::CachingDeviceClient;
use crate::disconnect::{DisconnectHandler, Unmount};
use crate::fs::fuser::FuserAdapter;
use crate::fs::{AdbFs, FsOptions};

/// A live FUSE mount.
pub struct FuseMount {
    mount_point: PathBuf,
    session: Mutex<Option<BackgroundSession>>,
}

impl FuseMount {
    /// Wrap a running `session` serving `mount_point`.
    #[must_use]
    pub fn new(mount_point: PathBuf, session: BackgroundSession) -> Self {
        Self {
            mount_point,
            session: Mutex::new(Some(session)),
        }
    }

    /// Where the filesystem is mounted.
    #[must_use]
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Detach the mount from the kernel, retrying while it is busy.
    ///
    /// Returns whether the mount point is gone afterwards.
    fn force_unmount(&self) -> bool {
        for attempt in 1..=DETACH_ATTEMPTS {
            match detach_mount(&self.mount_point) {
                Ok(()) => {
                    debug!(
                        mount_point = %self.mount_point.display(),
                        attempt,
                        "detached device mount"
                    );
                    return true;
                }
                // The kernel has already dropped it, e.g. after `fusermount -u`.
                Err(Errno::EINVAL | Errno::ENOENT) => return true,
                Err(Errno::EBUSY) => {
                    debug!(attempt, "device mount busy, retrying detach");
                    std::thread::sleep(DETACH_RETRY_DELAY);
                }
                Err(errno) => {
                    error!(
                        mount_point = %self.mount_point.display(),
                        %errno,
                        "could not detach device mount"
                    );
                    return false;
                }
            }
        }
        warn!(
            mount_point = %self.mount_point.display(),
            attempts = DETACH_ATTEMPTS,
            "device mount still busy, leaving it to the session teardown"
        );
        false
    }
}

const DETACH_ATTEMPTS: u32 = 10;
const DETACH_RETRY_DELAY: Duration = Duration::from_millis(10);

#[cfg(target_os = "linux")]
fn detach_mount(mount_point: &Path) -> nix::Result<()> {
    nix::mount::umount2(mount_point, nix::mount::MntFlags::MNT_DETACH)
}

#[cfg(target_os = "macos")]
fn detach_mount(mount_point: &Path) -> nix::Result<()> {
    nix::mount::unmount(mount_point, nix::mount::MntFlags::MNT_FORCE)
}

impl Unmount for FuseMount {
    fn unmount(&self) {
        let detached = self.force_unmount();
        info!(
            mount_point = %self.mount_point.display(),
            detached,
            "tearing down FUSE session"
        );
        // Joins the session thread, which exits once the kernel has let go of the mount.
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(session);
    }
}

/// Checks that `mount_point` exists and is a directory.
pub fn check_mount_point(mount_point: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(mount_point)?;
    if metadata.is_dir() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            format!("Mount point '{}' is not a directory.", mount_point.display()),
        ))
    }
}

fn mount_options(config: &Config) -> Vec<fuser::MountOption> {
    let mut opts = vec![
        fuser::MountOption::FSName("adb-fs".to_owned()),
        fuser::MountOption::NoDev,
        fuser::MountOption::Exec,
        fuser::MountOption::DefaultPermissions,
    ];
    if config.allow_other {
        opts.push(fuser::MountOption::AllowOther);
    }
    opts
}

/// Mount the device reached through `transport` at `config.mount_point`.
///
/// Returns the handler that unmounts the filesystem, either when the device disconnects or when
/// the caller asks for it.
pub fn mount<T: DeviceTransport>(
    config: &Config,
    transport: T,
    runtime: tokio::runtime::Handle,
) -> std::io::Result<Arc<DisconnectHandler>> {
    check_mount_point(&config.mount_point)?;

    let handler = DisconnectHandler::new();
    let client = AdbDeviceClient::new(transport)
        .with_disconnect_callback(handler.callback(runtime.clone()));
    let client = CachingDeviceClient::new(
        client,
        config.cache.ttl(),
        config.cache.invalidation_delay(),
    );
    let fs = AdbFs::new(
        client,
        FsOptions {
            mount_point: config.mount_point.clone(),
            uid: config.uid,
            gid: config.gid,
        },
    );
    let adapter = FuserAdapter::new(fs, runtime);

    info!(mount_point = %config.mount_point.display(), "mounting device filesystem");
    let session = fuser::spawn_mount2(adapter, &config.mount_point, &mount_options(config))?;
    handler.attach(FuseMount::new(config.mount_point.clone(), session));
    Ok(handler)
}
