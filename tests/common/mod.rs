#![allow(dead_code, missing_docs, clippy::unwrap_used)]

pub mod device_mocks;
pub mod transport_mocks;

use std::path::PathBuf;
use std::time::Duration;

use adb_fs::device::caching::CachingDeviceClient;
use adb_fs::fs::{AdbFs, FsOptions};
use adb_fs::oplog::OperationLog;

use device_mocks::MockDevice;

/// Mount point used by filesystems built in tests. Nothing is mounted there.
pub const MOUNT_POINT: &str = "/mnt/phone";

pub fn fs_options() -> FsOptions {
    FsOptions {
        mount_point: PathBuf::from(MOUNT_POINT),
        uid: 1000,
        gid: 1000,
    }
}

/// A filesystem straight over `device`, without a listing cache.
pub fn uncached_fs(device: &MockDevice) -> AdbFs<MockDevice> {
    AdbFs::new(device.clone(), fs_options())
}

/// A filesystem over `device` with a listing cache.
pub fn cached_fs(
    device: &MockDevice,
    ttl: Duration,
    invalidation_delay: Duration,
) -> AdbFs<CachingDeviceClient<MockDevice>> {
    AdbFs::new(
        CachingDeviceClient::new(device.clone(), ttl, invalidation_delay),
        fs_options(),
    )
}

/// An operation log for calling device clients directly.
pub fn test_log(name: &str) -> OperationLog {
    OperationLog::start(name, "/")
}
