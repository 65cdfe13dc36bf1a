#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::{Duration, SystemTime};

use bytes::Bytes;

use adb_fs::device::caching::CachingDeviceClient;
use adb_fs::device::{DeviceClient as _, DeviceError, FileWriter as _};
use adb_fs::fs::FileMode;
use adb_fs::wire::{TransportError, TransportErrorKind};

use common::device_mocks::MockDevice;
use common::test_log;

const TTL: Duration = Duration::from_secs(60);

fn device() -> MockDevice {
    MockDevice::new()
        .with_dir("/d")
        .with_file("/d/a", b"alpha")
        .with_file("/d/b", b"bravo")
}

#[tokio::test(start_paused = true)]
async fn root_stat_bypasses_cache() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::ZERO);

    let root_listing = client.list("/", &test_log("OpenDir")).await.unwrap();
    assert_eq!(root_listing.len(), 1);
    assert!(client.cache().contains(&"/".to_owned()));

    for expected_stats in 1..=2 {
        let log = test_log("GetAttr");
        let root = client.stat("/", &log).await.unwrap();
        assert!(root.mode.is_dir(), "the root's own entry, not a lookup in its listing");
        assert_eq!(log.cache_hit(), None, "root never consults the cache");
        assert_eq!(device.calls().stat(), expected_stats, "root stat reaches the device");
    }
    assert_eq!(device.calls().list(), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_listing_answers_stats_without_remote_calls() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::ZERO);

    let log = test_log("OpenDir");
    let listing = client.list("/d", &log).await.unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!(log.cache_hit(), Some(false));

    let log = test_log("GetAttr");
    let a = client.stat("/d/a", &log).await.unwrap();
    assert_eq!(a.name, "a");
    assert_eq!(a.size, 5);
    assert_eq!(log.cache_hit(), Some(true));

    let log = test_log("GetAttr");
    let err = client.stat("/d/c", &log).await.unwrap_err();
    assert_eq!(
        err,
        DeviceError::NotInListing {
            name: "/d/c".to_owned()
        }
    );
    assert_eq!(err.errno(), libc::ENOENT);
    assert_eq!(log.cache_hit(), Some(true));

    assert_eq!(device.calls().stat(), 0, "no remote stat for cached parents");
    assert_eq!(device.calls().list(), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_absence_holds_until_expiry() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::ZERO);
    client.list("/d", &test_log("OpenDir")).await.unwrap();

    // Created behind the cache's back.
    device.insert("/d/c", common::device_mocks::MockNode::file(b"new"));
    assert!(client.stat("/d/c", &test_log("GetAttr")).await.is_err());

    tokio::time::advance(TTL).await;
    let log = test_log("GetAttr");
    let c = client.stat("/d/c", &log).await.unwrap();
    assert_eq!(c.size, 3);
    assert_eq!(log.cache_hit(), Some(false));
    assert_eq!(device.calls().stat(), 1);
}

#[tokio::test(start_paused = true)]
async fn uncached_parent_falls_through() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::ZERO);

    let log = test_log("GetAttr");
    let b = client.stat("/d/b", &log).await.unwrap();
    assert_eq!(b.size, 5);
    assert_eq!(log.cache_hit(), Some(false));
    assert_eq!(device.calls().stat(), 1);

    let log = test_log("GetAttr");
    let err = client.stat("/d/zzz", &log).await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[tokio::test(start_paused = true)]
async fn second_list_is_a_hit() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::ZERO);
    client.list("/d", &test_log("OpenDir")).await.unwrap();

    let log = test_log("OpenDir");
    let listing = client.list("/d/", &log).await.unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!(log.cache_hit(), Some(true), "path is normalized before lookup");
    assert_eq!(device.calls().list(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_list_is_not_cached() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::ZERO);
    device.fail_lists_with(Some(
        TransportError::new(TransportErrorKind::ConnectionReset, "reset").into(),
    ));

    let err = client.list("/d", &test_log("OpenDir")).await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert!(client.cache().is_empty());

    device.fail_lists_with(None);
    assert_eq!(client.list("/d", &test_log("OpenDir")).await.unwrap().len(), 2);
    assert_eq!(device.calls().list(), 2);
}

#[tokio::test(start_paused = true)]
async fn closing_a_writer_invalidates_parent_listing() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::ZERO);
    client.list("/d", &test_log("OpenDir")).await.unwrap();

    let log = test_log("Write");
    let mut writer = client
        .open_write("/d/f", FileMode::regular(0o600), SystemTime::now(), &log)
        .await
        .unwrap();
    writer.write(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(
        client.list("/d", &test_log("OpenDir")).await.unwrap().len(),
        2,
        "open writers do not invalidate"
    );
    writer.close().await.unwrap();

    let log = test_log("OpenDir");
    let listing = client.list("/d", &log).await.unwrap();
    assert_eq!(log.cache_hit(), Some(false), "listing reloads after close");
    assert!(listing.iter().any(|e| e.name == "f"));
    assert_eq!(device.calls().list(), 2);
}

#[tokio::test(start_paused = true)]
async fn write_invalidation_honors_delay() {
    let delay = Duration::from_millis(100);
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, delay);
    client.list("/d", &test_log("OpenDir")).await.unwrap();

    let writer = client
        .open_write(
            "/d/f",
            FileMode::regular(0o600),
            SystemTime::now(),
            &test_log("Write"),
        )
        .await
        .unwrap();
    writer.close().await.unwrap();

    let log = test_log("OpenDir");
    client.list("/d", &log).await.unwrap();
    assert_eq!(log.cache_hit(), Some(true), "still cached inside the delay");

    tokio::time::sleep(delay + Duration::from_millis(1)).await;
    let log = test_log("OpenDir");
    let listing = client.list("/d", &log).await.unwrap();
    assert_eq!(log.cache_hit(), Some(false));
    assert_eq!(listing.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn invalidate_drops_listing_now() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), TTL, Duration::from_secs(1));
    client.list("/d", &test_log("OpenDir")).await.unwrap();

    client.invalidate("/d/");
    assert!(!client.cache().contains(&"/d".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn zero_ttl_disables_caching() {
    let device = device();
    let client = CachingDeviceClient::new(device.clone(), Duration::ZERO, Duration::ZERO);
    client.list("/d", &test_log("OpenDir")).await.unwrap();

    let log = test_log("GetAttr");
    client.stat("/d/a", &log).await.unwrap();
    assert_eq!(log.cache_hit(), Some(false));
    assert_eq!(device.calls().stat(), 1);
    assert!(client.cache().is_empty());
}
