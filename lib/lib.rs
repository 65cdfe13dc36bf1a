//! adb-fs shared library.
//!
//! Serves an Android device's filesystem, reached over the adb sync protocol, as a FUSE mount.

/// Application configuration.
pub mod app_config;
/// Caching primitives for adb-fs.
pub mod cache;
/// Device clients: the transport-backed client and its caching decorator.
pub mod device;
/// Unmounting on device loss.
pub mod disconnect;
/// Filesystem abstractions and the FUSE adapter.
pub mod fs;
/// FUSE mount glue.
pub mod mount;
/// Per-operation structured logging.
pub mod oplog;
/// Device path manipulation.
pub mod paths;
/// Tracing initialization.
pub mod trc;
/// The adb sync wire format.
pub mod wire;
