#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use adb_fs::device::{DeviceClient, DeviceError, FileReader, FileWriter, Listing};
use adb_fs::fs::FileMode;
use adb_fs::oplog::OperationLog;
use adb_fs::paths;
use adb_fs::wire::{DirEntry, TransportError, TransportErrorKind};

/// A node stored by `MockDevice`.
#[derive(Debug, Clone)]
pub struct MockNode {
    pub mode: FileMode,
    pub contents: Vec<u8>,
    pub mtime: SystemTime,
}

impl MockNode {
    pub fn file(contents: &[u8]) -> Self {
        Self {
            mode: FileMode::regular(0o644),
            contents: contents.to_vec(),
            mtime: UNIX_EPOCH,
        }
    }

    pub fn dir() -> Self {
        Self {
            mode: FileMode::directory(0o755),
            contents: Vec::new(),
            mtime: UNIX_EPOCH,
        }
    }

    fn entry(&self, name: &str) -> DirEntry {
        DirEntry {
            name: name.to_owned(),
            mode: self.mode,
            size: i32::try_from(self.contents.len()).unwrap(),
            modified_at: self.mtime,
        }
    }
}

/// Call counters of `MockDevice`.
#[derive(Debug, Default)]
pub struct Calls {
    pub stat: AtomicUsize,
    pub list: AtomicUsize,
    pub open_read: AtomicUsize,
    pub open_write: AtomicUsize,
    pub reader_closed: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
}

impl Calls {
    pub fn stat(&self) -> usize {
        self.stat.load(Ordering::SeqCst)
    }

    pub fn list(&self) -> usize {
        self.list.load(Ordering::SeqCst)
    }

    pub fn open_read(&self) -> usize {
        self.open_read.load(Ordering::SeqCst)
    }

    pub fn open_write(&self) -> usize {
        self.open_write.load(Ordering::SeqCst)
    }

    pub fn reader_closed(&self) -> usize {
        self.reader_closed.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub nodes: Mutex<BTreeMap<String, MockNode>>,
    pub links: Mutex<BTreeMap<String, String>>,
    pub calls: Calls,
    /// Every `list` sleeps this long before answering.
    pub list_delay: Mutex<Duration>,
    /// When set, every `list` fails with this error.
    pub list_failure: Mutex<Option<DeviceError>>,
}

/// An in-memory device. Clones share state.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub state: Arc<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A device holding only the root directory.
    pub fn new() -> Self {
        let device = Self {
            state: Arc::new(MockState::default()),
        };
        device.insert("/", MockNode::dir());
        device
    }

    pub fn insert(&self, path: &str, node: MockNode) {
        self.state
            .nodes
            .lock()
            .unwrap()
            .insert(paths::normalize(path), node);
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.insert(path, MockNode::file(contents));
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.insert(path, MockNode::dir());
        self
    }

    pub fn with_link(self, path: &str, target: &str) -> Self {
        self.state
            .links
            .lock()
            .unwrap()
            .insert(path.to_owned(), target.to_owned());
        self
    }

    pub fn node(&self, path: &str) -> Option<MockNode> {
        self.state.nodes.lock().unwrap().get(path).cloned()
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.node(path).map(|n| n.contents)
    }

    pub fn calls(&self) -> &Calls {
        &self.state.calls
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.state.list_delay.lock().unwrap() = delay;
    }

    pub fn fail_lists_with(&self, error: Option<DeviceError>) {
        *self.state.list_failure.lock().unwrap() = error;
    }

    fn no_such_file(path: &str) -> DeviceError {
        TransportError::new(TransportErrorKind::FileNoExist, format!("{path}: no such file")).into()
    }

    fn exec(&self, cmd: &str, args: &[&str]) -> String {
        let mut nodes = self.state.nodes.lock().unwrap();
        match (cmd, args) {
            ("mkdir", ["-m", mode, path]) => {
                if nodes.contains_key(*path) {
                    return format!("mkdir: '{path}': File exists");
                }
                let perm = u32::from_str_radix(mode, 8).unwrap();
                nodes.insert((*path).to_owned(), MockNode {
                    mode: FileMode::directory(perm),
                    contents: Vec::new(),
                    mtime: UNIX_EPOCH,
                });
                String::new()
            }
            ("rm", [path]) => match nodes.get(*path).map(|n| n.mode.is_dir()) {
                None => format!("rm: {path}: No such file or directory"),
                Some(true) => format!("rm: {path}: Is a directory"),
                Some(false) => {
                    nodes.remove(*path);
                    String::new()
                }
            },
            ("rmdir", [path]) => {
                let prefix = format!("{path}/");
                if !nodes.contains_key(*path) {
                    format!("rmdir: '{path}': No such file or directory")
                } else if nodes.keys().any(|k| k.starts_with(&prefix)) {
                    format!("rmdir: '{path}': Directory not empty")
                } else {
                    nodes.remove(*path);
                    String::new()
                }
            }
            ("mv", [from, to]) => match nodes.remove(*from) {
                None => format!("mv: bad '{from}': No such file or directory"),
                Some(node) => {
                    nodes.insert((*to).to_owned(), node);
                    String::new()
                }
            },
            ("readlink", [path]) => {
                let exists = nodes.contains_key(*path);
                drop(nodes);
                match self.state.links.lock().unwrap().get(*path) {
                    Some(target) => format!("{target}\n"),
                    None if exists => "readlink: Invalid argument".to_owned(),
                    None => format!("readlink: {path}: No such file or directory"),
                }
            }
            _ => format!("{cmd}: not found"),
        }
    }
}

impl DeviceClient for MockDevice {
    type Reader = MockReader;
    type Writer = MockWriter;

    async fn open_read(&self, path: &str, _log: &OperationLog) -> Result<MockReader, DeviceError> {
        self.state.calls.open_read.fetch_add(1, Ordering::SeqCst);
        let node = self.node(path).ok_or_else(|| Self::no_such_file(path))?;
        Ok(MockReader {
            data: Bytes::from(node.contents),
            pos: 0,
            state: Arc::clone(&self.state),
        })
    }

    async fn open_write(
        &self,
        path: &str,
        mode: FileMode,
        mtime: SystemTime,
        _log: &OperationLog,
    ) -> Result<MockWriter, DeviceError> {
        self.state.calls.open_write.fetch_add(1, Ordering::SeqCst);
        Ok(MockWriter {
            device: self.clone(),
            path: paths::normalize(path),
            mode,
            mtime,
            buffer: Vec::new(),
        })
    }

    async fn stat(&self, path: &str, _log: &OperationLog) -> Result<DirEntry, DeviceError> {
        self.state.calls.stat.fetch_add(1, Ordering::SeqCst);
        let path = paths::normalize(path);
        let node = self.node(&path).ok_or_else(|| Self::no_such_file(&path))?;
        Ok(node.entry(&paths::base(&path)))
    }

    async fn list(&self, path: &str, _log: &OperationLog) -> Result<Listing, DeviceError> {
        self.state.calls.list.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.state.list_failure.lock().unwrap().clone() {
            return Err(e);
        }

        let dir = paths::normalize(path);
        let nodes = self.state.nodes.lock().unwrap();
        if !nodes.contains_key(&dir) {
            return Err(Self::no_such_file(&dir));
        }
        let entries: Vec<DirEntry> = nodes
            .iter()
            .filter(|(p, _)| p.as_str() != dir && paths::parent(p) == dir)
            .map(|(p, node)| node.entry(&paths::base(p)))
            .collect();
        Ok(entries.into())
    }

    async fn run_command(
        &self,
        cmd: &str,
        args: &[&str],
        _log: &OperationLog,
    ) -> Result<String, DeviceError> {
        self.state
            .calls
            .commands
            .lock()
            .unwrap()
            .push(std::iter::once(cmd).chain(args.iter().copied()).collect::<Vec<_>>().join(" "));
        Ok(self.exec(cmd, args))
    }
}

/// Streams a snapshot of a file taken at open time.
pub struct MockReader {
    data: Bytes,
    pos: usize,
    state: Arc<MockState>,
}

impl FileReader for MockReader {
    async fn read(&mut self, max: usize) -> Result<Bytes, DeviceError> {
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(chunk)
    }

    async fn close(self) -> Result<(), DeviceError> {
        self.state.calls.reader_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Buffers an upload and commits it, with its mode and mtime, on close.
pub struct MockWriter {
    device: MockDevice,
    path: String,
    mode: FileMode,
    mtime: SystemTime,
    buffer: Vec<u8>,
}

impl FileWriter for MockWriter {
    async fn write(&mut self, data: Bytes) -> Result<(), DeviceError> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn close(self) -> Result<(), DeviceError> {
        self.device.insert(&self.path, MockNode {
            mode: self.mode,
            contents: self.buffer,
            mtime: self.mtime,
        });
        Ok(())
    }
}
