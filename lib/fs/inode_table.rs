//! Inode number to device path mapping.
//!
//! The kernel addresses files by inode number while the device only understands paths. Numbers are
//! handed out on lookup and reclaimed when the kernel forgets them.
//!
//! Two [`scc::HashMap`]s give lock-free reads in both directions. Mutations that touch both maps
//! are serialized by a coordination lock.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use super::InodeAddr;
use crate::paths;

/// Inode number of the mount root.
pub const ROOT_INO: InodeAddr = 1;

/// Inode number reported for directory entries the kernel has not looked up yet.
pub const UNKNOWN_INO: InodeAddr = 0xffff_ffff;

#[derive(Debug, Clone)]
struct Node {
    path: String,
    lookups: u64,
    /// Unlinked or replaced. The number stays reserved until forgotten but no longer resolves.
    detached: bool,
}

impl Node {
    fn new(path: String) -> Self {
        Self {
            path,
            lookups: 1,
            detached: false,
        }
    }
}

/// Bidirectional inode number and path table.
pub struct InodeTable {
    by_ino: scc::HashMap<InodeAddr, Node>,
    by_path: scc::HashMap<String, InodeAddr>,
    next: AtomicU64,
    /// Serializes mutations that touch both maps.
    mu: Mutex<()>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// A table holding only the root.
    #[must_use]
    pub fn new() -> Self {
        let table = Self {
            by_ino: scc::HashMap::new(),
            by_path: scc::HashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
            mu: Mutex::new(()),
        };
        let _ = table.by_ino.insert_sync(ROOT_INO, Node::new("/".to_owned()));
        let _ = table.by_path.insert_sync("/".to_owned(), ROOT_INO);
        table
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Device path of `ino`. `None` once the inode is forgotten or detached.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<String> {
        self.by_ino
            .read_sync(&ino, |_, node| (!node.detached).then(|| node.path.clone()))
            .flatten()
    }

    fn mark_detached(&self, ino: InodeAddr) {
        let _ = self.by_ino.update_sync(&ino, |_, node| node.detached = true);
        trace!(ino, "detached inode");
    }

    /// Inode number of `path`, if it has one.
    #[must_use]
    pub fn peek(&self, path: &str) -> Option<InodeAddr> {
        self.by_path.read_sync(path, |_, &ino| ino)
    }

    /// Inode number of `path`, allocating one if needed, and count one kernel lookup of it.
    pub fn lookup(&self, path: &str) -> InodeAddr {
        let path = paths::normalize(path);
        let _guard = self.lock();
        match self.by_path.entry_sync(path.clone()) {
            scc::hash_map::Entry::Occupied(occ) => {
                let ino = *occ.get();
                let _ = self.by_ino.update_sync(&ino, |_, node| node.lookups += 1);
                ino
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let ino = self.next.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(ino);
                let _ = self.by_ino.insert_sync(ino, Node::new(path));
                trace!(ino, "allocated inode");
                ino
            }
        }
    }

    /// Drop `nlookup` kernel lookups of `ino`, releasing the number when none remain.
    ///
    /// The root is never released.
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) {
        let _guard = self.lock();
        let released = self
            .by_ino
            .update_sync(&ino, |_, node| {
                node.lookups = node.lookups.saturating_sub(nlookup);
                (node.lookups == 0 && ino != ROOT_INO).then(|| node.path.clone())
            })
            .flatten();

        if let Some(path) = released {
            let _ = self.by_ino.remove_sync(&ino);
            let _ = self.by_path.remove_if_sync(&path, |mapped| *mapped == ino);
            trace!(ino, "released inode");
        }
    }

    /// Stop resolving `path` and its inode in either direction. The number stays allocated until
    /// the kernel forgets it.
    pub fn detach(&self, path: &str) {
        let path = paths::normalize(path);
        let _guard = self.lock();
        if let Some((_, ino)) = self.by_path.remove_sync(&path)
            && ino != ROOT_INO
        {
            self.mark_detached(ino);
        }
    }

    /// Re-key `from` and everything below it to live under `to`.
    pub fn rename(&self, from: &str, to: &str) {
        let from = paths::normalize(from);
        let to = paths::normalize(to);
        let prefix = format!("{from}/");
        let _guard = self.lock();

        if from == to {
            return;
        }
        // Whatever lived at `to` has been replaced.
        if let Some((_, clobbered)) = self.by_path.remove_sync(&to) {
            self.mark_detached(clobbered);
        }
        let mut moved = Vec::new();
        self.by_ino.retain_sync(|&ino, node| {
            if !node.detached && (node.path == from || node.path.starts_with(&prefix)) {
                let new_path = format!("{to}{}", &node.path[from.len()..]);
                let old_path = std::mem::replace(&mut node.path, new_path.clone());
                moved.push((ino, old_path, new_path));
            }
            true
        });

        for (ino, old_path, new_path) in moved {
            let _ = self.by_path.remove_if_sync(&old_path, |mapped| *mapped == ino);
            match self.by_path.entry_sync(new_path) {
                scc::hash_map::Entry::Occupied(mut occ) => *occ.get_mut() = ino,
                scc::hash_map::Entry::Vacant(vac) => {
                    vac.insert_entry(ino);
                }
            }
        }
    }

    /// Number of live inodes, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Always `false`: the root is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}
