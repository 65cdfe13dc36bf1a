//! [`DeviceClient`] decorator that caches directory listings.
//!
//! Listings are the only thing cached. A stat of `/d/f` is answered from the cached listing of
//! `/d` when there is one, which is what makes `ls -l` cost one round trip instead of one per
//! entry.
//!
//! A name missing from a fresh cached listing is reported as nonexistent without asking the device.
//! Changes made by other programs on the device are therefore invisible until the listing expires.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::{DeviceClient, DeviceError, FileWriter, Listing};
use crate::cache::TtlCache;
use crate::fs::FileMode;
use crate::oplog::OperationLog;
use crate::paths;
use crate::wire::DirEntry;

/// A directory listing indexed by entry name.
#[derive(Debug)]
pub struct CachedDirListing {
    entries: Listing,
    by_name: FxHashMap<String, usize>,
}

impl CachedDirListing {
    /// Index `entries`. When a name appears more than once, the first entry wins.
    #[must_use]
    pub fn new(entries: Listing) -> Self {
        let mut by_name = FxHashMap::default();
        by_name.reserve(entries.len());
        let mut duplicates = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            if by_name.contains_key(&entry.name) {
                duplicates.push(idx);
            } else {
                by_name.insert(entry.name.clone(), idx);
            }
        }

        if duplicates.is_empty() {
            return Self { entries, by_name };
        }

        warn!(
            duplicates = duplicates.len(),
            "device listing repeats names, keeping first occurrence"
        );
        let kept: Vec<DirEntry> = entries
            .iter()
            .enumerate()
            .filter(|(idx, _)| !duplicates.contains(idx))
            .map(|(_, entry)| entry.clone())
            .collect();
        let by_name = kept
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.name.clone(), idx))
            .collect();
        Self {
            entries: kept.into(),
            by_name,
        }
    }

    /// The entries, in device order.
    #[must_use]
    pub fn entries(&self) -> &Listing {
        &self.entries
    }

    /// The entry called `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache of directory listings, keyed by normalized directory path.
pub type DirEntryCache = TtlCache<String, Arc<CachedDirListing>, DeviceError>;

/// Wraps a [`DeviceClient`] with a [`DirEntryCache`].
pub struct CachingDeviceClient<C> {
    inner: C,
    cache: DirEntryCache,
}

impl<C: DeviceClient> CachingDeviceClient<C> {
    /// Cache listings from `inner` for `ttl`, deferring write invalidations by
    /// `invalidation_delay`.
    pub fn new(inner: C, ttl: Duration, invalidation_delay: Duration) -> Self {
        Self::with_cache(inner, DirEntryCache::new(ttl, invalidation_delay))
    }

    /// Wrap `inner` with an existing cache.
    pub fn with_cache(inner: C, cache: DirEntryCache) -> Self {
        Self { inner, cache }
    }

    /// The listing cache.
    #[must_use]
    pub fn cache(&self) -> &DirEntryCache {
        &self.cache
    }

    /// The wrapped client.
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: DeviceClient> DeviceClient for CachingDeviceClient<C> {
    type Reader = C::Reader;
    type Writer = InvalidatingWriter<C::Writer>;

    async fn open_read(&self, path: &str, log: &OperationLog) -> Result<Self::Reader, DeviceError> {
        self.inner.open_read(path, log).await
    }

    async fn open_write(
        &self,
        path: &str,
        mode: FileMode,
        mtime: SystemTime,
        log: &OperationLog,
    ) -> Result<Self::Writer, DeviceError> {
        let inner = self.inner.open_write(path, mode, mtime, log).await?;
        Ok(InvalidatingWriter {
            inner,
            cache: self.cache.clone(),
            dir: paths::parent(path),
        })
    }

    async fn stat(&self, path: &str, log: &OperationLog) -> Result<DirEntry, DeviceError> {
        let path = paths::normalize(path);
        let (dir, name) = paths::split(&path);
        if dir == path {
            return self.inner.stat(&path, log).await;
        }

        match self.cache.get(&dir) {
            Some(listing) => {
                log.cache_used(true);
                listing
                    .get(&name)
                    .cloned()
                    .ok_or(DeviceError::NotInListing { name: path })
            }
            None => {
                log.cache_used(false);
                self.inner.stat(&path, log).await
            }
        }
    }

    async fn list(&self, path: &str, log: &OperationLog) -> Result<Listing, DeviceError> {
        let path = paths::normalize(path);
        let inner = &self.inner;
        let (result, hit) = self
            .cache
            .get_or_load(path, |path| async move {
                let entries = inner.list(&path, log).await?;
                Ok::<_, DeviceError>(Arc::new(CachedDirListing::new(entries)))
            })
            .await;
        log.cache_used(hit);
        result.map(|listing| Arc::clone(listing.entries()))
    }

    async fn run_command(
        &self,
        cmd: &str,
        args: &[&str],
        log: &OperationLog,
    ) -> Result<String, DeviceError> {
        self.inner.run_command(cmd, args, log).await
    }

    fn invalidate(&self, dir: &str) {
        let dir = paths::normalize(dir);
        debug!(dir = %dir, "invalidating cached listing");
        self.cache.remove(&dir);
        self.inner.invalidate(&dir);
    }
}

/// Writer that schedules removal of its parent directory's listing once it closes.
pub struct InvalidatingWriter<W> {
    inner: W,
    cache: DirEntryCache,
    dir: String,
}

impl<W: FileWriter> FileWriter for InvalidatingWriter<W> {
    async fn write(&mut self, data: Bytes) -> Result<(), DeviceError> {
        self.inner.write(data).await
    }

    async fn close(self) -> Result<(), DeviceError> {
        let result = self.inner.close().await;
        self.cache.remove_eventually(&self.dir);
        result
    }
}
