//! Time-bounded, singleflight cache for async loads.
//!
//! Each key maps to a slot holding one load: in flight, or finished with its result and the
//! instant it finished. Callers that find a load in flight wait for it instead of starting another.
//! Finished slots answer until their TTL runs out, after which the next caller replaces them.
//! Failed loads are handed to everyone who waited on them and then dropped.
//!
//! Slots carry a generation number so deferred removals can tell whether the slot they were
//! scheduled for is still the one in the map.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use scc::hash_map::Entry;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::trace;

struct Loaded<V, E> {
    result: Result<V, E>,
    loaded_at: Instant,
}

struct Slot<V, E> {
    generation: u64,
    cell: OnceCell<Loaded<V, E>>,
}

impl<V, E> Slot<V, E> {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            cell: OnceCell::new(),
        }
    }

    fn is_fresh(loaded: &Loaded<V, E>, ttl: Duration, now: Instant) -> bool {
        loaded.result.is_ok()
            && loaded
                .loaded_at
                .checked_add(ttl)
                .is_none_or(|expires_at| now < expires_at)
    }

    /// Whether a new caller may join this slot rather than replace it.
    fn is_usable(&self, ttl: Duration, now: Instant) -> bool {
        self.cell
            .get()
            .is_none_or(|loaded| Self::is_fresh(loaded, ttl, now))
    }
}

struct Inner<K, V, E> {
    map: scc::HashMap<K, Arc<Slot<V, E>>>,
    ttl: Duration,
    invalidation_delay: Duration,
    next_generation: AtomicU64,
}

impl<K, V, E> Inner<K, V, E>
where
    K: Eq + Hash,
{
    fn new_slot(&self) -> Arc<Slot<V, E>> {
        Arc::new(Slot::new(
            self.next_generation.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn remove_generation(&self, key: &K, generation: u64) -> bool {
        self.map
            .remove_if_sync(key, |slot| slot.generation == generation)
            .is_some()
    }
}

/// Cache of `K -> Result<V, E>` loads with a fixed TTL.
///
/// Cloning the cache is cheap and yields a handle to the same entries.
pub struct TtlCache<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for TtlCache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a cache whose entries live for `ttl`. A zero TTL disables caching.
    ///
    /// [`remove_eventually`](Self::remove_eventually) waits `invalidation_delay` before removing.
    #[must_use]
    pub fn new(ttl: Duration, invalidation_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                map: scc::HashMap::new(),
                ttl,
                invalidation_delay,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// The configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// The fresh, successfully loaded value for `key`, if there is one.
    ///
    /// Never waits for a load in flight.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let ttl = self.inner.ttl;
        self.inner
            .map
            .read_sync(key, |_, slot| {
                slot.cell
                    .get()
                    .filter(|loaded| Slot::is_fresh(loaded, ttl, now))
                    .and_then(|loaded| loaded.result.as_ref().ok().cloned())
            })
            .flatten()
    }

    /// The value for `key`, loading it with `loader` when there is no fresh one.
    ///
    /// Concurrent callers for the same key share a single call to `loader` and all observe its
    /// result. The second element of the returned pair is `false` for the caller whose loader ran
    /// and `true` for everyone else.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> (Result<V, E>, bool)
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if self.inner.ttl.is_zero() {
            return (loader(key).await, false);
        }

        let slot = self.claim(&key).await;

        let mut loaded_here = false;
        let flag = &mut loaded_here;
        let load_key = key.clone();
        let loaded = slot
            .cell
            .get_or_init(move || async move {
                *flag = true;
                let result = loader(load_key).await;
                Loaded {
                    result,
                    loaded_at: Instant::now(),
                }
            })
            .await;
        let result = loaded.result.clone();

        if loaded_here && result.is_err() {
            self.inner.remove_generation(&key, slot.generation);
        }

        (result, !loaded_here)
    }

    /// The slot a caller should wait on: the current one if it is in flight or fresh, otherwise a
    /// new one replacing it.
    async fn claim(&self, key: &K) -> Arc<Slot<V, E>> {
        let ttl = self.inner.ttl;

        if let Some(slot) = self.inner.map.read_async(key, |_, slot| Arc::clone(slot)).await
            && slot.is_usable(ttl, Instant::now())
        {
            return slot;
        }

        match self.inner.map.entry_async(key.clone()).await {
            Entry::Occupied(mut occ) => {
                if occ.get().is_usable(ttl, Instant::now()) {
                    return Arc::clone(occ.get());
                }
                let slot = self.inner.new_slot();
                trace!(generation = slot.generation, "replacing stale slot");
                *occ.get_mut() = Arc::clone(&slot);
                slot
            }
            Entry::Vacant(vac) => {
                let slot = self.inner.new_slot();
                vac.insert_entry(Arc::clone(&slot));
                slot
            }
        }
    }

    /// Remove `key` now.
    pub fn remove(&self, key: &K) {
        drop(self.inner.map.remove_sync(key));
    }

    /// Remove the slot currently stored under `key` once the invalidation delay has passed.
    ///
    /// If the key is reloaded in the meantime, the newer slot is left alone. Removal happens
    /// immediately when the delay is zero or when there is no runtime to schedule it on.
    pub fn remove_eventually(&self, key: &K) {
        let Some(generation) = self.inner.map.read_sync(key, |_, slot| slot.generation) else {
            return;
        };

        let delay = self.inner.invalidation_delay;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !delay.is_zero() => {
                let inner = Arc::clone(&self.inner);
                let key = key.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if inner.remove_generation(&key, generation) {
                        trace!(generation, "deferred removal fired");
                    }
                });
            }
            Ok(_) | Err(_) => {
                self.inner.remove_generation(key, generation);
            }
        }
    }

    /// Whether any slot, fresh or not, is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.map.read_sync(key, |_, _| ()).is_some()
    }

    /// Number of stored slots, including stale ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    /// Whether no slots are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }
}
