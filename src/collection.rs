use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock, duration_millis};
use crate::error::{BoxError, CacheError, ConfigError};

/// Result of one batch fetch. Keys absent from the returned map are treated
/// as best-effort misses, not as an error.
pub type FetchResult<K, V> = Result<HashMap<K, V>, BoxError>;

type FetchFn<K, V> = Arc<dyn Fn(HashSet<K>) -> BoxFuture<'static, FetchResult<K, V>> + Send + Sync>;
type KeyGuard<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<(), CacheError>>>;
type StateHandle<K, V> = Arc<Mutex<CollectionState<K, V>>>;

struct CollectionEntry<V> {
    value: V,
    last_access: u64,
}

/// One registered batch fetch. Several keys reference the same batch through
/// the in-flight index; until the batch launches it can still take on the
/// missing keys of overlapping concurrent requests.
struct BatchFetch<K> {
    keys: HashSet<K>,
    launched: bool,
    shared: SharedFetch,
}

struct CollectionState<K, V> {
    entries: HashMap<K, CollectionEntry<V>>,
    in_flight: HashMap<K, u64>,
    fetches: HashMap<u64, BatchFetch<K>>,
    next_fetch_id: u64,
    purge_task: Option<JoinHandle<()>>,
}

/// Cached collection of same-typed values, fetched in batches.
///
/// [`get_data`](CachedCollection::get_data) serves cached entries directly
/// and fetches the rest through the batch fetch function, coalescing
/// overlapping concurrent requests into a single underlying fetch. Entries
/// expire a TTL after their last access and are removed by an instance-owned
/// purge task that runs only while the collection holds data.
pub struct CachedCollection<K, V> {
    fetch: FetchFn<K, V>,
    ttl: Duration,
    purge_interval: Duration,
    key_guard: Option<KeyGuard<K>>,
    clock: Arc<dyn Clock>,
    state: StateHandle<K, V>,
}

impl<K, V> CachedCollection<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new collection around the given batch fetch function and
    /// TTL. The purge interval defaults to the TTL.
    ///
    /// Fails if the TTL is shorter than one millisecond.
    pub fn new<F, Fut>(fetch: F, ttl: Duration) -> Result<Self, ConfigError>
    where
        F: Fn(HashSet<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<K, V>> + Send + 'static,
    {
        if duration_millis(ttl) == 0 {
            return Err(ConfigError::InvalidTtl(ttl));
        }
        Ok(Self {
            fetch: Arc::new(move |keys| fetch(keys).boxed()),
            ttl,
            purge_interval: ttl,
            key_guard: None,
            clock: Arc::new(SystemClock),
            state: Arc::new(Mutex::new(CollectionState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                fetches: HashMap::new(),
                next_fetch_id: 0,
                purge_task: None,
            })),
        })
    }

    /// Installs a predicate that every requested key must pass before any
    /// fetch is attempted.
    pub fn with_key_guard<G>(mut self, guard: G) -> Self
    where
        G: Fn(&K) -> bool + Send + Sync + 'static,
    {
        self.key_guard = Some(Arc::new(guard));
        self
    }

    /// Decouples the purge-sweep interval from the TTL.
    pub fn with_purge_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if duration_millis(interval) == 0 {
            return Err(ConfigError::InvalidPurgeInterval(interval));
        }
        self.purge_interval = interval;
        Ok(self)
    }

    /// Replaces the wall clock, mostly to make freshness deterministic in
    /// tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the values for the requested keys, fetching the ones that are
    /// neither cached nor already being fetched.
    ///
    /// Keys the batch fetch function does not return are silently omitted
    /// from the response. Cached entries have their last-access time
    /// refreshed.
    pub async fn get_data(&self, keys: &HashSet<K>) -> Result<HashMap<K, V>, CacheError> {
        let mut response = HashMap::new();
        if keys.is_empty() {
            return Ok(response);
        }
        // Validation precedes every side effect; a rejected key fails the
        // whole call without touching cache or in-flight state.
        if let Some(guard) = &self.key_guard {
            let rejected: Vec<&K> = keys.iter().filter(|key| !guard(key)).collect();
            if !rejected.is_empty() {
                return Err(CacheError::InvalidKeys(format!("{rejected:?}")));
            }
        }

        let waits: Vec<SharedFetch> = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let mut wait_ids = HashSet::new();
            let mut to_fetch = HashSet::new();

            for key in keys {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.last_access = now;
                    response.insert(key.clone(), entry.value.clone());
                } else if let Some(id) = state.in_flight.get(key) {
                    wait_ids.insert(*id);
                } else {
                    to_fetch.insert(key.clone());
                }
            }

            if !to_fetch.is_empty() {
                let id = self.enqueue_fetch(&mut state, &wait_ids, to_fetch);
                wait_ids.insert(id);
            }

            wait_ids
                .iter()
                .filter_map(|id| state.fetches.get(id))
                .map(|fetch| fetch.shared.clone())
                .collect()
        };

        for fetch in waits {
            fetch.await?;
        }

        if response.len() < keys.len() {
            let state = self.state.lock();
            for key in keys {
                if response.contains_key(key) {
                    continue;
                }
                match state.entries.get(key) {
                    Some(entry) => {
                        response.insert(key.clone(), entry.value.clone());
                    }
                    None => tracing::debug!(?key, "batch fetch returned no value for key"),
                }
            }
        }

        sync_purge_task(
            &self.state,
            self.purge_interval,
            duration_millis(self.ttl),
            &self.clock,
        );

        Ok(response)
    }

    /// Removes the given keys immediately, regardless of freshness, and
    /// returns how many were actually present. Absent keys are a no-op.
    pub fn delete<I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
    {
        let removed = {
            let mut state = self.state.lock();
            keys.into_iter()
                .filter(|key| state.entries.remove(key).is_some())
                .count()
        };
        if removed > 0 {
            sync_purge_task(
                &self.state,
                self.purge_interval,
                duration_millis(self.ttl),
                &self.clock,
            );
        }
        removed
    }

    /// Removes every entry whose last access is more than a TTL ago and
    /// returns how many were removed. Invoked by the background purge task
    /// once per purge interval.
    pub fn purge(&self) -> usize {
        let removed = purge_expired(&self.state, duration_millis(self.ttl), &self.clock);
        if removed > 0 {
            sync_purge_task(
                &self.state,
                self.purge_interval,
                duration_millis(self.ttl),
                &self.clock,
            );
        }
        removed
    }

    /// Number of cached entries.
    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Number of distinct keys currently referenced by an in-flight fetch.
    pub fn entries_in_progress(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Merges the missing keys into a not-yet-launched batch the caller
    /// already waits on, or registers a fresh batch for them. Registration
    /// happens before any suspension, so concurrent callers observe the
    /// fetch through the in-flight index before it runs.
    fn enqueue_fetch(
        &self,
        state: &mut CollectionState<K, V>,
        waiting: &HashSet<u64>,
        to_fetch: HashSet<K>,
    ) -> u64 {
        let open_batch = waiting
            .iter()
            .copied()
            .find(|id| state.fetches.get(id).is_some_and(|fetch| !fetch.launched));
        if let Some(id) = open_batch {
            if let Some(fetch) = state.fetches.get_mut(&id) {
                fetch.keys.extend(to_fetch.iter().cloned());
            }
            for key in to_fetch {
                state.in_flight.insert(key, id);
            }
            return id;
        }

        let id = state.next_fetch_id;
        state.next_fetch_id += 1;
        let shared = self.drive_fetch(id);
        for key in &to_fetch {
            state.in_flight.insert(key.clone(), id);
        }
        state.fetches.insert(
            id,
            BatchFetch {
                keys: to_fetch,
                launched: false,
                shared: shared.clone(),
            },
        );
        // Runs to completion and commits even if every requester abandons
        // interest.
        tokio::spawn(shared);
        id
    }

    /// Builds the shared future that runs batch fetch `id`: launch, commit
    /// the returned pairs, clear in-flight state on success and failure
    /// alike.
    fn drive_fetch(&self, id: u64) -> SharedFetch {
        let fetch_fn = Arc::clone(&self.fetch);
        let clock = Arc::clone(&self.clock);
        let slot = Arc::clone(&self.state);
        let ttl = duration_millis(self.ttl);
        let interval = self.purge_interval;

        async move {
            // One scheduling turn during which concurrent callers can still
            // merge their missing keys into this batch.
            tokio::task::yield_now().await;

            let batch = {
                let mut state = slot.lock();
                match state.fetches.get_mut(&id) {
                    Some(fetch) => {
                        fetch.launched = true;
                        fetch.keys.clone()
                    }
                    None => return Ok(()),
                }
            };

            let result = fetch_fn(batch.clone()).await;

            let outcome = {
                let mut state = slot.lock();
                for key in &batch {
                    state.in_flight.remove(key);
                }
                state.fetches.remove(&id);
                match result {
                    Ok(values) => {
                        let now = clock.now();
                        for (key, value) in values {
                            state.entries.insert(
                                key,
                                CollectionEntry {
                                    value,
                                    last_access: now,
                                },
                            );
                        }
                        Ok(())
                    }
                    Err(err) => Err(CacheError::fetch(err)),
                }
            };

            sync_purge_task(&slot, interval, ttl, &clock);
            outcome
        }
        .boxed()
        .shared()
    }
}

impl<K, V> Drop for CachedCollection<K, V> {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().purge_task.take() {
            task.abort();
        }
    }
}

fn purge_expired<K, V>(slot: &StateHandle<K, V>, ttl: u64, clock: &Arc<dyn Clock>) -> usize
where
    K: Eq + Hash,
{
    let now = clock.now();
    let mut state = slot.lock();
    let before = state.entries.len();
    state
        .entries
        .retain(|_, entry| entry.last_access.saturating_add(ttl) >= now);
    before - state.entries.len()
}

/// Keeps the purge task running iff the collection holds entries. Called
/// after every operation that inserts or removes.
fn sync_purge_task<K, V>(
    slot: &StateHandle<K, V>,
    interval: Duration,
    ttl: u64,
    clock: &Arc<dyn Clock>,
) where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    let mut state = slot.lock();
    if state.entries.is_empty() {
        if let Some(task) = state.purge_task.take() {
            task.abort();
        }
    } else if state.purge_task.is_none() {
        // Removal-only paths can run outside a runtime; the map can only
        // have become non-empty from inside one, where the task starts.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let slot = Arc::clone(slot);
            let clock = Arc::clone(clock);
            state.purge_task = Some(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let removed = purge_expired(&slot, ttl, &clock);
                    if removed > 0 {
                        tracing::trace!(removed, "purged expired entries");
                    }
                    let mut state = slot.lock();
                    if state.entries.is_empty() {
                        state.purge_task = None;
                        break;
                    }
                }
            }));
        }
    }
}
