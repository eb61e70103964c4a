use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock, duration_millis};
use crate::error::{BoxError, CacheError, ConfigError};

/// TTL steps after which data becomes so invalid that it is discarded and
/// never returned, not even with `use_cache_while_updating` enabled.
const INVALID_DATA_STEP: u64 = 5;

/// Result of one run of the update function.
pub type UpdateResult<T> = Result<T, BoxError>;

type UpdateFn<T> = Arc<dyn Fn() -> BoxFuture<'static, UpdateResult<T>> + Send + Sync>;
type SharedUpdate<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

struct Entry<T> {
    value: T,
    last_update: u64,
}

struct State<T> {
    data: Option<Entry<T>>,
    in_flight: Option<SharedUpdate<T>>,
}

/// Single cached value - holds the last known value and manages refreshes
/// through the update function supplied at construction.
///
/// Within the TTL, [`get_data`](Cached::get_data) serves the cached value
/// without touching the update function. Once the value goes stale, the next
/// call starts exactly one refresh; whether callers wait for it or keep
/// receiving the stale value is controlled by
/// [`use_cache_while_updating`](Cached::use_cache_while_updating). Data older
/// than `ttl * 5` is discarded rather than served.
///
/// Cloning the cache is cheap and clones share the same value slot.
#[derive(Clone)]
pub struct Cached<T> {
    update: UpdateFn<T>,
    ttl: Duration,
    use_cache_while_updating: bool,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State<T>>>,
}

impl<T> Cached<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new cache around the given update function and TTL.
    ///
    /// Fails if the TTL is shorter than one millisecond.
    pub fn new<F, Fut>(update: F, ttl: Duration) -> Result<Self, ConfigError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UpdateResult<T>> + Send + 'static,
    {
        if duration_millis(ttl) == 0 {
            return Err(ConfigError::InvalidTtl(ttl));
        }
        Ok(Self {
            update: Arc::new(move || update().boxed()),
            ttl,
            use_cache_while_updating: true,
            clock: Arc::new(SystemClock),
            state: Arc::new(Mutex::new(State {
                data: None,
                in_flight: None,
            })),
        })
    }

    /// Sets whether the cached value is served while a refresh is running,
    /// instead of making callers wait for the refresh. Defaults to `true`.
    pub fn use_cache_while_updating(mut self, enabled: bool) -> Self {
        self.use_cache_while_updating = enabled;
        self
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

    /// Returns the cached value, refreshing it first or in the background
    /// when it is missing or outdated.
    ///
    /// `Ok(None)` is only possible when there is neither a value nor a
    /// refresh to wait for.
    pub async fn get_data(&self) -> Result<Option<T>, CacheError> {
        let ttl = duration_millis(self.ttl);
        let pending = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let elapsed = state
                .data
                .as_ref()
                .map(|entry| now.saturating_sub(entry.last_update));

            // Data beyond the invalid bound must never be served, regardless
            // of the stale-while-updating policy.
            if elapsed.is_some_and(|ms| ms > ttl.saturating_mul(INVALID_DATA_STEP)) {
                state.data = None;
            }

            if state.in_flight.is_none()
                && (state.data.is_none() || elapsed.is_none_or(|ms| ms > ttl))
            {
                // The returned handle is only needed by force_update; here
                // the refresh is picked up from the in-flight slot below.
                let _ = self.start_refresh(&mut state);
            }

            // Regular return, or serving the stale value while a refresh
            // runs in the background.
            if let Some(entry) = &state.data {
                if state.in_flight.is_none() || self.use_cache_while_updating {
                    return Ok(Some(entry.value.clone()));
                }
            }

            state.in_flight.clone()
        };

        match pending {
            Some(fetch) => fetch.await.map(Some),
            None => Ok(None),
        }
    }

    /// Refreshes the value regardless of freshness and returns the result.
    ///
    /// Concurrent calls share one in-flight refresh rather than stacking up
    /// fetches.
    pub async fn force_update(&self) -> Result<T, CacheError> {
        let fetch = {
            let mut state = self.state.lock();
            match state.in_flight.clone() {
                Some(fetch) => fetch,
                None => self.start_refresh(&mut state),
            }
        };
        fetch.await
    }

    /// Milliseconds the current value remains fresh for. Negative when the
    /// value is outdated or was never set.
    pub fn valid_for(&self) -> i64 {
        let state = self.state.lock();
        match &state.data {
            Some(entry) => {
                let valid_until = entry.last_update.saturating_add(duration_millis(self.ttl));
                valid_until as i64 - self.clock.now() as i64
            }
            None => -1,
        }
    }

    /// Registers a shared refresh in the in-flight slot before anything can
    /// suspend, so back-to-back callers cannot start a second fetch.
    fn start_refresh(&self, state: &mut State<T>) -> SharedUpdate<T> {
        let update = Arc::clone(&self.update);
        let clock = Arc::clone(&self.clock);
        let slot = Arc::clone(&self.state);
        let fetch: SharedUpdate<T> = async move {
            let result = update().await;
            let mut state = slot.lock();
            // Cleared on failure as well, so the next access can retry.
            state.in_flight = None;
            match result {
                Ok(value) => {
                    state.data = Some(Entry {
                        value: value.clone(),
                        last_update: clock.now(),
                    });
                    Ok(value)
                }
                Err(err) => Err(CacheError::fetch(err)),
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(fetch.clone());
        // The refresh runs to completion and commits even if every caller
        // abandons interest.
        tokio::spawn(fetch.clone());
        fetch
    }
}
