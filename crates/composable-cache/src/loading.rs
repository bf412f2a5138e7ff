//! A cache that loads missing values, sharing concurrent loads of the same key.
//!
//! A lookup first consults the wrapped [`TypedCache`]. Keys that are not cached are loaded
//! through a [`CacheLoader`] and written back to the cache in the background. While a load of a
//! key is running, all other lookups of that key wait for its result instead of starting their
//! own load.
//!
//! Every lookup runs under three time budgets: one for the cache step, one for the loader step,
//! and a global one covering both. Failures and timeouts of the cache step count as misses. A
//! loader timeout fails the lookup with [`CacheError::LoaderTimeout`], and an exceeded global
//! budget with [`CacheError::GlobalTimeout`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use composable_futures::{ComposableFuture, FutureError, Promise, SchedulerRef, all_map};

use crate::cas::EntryMapper;
use crate::config::{Config, LoadingCacheConfig};
use crate::error::{self, CacheError};
use crate::inflight::{InFlight, InFlightLoads};
use crate::typed::TypedCache;

/// Loads values that are not cached, usually from a remote service.
pub trait CacheLoader<K, V>: Send + Sync + 'static {
    /// Loads the value of a single key.
    fn load(&self, cache_name: &str, key: &K) -> ComposableFuture<V>;

    /// Loads many keys at once.
    ///
    /// Keys that do not exist are missing from the result, this is not an error.
    fn load_bulk(&self, cache_name: &str, keys: &[K]) -> ComposableFuture<HashMap<K, V>>;
}

#[derive(Clone, Copy, Debug)]
enum Event {
    CacheHit,
    CacheMiss,
    CacheTimeout,
    CacheError,
    LoaderTimeout,
    LoaderError,
    GlobalTimeout,
}

impl Event {
    fn metric_name(self) -> &'static str {
        match self {
            Self::CacheHit => "loading_cache.cache_hit",
            Self::CacheMiss => "loading_cache.cache_miss",
            Self::CacheTimeout => "loading_cache.cache_timeout",
            Self::CacheError => "loading_cache.cache_error",
            Self::LoaderTimeout => "loading_cache.loader_timeout",
            Self::LoaderError => "loading_cache.loader_error",
            Self::GlobalTimeout => "loading_cache.global_timeout",
        }
    }
}

/// Counters of a [`LoadingCacheDelegate`].
///
/// Every recorded event is also reported as a metric, tagged with the cache name.
#[derive(Debug, Default)]
pub struct LoadingCacheStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_timeouts: AtomicU64,
    cache_errors: AtomicU64,
    loader_timeouts: AtomicU64,
    loader_errors: AtomicU64,
    global_timeouts: AtomicU64,
}

impl LoadingCacheStats {
    /// Keys that were found in the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Keys that had to be loaded, including those absorbed from cache failures.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Cache lookups that exceeded the cache timeout.
    pub fn cache_timeouts(&self) -> u64 {
        self.cache_timeouts.load(Ordering::Relaxed)
    }

    /// Cache lookups that failed.
    pub fn cache_errors(&self) -> u64 {
        self.cache_errors.load(Ordering::Relaxed)
    }

    /// Loads that exceeded the loader timeout.
    pub fn loader_timeouts(&self) -> u64 {
        self.loader_timeouts.load(Ordering::Relaxed)
    }

    /// Loads that failed.
    pub fn loader_errors(&self) -> u64 {
        self.loader_errors.load(Ordering::Relaxed)
    }

    /// Lookups that exceeded the global timeout.
    pub fn global_timeouts(&self) -> u64 {
        self.global_timeouts.load(Ordering::Relaxed)
    }

    fn record(&self, event: Event, cache_name: &str, count: u64) {
        if count == 0 {
            return;
        }

        let counter = match event {
            Event::CacheHit => &self.cache_hits,
            Event::CacheMiss => &self.cache_misses,
            Event::CacheTimeout => &self.cache_timeouts,
            Event::CacheError => &self.cache_errors,
            Event::LoaderTimeout => &self.loader_timeouts,
            Event::LoaderError => &self.loader_errors,
            Event::GlobalTimeout => &self.global_timeouts,
        };
        counter.fetch_add(count, Ordering::Relaxed);
        metric!(counter(event.metric_name()) += count as i64, "cache" => cache_name);
    }
}

/// A [`TypedCache`] that loads missing values through a [`CacheLoader`].
///
/// Clones share the cache, the loader, the registry of running loads and the stats.
pub struct LoadingCacheDelegate<K, V> {
    cache: Arc<dyn TypedCache<K, V>>,
    loader: Arc<dyn CacheLoader<K, V>>,
    scheduler: SchedulerRef,
    config: Arc<LoadingCacheConfig>,
    in_flight: Arc<InFlightLoads<K, V>>,
    stats: Arc<LoadingCacheStats>,
}

impl<K, V> Clone for LoadingCacheDelegate<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            loader: Arc::clone(&self.loader),
            scheduler: Arc::clone(&self.scheduler),
            config: Arc::clone(&self.config),
            in_flight: Arc::clone(&self.in_flight),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<K, V> fmt::Debug for LoadingCacheDelegate<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingCacheDelegate")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<K, V> LoadingCacheDelegate<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        cache: Arc<dyn TypedCache<K, V>>,
        loader: Arc<dyn CacheLoader<K, V>>,
        scheduler: SchedulerRef,
        config: LoadingCacheConfig,
    ) -> Self {
        Self {
            cache,
            loader,
            scheduler,
            config: Arc::new(config),
            in_flight: Arc::new(InFlightLoads::new()),
            stats: Arc::new(LoadingCacheStats::default()),
        }
    }

    /// Creates a delegate for the cache called `name`, with the timeouts configured for it.
    pub fn from_config(
        name: &str,
        cache: Arc<dyn TypedCache<K, V>>,
        loader: Arc<dyn CacheLoader<K, V>>,
        scheduler: SchedulerRef,
        config: &Config,
    ) -> Self {
        Self::new(cache, loader, scheduler, config.loading_cache(name))
    }

    /// Uses the given registry of running loads instead of a private one.
    ///
    /// Delegates sharing a registry also share their loads.
    pub fn with_in_flight(mut self, in_flight: Arc<InFlightLoads<K, V>>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn stats(&self) -> &LoadingCacheStats {
        &self.stats
    }

    pub fn in_flight(&self) -> &Arc<InFlightLoads<K, V>> {
        &self.in_flight
    }

    pub fn config(&self) -> &LoadingCacheConfig {
        &self.config
    }

    fn record(&self, event: Event, count: usize) {
        self.stats.record(event, &self.config.name, count as u64);
    }

    /// Absorbs failures of the cache step into a miss.
    fn absorb_cache_error<T>(&self, error: FutureError, fallback: T) -> T {
        if error::is_timeout(&error) {
            self.record(Event::CacheTimeout, 1);
            tracing::debug!(cache = %self.config.name, "Cache lookup timed out");
        } else {
            self.record(Event::CacheError, 1);
            tracing::warn!(
                cache = %self.config.name,
                error = &error as &dyn std::error::Error,
                "Cache lookup failed"
            );
        }
        fallback
    }

    /// Classifies a failed load, turning loader timeouts into [`CacheError::LoaderTimeout`].
    fn loader_error(&self, error: FutureError) -> FutureError {
        if error.is_timeout() {
            self.record(Event::LoaderTimeout, 1);
            tracing::debug!(cache = %self.config.name, "Load timed out");
            CacheError::LoaderTimeout(self.config.loader_timeout).into()
        } else {
            self.record(Event::LoaderError, 1);
            tracing::warn!(
                cache = %self.config.name,
                error = &error as &dyn std::error::Error,
                "Load failed"
            );
            error
        }
    }

    /// Bounds the whole lookup by the global timeout.
    fn bounded<T>(
        &self,
        lookup: ComposableFuture<T>,
        operation: &'static str,
    ) -> ComposableFuture<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let this = self.clone();
        let timeout = self.config.global_timeout;
        lookup
            .with_timeout(&*self.scheduler, timeout, operation)
            .recover_with(move |error| {
                if !error.is_timeout() {
                    return ComposableFuture::from_error(error);
                }
                this.record(Event::GlobalTimeout, 1);
                tracing::warn!(
                    cache = %this.config.name,
                    ?timeout,
                    "Cache lookup exceeded its time budget"
                );
                ComposableFuture::from_error(CacheError::GlobalTimeout(timeout).into())
            })
    }

    fn cached(&self, key: &K) -> ComposableFuture<Option<V>> {
        let this = self.clone();
        self.cache
            .get_async(key)
            .with_timeout(&*self.scheduler, self.config.cache_timeout, "cache get")
            .recover(move |error| this.absorb_cache_error(error, None))
    }

    fn cached_bulk(&self, keys: &[K]) -> ComposableFuture<HashMap<K, V>> {
        let this = self.clone();
        self.cache
            .get_bulk_async(keys)
            .with_timeout(&*self.scheduler, self.config.cache_timeout, "cache get_bulk")
            .recover(move |error| this.absorb_cache_error(error, HashMap::new()))
    }

    /// Loads `key`, or attaches to a load of it that is already running.
    fn load(&self, key: K) -> ComposableFuture<Option<V>> {
        let promise = match self.in_flight.attach_or_insert(&key) {
            InFlight::Attached(future) => {
                tracing::trace!(cache = %self.config.name, "Attaching to running load");
                return future;
            }
            InFlight::Inserted(promise) => promise,
        };
        let future = self.track(key.clone(), &promise);

        let loader = Arc::clone(&self.loader);
        let name = Arc::clone(&self.config);
        let this = self.clone();
        let cache = Arc::clone(&self.cache);
        ComposableFuture::from_value(key)
            .flat_map(move |key| {
                let loaded = loader.load(&name.name, &key);
                loaded.peek(move |value| write_back(&*cache, &key, value.clone()))
            })
            .with_timeout(&*self.scheduler, self.config.loader_timeout, "load")
            .consume(move |result| {
                promise.set_try(result.map(Some).map_err(|error| this.loader_error(error)));
            });

        future
    }

    /// Loads the keys in `misses` with a single bulk load, attaching to running loads of any of
    /// them.
    fn load_bulk(&self, misses: Vec<K>) -> ComposableFuture<HashMap<K, V>> {
        let mut pending = HashMap::with_capacity(misses.len());
        let mut inserted = Vec::new();
        for (key, in_flight) in self.in_flight.attach_or_insert_all(&misses) {
            match in_flight {
                InFlight::Attached(future) => {
                    pending.insert(key, future);
                }
                InFlight::Inserted(promise) => {
                    pending.insert(key.clone(), self.track(key.clone(), &promise));
                    inserted.push((key, promise));
                }
            }
        }

        tracing::trace!(
            cache = %self.config.name,
            attached = pending.len() - inserted.len(),
            loading = inserted.len(),
            "Loading missing keys"
        );
        if !inserted.is_empty() {
            self.start_bulk_load(inserted);
        }

        all_map(true, pending).map(|values| {
            values
                .into_iter()
                .filter_map(|(key, value)| Some((key, value?)))
                .collect()
        })
    }

    fn start_bulk_load(&self, inserted: Vec<(K, Promise<Option<V>>)>) {
        let keys: Vec<K> = inserted.iter().map(|(key, _)| key.clone()).collect();
        let loader = Arc::clone(&self.loader);
        let name = Arc::clone(&self.config);
        let this = self.clone();
        let cache = Arc::clone(&self.cache);

        ComposableFuture::from_value(keys)
            .flat_map(move |keys| loader.load_bulk(&name.name, &keys))
            .peek(move |loaded| write_back_bulk(&*cache, loaded.clone()))
            .with_timeout(&*self.scheduler, self.config.loader_timeout, "load_bulk")
            .consume(move |result| match result {
                Ok(mut loaded) => {
                    for (key, promise) in inserted {
                        promise.set(loaded.remove(&key));
                    }
                }
                Err(error) => {
                    let error = this.loader_error(error);
                    for (_, promise) in inserted {
                        promise.set_error(error.clone());
                    }
                }
            });
    }

    /// Returns the future of a registered load, which leaves the registry once it settles.
    fn track(&self, key: K, promise: &Promise<Option<V>>) -> ComposableFuture<Option<V>> {
        let future = promise.future();
        let in_flight = Arc::clone(&self.in_flight);
        future.consume(move |_| in_flight.remove(&key));
        future
    }
}

/// Writes a loaded value to the cache. Failures are only logged.
fn write_back<K, V>(cache: &dyn TypedCache<K, V>, key: &K, value: V)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache.set_async(key, value).consume(|result| match result {
        Ok(true) => {}
        Ok(false) => tracing::debug!("Cache rejected loaded value"),
        Err(error) => tracing::warn!(
            error = &error as &dyn std::error::Error,
            "Failed to write loaded value to cache"
        ),
    });
}

fn write_back_bulk<K, V>(cache: &dyn TypedCache<K, V>, values: HashMap<K, V>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    if values.is_empty() {
        return;
    }

    let expected = values.len();
    cache.set_bulk_async(values).consume(move |result| match result {
        Ok(written) => {
            let failed = expected - written.values().filter(|ok| **ok).count();
            if failed > 0 {
                tracing::debug!(failed, "Failed to write some loaded values to cache");
            }
        }
        Err(error) => tracing::warn!(
            error = &error as &dyn std::error::Error,
            "Failed to write loaded values to cache"
        ),
    });
}

impl<K, V> TypedCache<K, V> for LoadingCacheDelegate<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get_async(&self, key: &K) -> ComposableFuture<Option<V>> {
        let this = self.clone();
        let owned = key.clone();
        let lookup = self.cached(key).flat_map(move |cached| match cached {
            Some(value) => {
                this.record(Event::CacheHit, 1);
                ComposableFuture::from_value(Some(value))
            }
            None => {
                this.record(Event::CacheMiss, 1);
                this.load(owned)
            }
        });
        self.bounded(lookup, "get")
    }

    fn get_bulk_async(&self, keys: &[K]) -> ComposableFuture<HashMap<K, V>> {
        let this = self.clone();
        let keys = keys.to_vec();
        let lookup = self.cached_bulk(&keys).flat_map(move |mut hits| {
            let mut seen = HashSet::with_capacity(keys.len());
            let misses: Vec<K> = keys
                .into_iter()
                .filter(|key| !hits.contains_key(key) && seen.insert(key.clone()))
                .collect();
            this.record(Event::CacheHit, hits.len());
            this.record(Event::CacheMiss, misses.len());

            if misses.is_empty() {
                return ComposableFuture::from_value(hits);
            }
            this.load_bulk(misses).map(move |loaded| {
                hits.extend(loaded);
                hits
            })
        });
        self.bounded(lookup, "get_bulk")
    }

    fn set_async(&self, key: &K, value: V) -> ComposableFuture<bool> {
        self.cache.set_async(key, value)
    }

    fn update_async(
        &self,
        key: &K,
        mapper: EntryMapper<K, V>,
        max_attempts: u32,
    ) -> ComposableFuture<bool> {
        self.cache.update_async(key, mapper, max_attempts)
    }

    fn set_bulk_async(&self, entries: HashMap<K, V>) -> ComposableFuture<HashMap<K, bool>> {
        self.cache.set_bulk_async(entries)
    }

    fn delete_async(&self, key: &K) -> ComposableFuture<bool> {
        self.cache.delete_async(key)
    }
}
