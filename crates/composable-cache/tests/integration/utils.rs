use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use composable_cache::{
    BackendCache, CacheError, CacheLoader, EntryMapper, LoadingCacheConfig, LoadingCacheDelegate,
    MemoryBackend, TypedCache,
};
use composable_futures::{ComposableFuture, Try};
use composable_futures::test::ManualScheduler;
use parking_lot::Mutex;

pub use composable_futures::test::setup;

pub type MemoryCache = BackendCache<u32, String, MemoryBackend<String>>;

/// The value the [`TestLoader`] produces for `key`.
pub fn loaded(key: u32) -> String {
    format!("loaded-{key}")
}

/// A cache of `u32` keys in process memory.
pub fn memory_cache() -> (Arc<MemoryBackend<String>>, Arc<MemoryCache>) {
    let backend = Arc::new(MemoryBackend::new(1_000));
    let cache = BackendCache::new(
        "test",
        Arc::clone(&backend),
        |key: &u32| format!("test:{key}"),
        Duration::from_secs(3600),
    );
    (backend, Arc::new(cache))
}

/// A loader that records its invocations and answers after a delay of virtual time.
pub struct TestLoader {
    scheduler: ManualScheduler,
    delay: Duration,
    missing: HashSet<u32>,
    failing: bool,
    loads: Mutex<Vec<u32>>,
    bulk_loads: Mutex<Vec<Vec<u32>>>,
}

impl TestLoader {
    pub fn new(scheduler: &ManualScheduler, delay: Duration) -> Self {
        Self {
            scheduler: scheduler.clone(),
            delay,
            missing: HashSet::new(),
            failing: false,
            loads: Mutex::new(Vec::new()),
            bulk_loads: Mutex::new(Vec::new()),
        }
    }

    /// Keys the loader does not know about.
    pub fn with_missing(mut self, keys: impl IntoIterator<Item = u32>) -> Self {
        self.missing.extend(keys);
        self
    }

    /// Makes every load fail.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Keys of all single-key loads, in call order.
    pub fn loads(&self) -> Vec<u32> {
        self.loads.lock().clone()
    }

    /// Keys of all bulk loads, in call order. The keys of every load are sorted.
    pub fn bulk_loads(&self) -> Vec<Vec<u32>> {
        self.bulk_loads.lock().clone()
    }

    fn respond<T>(&self, value: T) -> ComposableFuture<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let result: Try<T> = if self.failing {
            Err(CacheError::Loader("upstream is down".into()).into())
        } else {
            Ok(value)
        };

        if self.delay.is_zero() {
            ComposableFuture::from_try(result)
        } else {
            ComposableFuture::from_scheduled(&self.scheduler, move || result, self.delay)
        }
    }
}

impl CacheLoader<u32, String> for TestLoader {
    fn load(&self, _cache_name: &str, key: &u32) -> ComposableFuture<String> {
        self.loads.lock().push(*key);
        self.respond(loaded(*key))
    }

    fn load_bulk(
        &self,
        _cache_name: &str,
        keys: &[u32],
    ) -> ComposableFuture<HashMap<u32, String>> {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        self.bulk_loads.lock().push(sorted);

        let values = keys
            .iter()
            .filter(|key| !self.missing.contains(*key))
            .map(|&key| (key, loaded(key)))
            .collect();
        self.respond(values)
    }
}

/// A cache whose lookups take `delay` of virtual time, or fail if there is no delay.
pub struct SlowCache {
    pub scheduler: ManualScheduler,
    pub delay: Option<Duration>,
    pub inner: Arc<MemoryCache>,
}

impl SlowCache {
    fn lookup<T>(&self, value: T) -> ComposableFuture<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.delay {
            Some(delay) => {
                ComposableFuture::from_scheduled(&self.scheduler, move || Ok(value), delay)
            }
            None => {
                let error = CacheError::Backend("connection refused".into());
                ComposableFuture::from_error(error.into())
            }
        }
    }
}

impl TypedCache<u32, String> for SlowCache {
    fn get_async(&self, _key: &u32) -> ComposableFuture<Option<String>> {
        self.lookup(None)
    }

    fn get_bulk_async(&self, _keys: &[u32]) -> ComposableFuture<HashMap<u32, String>> {
        self.lookup(HashMap::new())
    }

    fn set_async(&self, key: &u32, value: String) -> ComposableFuture<bool> {
        self.inner.set_async(key, value)
    }

    fn update_async(
        &self,
        key: &u32,
        mapper: EntryMapper<u32, String>,
        max_attempts: u32,
    ) -> ComposableFuture<bool> {
        self.inner.update_async(key, mapper, max_attempts)
    }

    fn set_bulk_async(
        &self,
        entries: HashMap<u32, String>,
    ) -> ComposableFuture<HashMap<u32, bool>> {
        self.inner.set_bulk_async(entries)
    }

    fn delete_async(&self, key: &u32) -> ComposableFuture<bool> {
        self.inner.delete_async(key)
    }
}

/// Creates a loading cache running on virtual time.
pub fn loading_cache(
    cache: Arc<dyn TypedCache<u32, String>>,
    loader: Arc<TestLoader>,
    scheduler: &ManualScheduler,
    update_config: impl FnOnce(&mut LoadingCacheConfig),
) -> LoadingCacheDelegate<u32, String> {
    let mut config = LoadingCacheConfig::named("test");
    update_config(&mut config);
    LoadingCacheDelegate::new(cache, loader, Arc::new(scheduler.clone()), config)
}

/// Returns the outcome of a future that is expected to be settled.
#[track_caller]
pub fn settled<T>(future: &ComposableFuture<T>) -> Try<T>
where
    T: Clone + Send + Sync + 'static,
{
    future.peek_result().expect("future is not settled")
}
