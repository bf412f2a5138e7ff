use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use composable_futures::ComposableFuture;

use crate::backend::{Expiration, KeyValueBackend};
use crate::cas::{self, EntryMapper};
use crate::config::{CasConfig, Config};
use crate::key::CacheKeyTranslator;

/// A cache of values of type `V` addressed by logical keys of type `K`.
///
/// Implementations are shared between threads and all operations are asynchronous.
pub trait TypedCache<K, V>: Send + Sync + 'static {
    /// Looks up a single key. Settles with `None` if the key is not cached.
    fn get_async(&self, key: &K) -> ComposableFuture<Option<V>>;

    /// Looks up many keys at once. Keys that are not cached are missing from the result.
    fn get_bulk_async(&self, keys: &[K]) -> ComposableFuture<HashMap<K, V>>;

    /// Stores a value, overwriting what was there before.
    fn set_async(&self, key: &K, value: V) -> ComposableFuture<bool>;

    /// Updates the value at `key` with optimistic concurrency.
    ///
    /// See [`cas::update`] for the meaning of the result.
    fn update_async(
        &self,
        key: &K,
        mapper: EntryMapper<K, V>,
        max_attempts: u32,
    ) -> ComposableFuture<bool>;

    /// Stores many values at once, reporting success per key.
    ///
    /// Keys whose write failed are missing from the result.
    fn set_bulk_async(&self, entries: HashMap<K, V>) -> ComposableFuture<HashMap<K, bool>>;

    /// Removes the value at `key`. Settles with `false` if there was none.
    fn delete_async(&self, key: &K) -> ComposableFuture<bool>;
}

/// A [`TypedCache`] on top of a [`KeyValueBackend`].
///
/// Logical keys are turned into backend keys by a [`CacheKeyTranslator`]. All writes use the same
/// time to live, which is encoded into a backend [`Expiration`] at the time of each write.
pub struct BackendCache<K: ?Sized, V, B: ?Sized> {
    name: Arc<str>,
    backend: Arc<B>,
    translator: Arc<dyn CacheKeyTranslator<K>>,
    ttl: Duration,
    max_attempts: u32,
    _value: PhantomData<fn() -> V>,
}

impl<K: ?Sized, V, B: ?Sized> fmt::Debug for BackendCache<K, V, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<K, V, B> BackendCache<K, V, B>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: KeyValueBackend<V> + ?Sized,
{
    /// Creates a cache named `name`, storing values for `ttl`.
    ///
    /// A zero `ttl` stores values without expiration.
    pub fn new(
        name: impl Into<Arc<str>>,
        backend: Arc<B>,
        translator: impl CacheKeyTranslator<K>,
        ttl: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            translator: Arc::new(translator),
            ttl,
            max_attempts: CasConfig::default().max_attempts,
            _value: PhantomData,
        }
    }

    /// Creates a cache storing values for the default time to live of the `memory` config.
    ///
    /// [`update`](Self::update) gives up after the attempts configured in `cas`.
    pub fn from_config(
        name: impl Into<Arc<str>>,
        backend: Arc<B>,
        translator: impl CacheKeyTranslator<K>,
        config: &Config,
    ) -> Self {
        Self::new(name, backend, translator, config.memory.default_ttl)
            .with_max_attempts(config.cas.max_attempts)
    }

    /// Sets the attempt budget of [`update`](Self::update).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The attempt budget of [`update`](Self::update).
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Like [`TypedCache::update_async`], with the attempt budget of this cache.
    pub fn update(&self, key: &K, mapper: EntryMapper<K, V>) -> ComposableFuture<bool> {
        self.update_async(key, mapper, self.max_attempts)
    }

    /// The name used to tag metrics of this cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the backend key of `key`.
    pub fn backend_key(&self, key: &K) -> String {
        self.translator.translate_key(key)
    }

    fn expiration(&self) -> Expiration {
        Expiration::from_ttl(self.ttl)
    }

    /// Reports how long the operation took once `future` settles.
    fn timed<T>(&self, operation: &'static str, future: ComposableFuture<T>) -> ComposableFuture<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let name = Arc::clone(&self.name);
        let start = Instant::now();
        future.and_then(move |result| {
            let status = if result.is_ok() { "ok" } else { "error" };
            metric!(
                timer(operation) = start.elapsed(),
                "cache" => &*name,
                "status" => status,
            );
        })
    }
}

impl<K, V, B> TypedCache<K, V> for BackendCache<K, V, B>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: KeyValueBackend<V> + ?Sized,
{
    fn get_async(&self, key: &K) -> ComposableFuture<Option<V>> {
        let future = self.backend.get(&self.backend_key(key));
        self.timed("cache.get", future)
    }

    fn get_bulk_async(&self, keys: &[K]) -> ComposableFuture<HashMap<K, V>> {
        let lookup: HashMap<String, K> = keys
            .iter()
            .map(|key| (self.backend_key(key), key.clone()))
            .collect();
        let backend_keys: Vec<String> = lookup.keys().cloned().collect();

        let future = self.backend.get_bulk(&backend_keys).map(move |values| {
            values
                .into_iter()
                .filter_map(|(backend_key, value)| {
                    Some((lookup.get(&backend_key)?.clone(), value))
                })
                .collect()
        });
        self.timed("cache.get_bulk", future)
    }

    fn set_async(&self, key: &K, value: V) -> ComposableFuture<bool> {
        let future = self
            .backend
            .set(&self.backend_key(key), value, self.expiration());
        self.timed("cache.set", future)
    }

    fn update_async(
        &self,
        key: &K,
        mapper: EntryMapper<K, V>,
        max_attempts: u32,
    ) -> ComposableFuture<bool> {
        let future = cas::update(
            Arc::clone(&self.backend),
            self.backend_key(key),
            key.clone(),
            mapper,
            max_attempts,
            self.expiration(),
        );
        self.timed("cache.update", future)
    }

    fn set_bulk_async(&self, entries: HashMap<K, V>) -> ComposableFuture<HashMap<K, bool>> {
        let mut lookup = HashMap::with_capacity(entries.len());
        let entries = entries
            .into_iter()
            .map(|(key, value)| {
                let backend_key = self.backend_key(&key);
                lookup.insert(backend_key.clone(), key);
                (backend_key, value)
            })
            .collect();

        let future = self
            .backend
            .set_bulk(entries, self.expiration())
            .map(move |written| {
                written
                    .into_iter()
                    .filter_map(|(backend_key, ok)| Some((lookup.remove(&backend_key)?, ok)))
                    .collect()
            });
        self.timed("cache.set_bulk", future)
    }

    fn delete_async(&self, key: &K) -> ComposableFuture<bool> {
        let future = self.backend.delete(&self.backend_key(key));
        self.timed("cache.delete", future)
    }
}
