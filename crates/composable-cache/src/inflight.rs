use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::Hash;

use composable_futures::{ComposableFuture, Promise};
use parking_lot::Mutex;

/// The outcome of registering interest in a load.
pub enum InFlight<V> {
    /// A load of the key is already running, its result will be shared.
    Attached(ComposableFuture<Option<V>>),
    /// No load was running. The caller is now responsible for loading the key and settling this
    /// promise, which resolves everyone attaching in the meantime.
    Inserted(Promise<Option<V>>),
}

impl<V> fmt::Debug for InFlight<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attached(_) => f.write_str("Attached"),
            Self::Inserted(_) => f.write_str("Inserted"),
        }
    }
}

/// The registry of running loads, used to coalesce concurrent loads of the same key.
///
/// Loads settle with `None` for keys the loader did not find.
pub struct InFlightLoads<K, V> {
    loads: Mutex<HashMap<K, ComposableFuture<Option<V>>>>,
}

impl<K, V> fmt::Debug for InFlightLoads<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loads = self.loads.lock();
        f.debug_struct("InFlightLoads")
            .field("loads", &loads.len())
            .finish()
    }
}

impl<K, V> Default for InFlightLoads<K, V> {
    fn default() -> Self {
        Self {
            loads: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> InFlightLoads<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches to the running load of `key`, or registers a new one.
    pub fn attach_or_insert(&self, key: &K) -> InFlight<V> {
        let mut loads = self.loads.lock();
        attach_or_insert(&mut loads, key)
    }

    /// Like [`attach_or_insert`](Self::attach_or_insert), for many keys at once.
    ///
    /// All keys are registered atomically. Duplicate keys are registered once.
    pub fn attach_or_insert_all(&self, keys: &[K]) -> HashMap<K, InFlight<V>> {
        let mut loads = self.loads.lock();
        let mut registered = HashMap::with_capacity(keys.len());
        for key in keys {
            if !registered.contains_key(key) {
                registered.insert(key.clone(), attach_or_insert(&mut loads, key));
            }
        }
        registered
    }

    /// Forgets the load of `key`, so the next lookup starts a new one.
    pub fn remove(&self, key: &K) {
        let mut loads = self.loads.lock();
        loads.remove(key);
    }

    /// The number of running loads.
    pub fn len(&self) -> usize {
        self.loads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn attach_or_insert<K, V>(
    loads: &mut HashMap<K, ComposableFuture<Option<V>>>,
    key: &K,
) -> InFlight<V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    match loads.entry(key.clone()) {
        Entry::Occupied(entry) => InFlight::Attached(entry.get().clone()),
        Entry::Vacant(entry) => {
            let promise = Promise::new();
            entry.insert(promise.future());
            InFlight::Inserted(promise)
        }
    }
}
