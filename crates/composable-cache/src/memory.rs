use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use composable_futures::ComposableFuture;
use moka::ops::compute::{CompResult, Op};

use crate::backend::{CasOutcome, CasValue, CasVersion, Expiration, KeyValueBackend};
use crate::config::MemoryConfig;

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct StoredItem<V> {
    /// When to evict this item, `None` if it never expires.
    deadline: Option<Instant>,
    /// Version stamp, unique across the whole backend.
    version: u64,
    /// The actual data.
    value: V,
}

/// A struct implementing [`moka::Expiry`] that uses the [`StoredItem`] deadline as the explicit
/// expiration time.
struct ItemExpiration;

fn time_to_deadline(current_time: Instant, deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(current_time))
}

impl<V> moka::Expiry<String, StoredItem<V>> for ItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredItem<V>,
        current_time: Instant,
    ) -> Option<Duration> {
        time_to_deadline(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredItem<V>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        time_to_deadline(current_time, value.deadline)
    }
}

/// A [`KeyValueBackend`] that keeps values in process memory.
///
/// Values are held in a bounded [`moka`] cache. Conditional writes run as atomic per-key
/// computations, so this backend honors the same compare-and-swap contract as memcached. All
/// futures it returns are already settled.
pub struct MemoryBackend<V> {
    items: moka::sync::Cache<String, StoredItem<V>>,
    versions: AtomicU64,
}

impl<V> fmt::Debug for MemoryBackend<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.items.entry_count())
            .finish()
    }
}

impl<V> MemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a backend holding at most `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        let items = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .expire_after(ItemExpiration)
            .build();

        Self {
            items,
            versions: AtomicU64::new(0),
        }
    }

    /// Creates a backend from the `memory` section of the configuration.
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.capacity)
    }

    fn item(&self, value: V, expiration: Expiration) -> StoredItem<V> {
        StoredItem {
            deadline: expiration
                .remaining()
                .map(|remaining| Instant::now() + remaining),
            version: self.versions.fetch_add(1, Ordering::Relaxed) + 1,
            value,
        }
    }
}

impl<V> KeyValueBackend<V> for MemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> ComposableFuture<Option<V>> {
        ComposableFuture::from_value(self.items.get(key).map(|item| item.value))
    }

    fn get_with_version(&self, key: &str) -> ComposableFuture<Option<CasValue<V>>> {
        let value = self.items.get(key).map(|item| CasValue {
            value: item.value,
            version: CasVersion(item.version),
        });
        ComposableFuture::from_value(value)
    }

    fn get_bulk(&self, keys: &[String]) -> ComposableFuture<HashMap<String, V>> {
        let values = keys
            .iter()
            .filter_map(|key| {
                let item = self.items.get(key)?;
                Some((key.clone(), item.value))
            })
            .collect();
        ComposableFuture::from_value(values)
    }

    fn set(&self, key: &str, value: V, expiration: Expiration) -> ComposableFuture<bool> {
        self.items.insert(key.to_owned(), self.item(value, expiration));
        ComposableFuture::from_value(true)
    }

    fn add_if_absent(
        &self,
        key: &str,
        value: V,
        expiration: Expiration,
    ) -> ComposableFuture<bool> {
        let item = self.item(value, expiration);
        let result = self
            .items
            .entry(key.to_owned())
            .and_compute_with(|existing| match existing {
                Some(_) => Op::Nop,
                None => Op::Put(item),
            });
        ComposableFuture::from_value(matches!(result, CompResult::Inserted(_)))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        version: CasVersion,
        value: V,
        expiration: Expiration,
    ) -> ComposableFuture<CasOutcome> {
        let item = self.item(value, expiration);
        let result = self
            .items
            .entry(key.to_owned())
            .and_compute_with(|existing| match existing {
                Some(current) if current.value().version == version.0 => Op::Put(item),
                _ => Op::Nop,
            });

        let outcome = match result {
            CompResult::ReplacedWith(_) => CasOutcome::Applied,
            CompResult::Unchanged(_) => CasOutcome::VersionMismatch,
            CompResult::StillNone(_) => CasOutcome::NotFound,
            CompResult::Inserted(_) | CompResult::Removed(_) => {
                CasOutcome::Error("entry changed shape during compare-and-swap".into())
            }
        };
        ComposableFuture::from_value(outcome)
    }

    fn delete(&self, key: &str) -> ComposableFuture<bool> {
        ComposableFuture::from_value(self.items.remove(key).is_some())
    }
}
