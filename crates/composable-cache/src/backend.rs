//! The contract of a remote key-value store, such as memcached.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use composable_futures::{ComposableFuture, all_map};

/// The longest expiration that memcached interprets as an offset from now.
///
/// Larger values are taken as an absolute unix timestamp.
pub const MAX_RELATIVE_EXPIRATION: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// An expiration in the encoding of the memcached protocol.
///
/// The raw value is either a number of seconds starting from now, which may not exceed
/// [`MAX_RELATIVE_EXPIRATION`], or a unix timestamp in seconds. `0` means the entry never
/// expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Expiration(u32);

impl Expiration {
    /// An entry that never expires.
    pub const NEVER: Self = Self(0);

    /// Encodes a time to live.
    ///
    /// A zero `ttl` means the entry never expires. Fractional seconds are rounded up, time to
    /// lives longer than 30 days are converted to an absolute timestamp.
    pub fn from_ttl(ttl: Duration) -> Self {
        Self::from_ttl_at(ttl, Utc::now().timestamp())
    }

    fn from_ttl_at(ttl: Duration, now: i64) -> Self {
        let seconds = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        if seconds <= MAX_RELATIVE_EXPIRATION.as_secs() {
            Self(seconds as u32)
        } else {
            let absolute = (now.max(0) as u64).saturating_add(seconds);
            Self(absolute.min(u32::MAX as u64) as u32)
        }
    }

    /// Wraps an already encoded expiration.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the encoded expiration as sent to the server.
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns `true` if this is an absolute timestamp rather than an offset from now.
    pub fn is_absolute(self) -> bool {
        u64::from(self.0) > MAX_RELATIVE_EXPIRATION.as_secs()
    }

    /// Decodes the time left until expiration.
    ///
    /// Returns `None` for entries that never expire. Absolute timestamps in the past decode to
    /// [`Duration::ZERO`].
    pub fn remaining(self) -> Option<Duration> {
        self.remaining_at(Utc::now().timestamp())
    }

    fn remaining_at(self, now: i64) -> Option<Duration> {
        match self.0 {
            0 => None,
            _ if self.is_absolute() => {
                let left = i64::from(self.0).saturating_sub(now).max(0);
                Some(Duration::from_secs(left as u64))
            }
            seconds => Some(Duration::from_secs(u64::from(seconds))),
        }
    }
}

/// An opaque version stamp of a stored value.
///
/// It is only compared for equality, to detect concurrent modifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CasVersion(pub u64);

/// A value together with the version it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CasValue<V> {
    pub value: V,
    pub version: CasVersion,
}

/// The result of a versioned write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The value was written.
    Applied,
    /// Another writer changed the value since it was read.
    VersionMismatch,
    /// The value was removed since it was read.
    NotFound,
    /// The backend failed to process the write.
    Error(String),
}

/// A key-value store with compare-and-swap support.
///
/// All operations are asynchronous. Failures of the store itself settle the returned futures
/// with an error, usually a [`CacheError::Backend`](crate::CacheError::Backend).
pub trait KeyValueBackend<V>: Send + Sync + 'static
where
    V: Clone + Send + Sync + 'static,
{
    /// Reads the value stored at `key`.
    fn get(&self, key: &str) -> ComposableFuture<Option<V>>;

    /// Reads the value stored at `key` together with its version.
    fn get_with_version(&self, key: &str) -> ComposableFuture<Option<CasValue<V>>>;

    /// Reads all of the given keys. Keys without a value are missing from the result.
    fn get_bulk(&self, keys: &[String]) -> ComposableFuture<HashMap<String, V>>;

    /// Stores `value` at `key`, overwriting what was there before.
    fn set(&self, key: &str, value: V, expiration: Expiration) -> ComposableFuture<bool>;

    /// Stores `value` only if `key` has no value yet.
    ///
    /// Settles with `false` if there already was a value.
    fn add_if_absent(&self, key: &str, value: V, expiration: Expiration)
    -> ComposableFuture<bool>;

    /// Stores `value` only if the value at `key` still has the given version.
    fn compare_and_swap(
        &self,
        key: &str,
        version: CasVersion,
        value: V,
        expiration: Expiration,
    ) -> ComposableFuture<CasOutcome>;

    /// Removes the value at `key`. Settles with `false` if there was none.
    fn delete(&self, key: &str) -> ComposableFuture<bool>;

    /// Stores all entries, reporting success per key.
    ///
    /// Entries whose write failed are missing from the result.
    fn set_bulk(
        &self,
        entries: HashMap<String, V>,
        expiration: Expiration,
    ) -> ComposableFuture<HashMap<String, bool>> {
        let writes = entries
            .into_iter()
            .map(|(key, value)| {
                let write = self.set(&key, value, expiration);
                (key, write)
            })
            .collect();
        all_map(false, writes)
    }
}
