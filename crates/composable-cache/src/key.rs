use std::fmt;

use sha2::{Digest, Sha256};

/// Turns a logical cache key into the key used by the backend.
///
/// The translation must be deterministic. Any `Fn(&K) -> String` closure is a translator.
pub trait CacheKeyTranslator<K: ?Sized>: Send + Sync + 'static {
    /// Returns the backend key for `key`.
    fn translate_key(&self, key: &K) -> String;
}

impl<K, F> CacheKeyTranslator<K> for F
where
    K: ?Sized,
    F: Fn(&K) -> String + Send + Sync + 'static,
{
    fn translate_key(&self, key: &K) -> String {
        self(key)
    }
}

/// A [`CacheKeyTranslator`] producing `prefix:sha256` keys.
///
/// The hash keeps keys within memcached's 250 byte limit and free of whitespace and control
/// characters, no matter what the logical key looks like.
#[derive(Clone, Debug)]
pub struct HashedKeyTranslator {
    prefix: String,
}

impl HashedKeyTranslator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl<K> CacheKeyTranslator<K> for HashedKeyTranslator
where
    K: fmt::Display + ?Sized,
{
    fn translate_key(&self, key: &K) -> String {
        let hash = Sha256::digest(key.to_string());
        format!("{}:{}", self.prefix, hex::encode(hash))
    }
}
