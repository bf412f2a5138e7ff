use std::collections::HashMap;
use std::sync::Arc;

use composable_cache::{
    BackendCache, Config, HashedKeyTranslator, KeyValueBackend, MemoryBackend, TypedCache,
};

use crate::utils::*;

fn hashed_cache() -> (
    Arc<MemoryBackend<String>>,
    BackendCache<String, String, MemoryBackend<String>>,
) {
    let backend = Arc::new(MemoryBackend::new(100));
    let cache = BackendCache::from_config(
        "kv",
        Arc::clone(&backend),
        HashedKeyTranslator::new("kv"),
        &Config::default(),
    );
    (backend, cache)
}

#[test]
fn test_set_then_get() {
    setup();
    let (_, cache) = hashed_cache();

    let written = cache.set_async(&"k".to_owned(), "v".to_owned());
    assert!(settled(&written).unwrap());

    let value = cache.get_async(&"k".to_owned());
    assert_eq!(settled(&value).unwrap().as_deref(), Some("v"));

    // a missing key is not an error
    let missing = cache.get_async(&"missing".to_owned());
    assert_eq!(settled(&missing).unwrap(), None);
}

#[test]
fn test_hashed_backend_keys() {
    setup();
    let (backend, cache) = hashed_cache();
    let key = "a key with spaces ".repeat(100);
    cache.set_async(&key, "v".to_owned());

    let backend_key = cache.backend_key(&key);
    assert!(backend_key.starts_with("kv:"));
    assert!(backend_key.len() <= 250);
    assert!(!backend_key.contains(' '));

    let stored = backend.get(&backend_key);
    assert_eq!(settled(&stored).unwrap().as_deref(), Some("v"));
}

#[test]
fn test_bulk_roundtrip() {
    setup();
    let (_, cache) = memory_cache();

    let entries: HashMap<u32, String> = (1..=3).map(|key| (key, loaded(key))).collect();
    let written = settled(&cache.set_bulk_async(entries.clone())).unwrap();
    assert_eq!(written, HashMap::from([(1, true), (2, true), (3, true)]));

    let values = settled(&cache.get_bulk_async(&[1, 2, 3, 4])).unwrap();
    assert_eq!(values, entries);
}

#[test]
fn test_delete() {
    setup();
    let (backend, cache) = memory_cache();
    cache.set_async(&1, loaded(1));

    assert!(settled(&cache.delete_async(&1)).unwrap());
    assert_eq!(settled(&backend.get("test:1")).unwrap(), None);
    assert!(!settled(&cache.delete_async(&1)).unwrap());
}
