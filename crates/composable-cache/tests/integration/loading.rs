use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use composable_cache::{
    CacheError, CacheLoader, Config, LoadingCacheDelegate, TypedCache,
};
use composable_futures::test::ManualScheduler;
use composable_futures::{ComposableFuture, TokioScheduler};

use crate::utils::*;

#[test]
fn test_concurrent_gets_share_one_load() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::from_millis(10)));
    let (_, cache) = memory_cache();
    let delegate = loading_cache(cache, Arc::clone(&loader), &scheduler, |_| {});

    let barrier = Barrier::new(100);
    let futures: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..100)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    delegate.get_async(&1)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(futures.iter().all(|future| !future.is_settled()));
    assert_eq!(delegate.in_flight().len(), 1);

    scheduler.advance(Duration::from_millis(10));

    for future in &futures {
        assert_eq!(settled(future).unwrap(), Some(loaded(1)));
    }
    assert_eq!(loader.loads(), [1]);
    assert!(delegate.in_flight().is_empty());
    assert_eq!(delegate.stats().cache_misses(), 100);

    // the loaded value was written back
    let cached = delegate.get_async(&1);
    assert_eq!(settled(&cached).unwrap(), Some(loaded(1)));
    assert_eq!(delegate.stats().cache_hits(), 1);
    assert_eq!(loader.loads(), [1]);
}

#[test]
fn test_bulk_loads_only_misses() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::ZERO));
    let (_, cache) = memory_cache();
    cache.set_async(&1, "cached".into());
    let delegate = loading_cache(cache, Arc::clone(&loader), &scheduler, |_| {});

    let values = settled(&delegate.get_bulk_async(&[1, 2, 3, 4, 5])).unwrap();

    let mut expected: HashMap<_, _> = (2..=5).map(|key| (key, loaded(key))).collect();
    expected.insert(1, "cached".into());
    assert_eq!(values, expected);
    assert_eq!(loader.bulk_loads(), [vec![2, 3, 4, 5]]);
    assert!(loader.loads().is_empty());
    assert_eq!(delegate.stats().cache_hits(), 1);
    assert_eq!(delegate.stats().cache_misses(), 4);
}

#[test]
fn test_bulk_omits_unknown_keys() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::ZERO).with_missing([3]));
    let (_, cache) = memory_cache();
    let delegate = loading_cache(cache, Arc::clone(&loader), &scheduler, |_| {});

    let values = settled(&delegate.get_bulk_async(&[1, 2, 3, 2])).unwrap();
    assert_eq!(values, HashMap::from([(1, loaded(1)), (2, loaded(2))]));
    assert_eq!(loader.bulk_loads(), [vec![1, 2, 3]]);
    assert!(delegate.in_flight().is_empty());
}

#[test]
fn test_overlapping_requests_share_loads() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::from_millis(10)));
    let (_, cache) = memory_cache();
    let delegate = loading_cache(cache, Arc::clone(&loader), &scheduler, |_| {});

    let first = delegate.get_bulk_async(&[1, 2, 3]);
    let second = delegate.get_bulk_async(&[2, 3, 4]);
    let single = delegate.get_async(&4);
    assert_eq!(delegate.in_flight().len(), 4);

    scheduler.advance(Duration::from_millis(10));

    assert_eq!(loader.bulk_loads(), [vec![1, 2, 3], vec![4]]);
    assert!(loader.loads().is_empty());
    assert_eq!(
        settled(&first).unwrap(),
        HashMap::from([(1, loaded(1)), (2, loaded(2)), (3, loaded(3))])
    );
    assert_eq!(
        settled(&second).unwrap(),
        HashMap::from([(2, loaded(2)), (3, loaded(3)), (4, loaded(4))])
    );
    assert_eq!(settled(&single).unwrap(), Some(loaded(4)));
    assert!(delegate.in_flight().is_empty());
}

#[test]
fn test_global_timeout() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::from_millis(100)));
    let (_, cache) = memory_cache();
    let delegate = loading_cache(Arc::clone(&cache) as _, loader, &scheduler, |config| {
        config.global_timeout = Duration::from_millis(1);
    });

    let future = delegate.get_async(&1);
    scheduler.advance(Duration::from_millis(1));

    let error = settled(&future).unwrap_err();
    assert_eq!(
        CacheError::from_future_error(&error),
        Some(&CacheError::GlobalTimeout(Duration::from_millis(1)))
    );
    insta::assert_snapshot!(error.to_string(), @"global timeout after 1ms");
    assert_eq!(delegate.stats().global_timeouts(), 1);
    assert_eq!(delegate.stats().loader_timeouts(), 0);

    // the load keeps running and still fills the cache
    scheduler.advance(Duration::from_millis(100));
    assert!(delegate.in_flight().is_empty());
    assert_eq!(settled(&cache.get_async(&1)).unwrap(), Some(loaded(1)));
}

#[test]
fn test_loader_timeout() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::from_millis(100)));
    let (_, cache) = memory_cache();
    let delegate = loading_cache(cache, loader, &scheduler, |config| {
        config.loader_timeout = Duration::from_millis(1);
        config.global_timeout = Duration::from_secs(1);
    });

    let future = delegate.get_async(&1);
    scheduler.advance(Duration::from_millis(1));

    let error = settled(&future).unwrap_err();
    assert_eq!(
        CacheError::from_future_error(&error),
        Some(&CacheError::LoaderTimeout(Duration::from_millis(1)))
    );
    insta::assert_snapshot!(error.to_string(), @"load timed out after 1ms");
    assert_eq!(delegate.stats().loader_timeouts(), 1);
    assert_eq!(delegate.stats().global_timeouts(), 0);
    assert!(delegate.in_flight().is_empty());
}

#[test]
fn test_cache_timeout_is_a_miss() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::ZERO));
    let (_, inner) = memory_cache();
    let cache = Arc::new(SlowCache {
        scheduler: scheduler.clone(),
        delay: Some(Duration::from_secs(1)),
        inner,
    });
    let delegate = loading_cache(cache, Arc::clone(&loader), &scheduler, |config| {
        config.cache_timeout = Duration::from_millis(10);
    });

    let future = delegate.get_async(&1);
    assert!(!future.is_settled());

    scheduler.advance(Duration::from_millis(10));
    assert_eq!(settled(&future).unwrap(), Some(loaded(1)));
    assert_eq!(delegate.stats().cache_timeouts(), 1);
    assert_eq!(delegate.stats().cache_misses(), 1);
    assert_eq!(loader.loads(), [1]);
}

#[test]
fn test_cache_error_is_a_miss() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::ZERO));
    let (_, inner) = memory_cache();
    let cache = Arc::new(SlowCache {
        scheduler: scheduler.clone(),
        delay: None,
        inner: Arc::clone(&inner),
    });
    let delegate = loading_cache(cache, Arc::clone(&loader), &scheduler, |_| {});

    let single = delegate.get_async(&1);
    assert_eq!(settled(&single).unwrap(), Some(loaded(1)));

    let bulk = delegate.get_bulk_async(&[1, 2]);
    assert_eq!(
        settled(&bulk).unwrap(),
        HashMap::from([(1, loaded(1)), (2, loaded(2))])
    );

    assert_eq!(delegate.stats().cache_errors(), 2);
    assert_eq!(delegate.stats().cache_timeouts(), 0);
    assert_eq!(loader.loads(), [1]);
    assert_eq!(loader.bulk_loads(), [vec![1, 2]]);

    // loaded values are still written through to the wrapped cache
    assert_eq!(settled(&inner.get_async(&2)).unwrap(), Some(loaded(2)));
}

#[test]
fn test_loader_error_propagates() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::ZERO).failing());
    let (_, cache) = memory_cache();
    let delegate = loading_cache(cache, Arc::clone(&loader), &scheduler, |_| {});

    let error = settled(&delegate.get_async(&1)).unwrap_err();
    assert_eq!(
        CacheError::from_future_error(&error),
        Some(&CacheError::Loader("upstream is down".into()))
    );

    let error = settled(&delegate.get_bulk_async(&[1, 2])).unwrap_err();
    assert!(CacheError::from_future_error(&error).is_some());

    // failed loads are not remembered
    assert!(settled(&delegate.get_async(&1)).is_err());
    assert_eq!(loader.loads(), [1, 1]);
    assert_eq!(delegate.stats().loader_errors(), 3);
    assert!(delegate.in_flight().is_empty());
}

#[test]
fn test_shared_in_flight_registry() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::from_millis(10)));
    let (_, cache) = memory_cache();
    let first = loading_cache(
        Arc::clone(&cache) as _,
        Arc::clone(&loader),
        &scheduler,
        |_| {},
    );
    let second = loading_cache(cache, Arc::clone(&loader), &scheduler, |_| {})
        .with_in_flight(Arc::clone(first.in_flight()));

    let a = first.get_async(&9);
    let b = second.get_async(&9);
    scheduler.advance(Duration::from_millis(10));

    assert_eq!(settled(&a).unwrap(), Some(loaded(9)));
    assert_eq!(settled(&b).unwrap(), Some(loaded(9)));
    assert_eq!(loader.loads(), [9]);
}

#[test]
fn test_writes_pass_through() {
    setup();
    let scheduler = ManualScheduler::new();
    let loader = Arc::new(TestLoader::new(&scheduler, Duration::ZERO));
    let (_, cache) = memory_cache();
    let delegate = loading_cache(
        Arc::clone(&cache) as _,
        Arc::clone(&loader),
        &scheduler,
        |_| {},
    );

    assert!(settled(&delegate.set_async(&7, "seven".into())).unwrap());
    assert_eq!(settled(&cache.get_async(&7)).unwrap().as_deref(), Some("seven"));
    assert_eq!(
        settled(&delegate.get_async(&7)).unwrap().as_deref(),
        Some("seven")
    );

    assert!(settled(&delegate.delete_async(&7)).unwrap());
    assert_eq!(settled(&cache.get_async(&7)).unwrap(), None);
    assert!(loader.loads().is_empty());
}

/// A loader running async code on a tokio runtime.
struct AsyncLoader {
    handle: tokio::runtime::Handle,
    loads: AtomicUsize,
}

impl CacheLoader<u32, String> for AsyncLoader {
    fn load(&self, _cache_name: &str, key: &u32) -> ComposableFuture<String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let key = *key;
        ComposableFuture::from_std_future(&self.handle, async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(loaded(key))
        })
    }

    fn load_bulk(
        &self,
        _cache_name: &str,
        keys: &[u32],
    ) -> ComposableFuture<HashMap<u32, String>> {
        let values = keys.iter().map(|&key| (key, loaded(key))).collect();
        ComposableFuture::from_value(values)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loading_on_tokio() {
    setup();
    let loader = Arc::new(AsyncLoader {
        handle: tokio::runtime::Handle::current(),
        loads: AtomicUsize::new(0),
    });
    let (_, cache) = memory_cache();
    let yaml = "caches: { tokio: { loader_timeout: 1s } }";
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let delegate = LoadingCacheDelegate::from_config(
        "tokio",
        cache,
        Arc::clone(&loader) as _,
        Arc::new(TokioScheduler::current()),
        &config,
    );
    assert_eq!(delegate.config().name, "tokio");
    assert_eq!(delegate.config().loader_timeout, Duration::from_secs(1));

    let first = delegate.get_async(&3);
    let second = delegate.get_async(&3);
    assert_eq!(first.await.unwrap(), Some(loaded(3)));
    assert_eq!(second.await.unwrap(), Some(loaded(3)));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

    assert_eq!(delegate.get_async(&3).await.unwrap(), Some(loaded(3)));
    assert_eq!(delegate.stats().cache_hits(), 1);
}
