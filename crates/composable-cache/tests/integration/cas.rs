use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use composable_cache::{EntryMapper, TypedCache};

use crate::utils::*;

fn increment() -> EntryMapper<u32, String> {
    Arc::new(|_: &u32, current: Option<String>| {
        let count: u32 = current.map_or(0, |value| value.parse().unwrap());
        Some((count + 1).to_string())
    })
}

#[test]
fn test_concurrent_increments_converge() {
    setup();
    let (_, cache) = memory_cache();
    let barrier = Barrier::new(4);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..25 {
                    let updated = cache.update_async(&1, increment(), 1_000);
                    assert!(settled(&updated).unwrap());
                }
            });
        }
    });

    let value = settled(&cache.get_async(&1)).unwrap();
    assert_eq!(value.as_deref(), Some("100"));
}

#[test]
fn test_abort_leaves_value_untouched() {
    setup();
    let (_, cache) = memory_cache();
    cache.set_async(&1, "3".into());

    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let capped: EntryMapper<u32, String> = Arc::new(move |_: &u32, current: Option<String>| {
        c.fetch_add(1, Ordering::SeqCst);
        let count: u32 = current?.parse().ok()?;
        (count < 3).then(|| (count + 1).to_string())
    });

    let updated = cache.update_async(&1, capped, 5);
    assert!(!settled(&updated).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(settled(&cache.get_async(&1)).unwrap().as_deref(), Some("3"));
}

#[test]
fn test_update_creates_missing_entry() {
    setup();
    let (_, cache) = memory_cache();

    let updated = cache.update_async(&5, increment(), 1);
    assert!(settled(&updated).unwrap());
    assert_eq!(settled(&cache.get_async(&5)).unwrap().as_deref(), Some("1"));
}
