//! Combinators over several futures: races, joins, timeouts and hedged requests.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::FutureError;
use crate::promise::{ComposableFuture, Promise, guarded};
use crate::scheduler::Scheduler;

/// Settles with the outcome of whichever future settles first.
///
/// Later settlements among `futures` are ignored. An empty list settles right away with
/// [`FutureError::EmptyFutureList`].
pub fn collect_first<T>(futures: Vec<ComposableFuture<T>>) -> ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    let Some(first) = futures.first() else {
        return ComposableFuture::from_error(FutureError::EmptyFutureList);
    };

    let promise = first.derive();
    for future in &futures {
        future.forward_to(promise.clone());
    }
    promise.future()
}

/// Settles with the values of all `futures`, in input order.
///
/// Fails with the first error any of the futures settles with. An empty list settles right away
/// with an empty vector.
pub fn collect_all<T>(futures: Vec<ComposableFuture<T>>) -> ComposableFuture<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let Some(first) = futures.first() else {
        return ComposableFuture::from_value(Vec::new());
    };

    let promise = first.derive();
    let slots = Arc::new(Mutex::new(vec![None; futures.len()]));
    let remaining = Arc::new(AtomicUsize::new(futures.len()));

    for (index, future) in futures.iter().enumerate() {
        let promise = promise.clone();
        let slots = Arc::clone(&slots);
        let remaining = Arc::clone(&remaining);

        future.consume(move |result| match result {
            Ok(value) => {
                let values = {
                    let mut slots = slots.lock();
                    slots[index] = Some(value);
                    if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                        return;
                    }
                    std::mem::take(&mut *slots)
                };
                promise.set(values.into_iter().flatten().collect());
            }
            Err(error) => {
                promise.set_error(error);
            }
        });
    }

    promise.future()
}

/// Settles with a map of the values of all `futures` once every one of them settled.
///
/// With `fail_on_error`, the first error fails the whole map. Otherwise failed entries are
/// logged and left out of the result.
pub fn all_map<K, V>(
    fail_on_error: bool,
    futures: HashMap<K, ComposableFuture<V>>,
) -> ComposableFuture<HashMap<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let Some(first) = futures.values().next() else {
        return ComposableFuture::from_value(HashMap::new());
    };

    let promise = first.derive();
    let values = Arc::new(Mutex::new(HashMap::with_capacity(futures.len())));
    let remaining = Arc::new(AtomicUsize::new(futures.len()));

    for (key, future) in futures {
        let promise = promise.clone();
        let values = Arc::clone(&values);
        let remaining = Arc::clone(&remaining);

        future.consume(move |result| {
            let values = {
                let mut values = values.lock();
                match result {
                    Ok(value) => {
                        values.insert(key, value);
                    }
                    Err(error) if fail_on_error => {
                        drop(values);
                        promise.set_error(error);
                        return;
                    }
                    Err(error) => {
                        tracing::debug!(
                            error = &error as &dyn std::error::Error,
                            "Dropping failed entry from future map"
                        );
                    }
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                std::mem::take(&mut *values)
            };
            promise.set(values);
        });
    }

    promise.future()
}

/// Invokes `action` right away, and a second time if the first attempt has not settled after
/// `duration`.
///
/// Settles with whichever attempt settles first. `action` runs at most twice. The slower attempt
/// is not interrupted, its outcome is discarded.
pub fn hedge<T, S, F>(scheduler: &S, duration: Duration, action: F) -> ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
    S: Scheduler + ?Sized,
    F: Fn() -> ComposableFuture<T> + Send + Sync + 'static,
{
    let action = Arc::new(action);
    let first = match guarded(|| Ok(action())) {
        Ok(first) => first,
        Err(error) => return ComposableFuture::from_error(error),
    };
    if first.is_settled() {
        return first;
    }

    let second: Promise<T> = first.derive();
    let token = {
        let first = first.clone();
        let second = second.clone();
        scheduler.schedule(
            Box::new(move || {
                if first.is_settled() {
                    first.forward_to(second);
                    return;
                }
                tracing::trace!("Hedging slow request with a second attempt");
                match guarded(|| Ok(action())) {
                    Ok(attempt) => attempt.forward_to(second),
                    Err(error) => {
                        second.set_error(error);
                    }
                }
            }),
            duration,
        )
    };
    first.consume(move |_| token.cancel());

    collect_first(vec![first, second.future()])
}

impl<T> ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Fails with [`FutureError::Timeout`] if this future does not settle within `duration`.
    ///
    /// The underlying computation is not stopped, only its outcome is discarded once the deadline
    /// fired. The deadline is cancelled as soon as this future settles.
    pub fn with_timeout<S>(
        &self,
        scheduler: &S,
        duration: Duration,
        task: impl Into<Arc<str>>,
    ) -> ComposableFuture<T>
    where
        S: Scheduler + ?Sized,
    {
        if self.is_settled() {
            return self.clone();
        }

        let deadline: Promise<T> = self.derive();
        let error = FutureError::timeout(task, duration);
        let token = {
            let deadline = deadline.clone();
            scheduler.schedule(
                Box::new(move || {
                    deadline.set_error(error);
                }),
                duration,
            )
        };
        self.consume(move |_| token.cancel());

        collect_first(vec![self.clone(), deadline.future()])
    }
}
