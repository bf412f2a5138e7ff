//! Optimistic read-modify-write updates on top of compare-and-swap.
//!
//! Every attempt reads the current value together with its version, runs the mapper, and writes
//! the result back conditionally: with a compare-and-swap if a value existed, or with an add if
//! there was none. Losing a race against another writer starts the next attempt, until the
//! attempt budget is exhausted.

use std::sync::Arc;

use composable_futures::{ComposableFuture, Promise, Try};

use crate::backend::{CasOutcome, CasValue, Expiration, KeyValueBackend};
use crate::error::CacheError;

/// Computes the new value of an entry from its current value.
///
/// Receives `None` if the entry does not exist. Returning `None` aborts the update without
/// writing anything.
pub type EntryMapper<K, V> = Arc<dyn Fn(&K, Option<V>) -> Option<V> + Send + Sync>;

/// The result of a single attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    /// The update is finished, with the given result.
    Done(bool),
    /// Another writer got in between, the update may be retried.
    Conflict,
}

struct CasUpdate<K, V, B: ?Sized> {
    backend: Arc<B>,
    backend_key: String,
    key: K,
    mapper: EntryMapper<K, V>,
    expiration: Expiration,
    max_attempts: u32,
}

/// Applies `mapper` to the entry at `backend_key` with optimistic concurrency.
///
/// Settles with `true` once a write was applied. Settles with `false` if the mapper aborted, or
/// if every one of `max_attempts` attempts lost a race against a concurrent writer. Backend
/// failures settle with an error. `max_attempts` is clamped to at least one.
pub fn update<K, V, B>(
    backend: Arc<B>,
    backend_key: String,
    key: K,
    mapper: EntryMapper<K, V>,
    max_attempts: u32,
    expiration: Expiration,
) -> ComposableFuture<bool>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: KeyValueBackend<V> + ?Sized,
{
    let update = Arc::new(CasUpdate {
        backend,
        backend_key,
        key,
        mapper,
        expiration,
        max_attempts: max_attempts.max(1),
    });
    let promise = Promise::new();
    let future = promise.future();
    update.run(1, promise);
    future
}

impl<K, V, B> CasUpdate<K, V, B>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: KeyValueBackend<V> + ?Sized,
{
    /// Runs attempts starting at `attempt` until one of them settles `promise`.
    ///
    /// Attempts that complete synchronously are driven by the loop, so a long series of
    /// conflicts does not grow the stack. Only an attempt that is still pending continues from
    /// its consumer.
    fn run(self: Arc<Self>, mut attempt: u32, promise: Promise<bool>) {
        loop {
            let this = Arc::clone(&self);
            let outcome = self
                .backend
                .get_with_version(&self.backend_key)
                .flat_map(move |current| this.write(current));

            let Some(result) = outcome.peek_result() else {
                outcome.consume(move |result| match self.finish(attempt, result) {
                    Some(result) => {
                        promise.set_try(result);
                    }
                    None => self.run(attempt + 1, promise),
                });
                return;
            };

            match self.finish(attempt, result) {
                Some(result) => {
                    promise.set_try(result);
                    return;
                }
                None => attempt += 1,
            }
        }
    }

    /// Returns the result of the update, or `None` if another attempt should be made.
    fn finish(&self, attempt: u32, result: Try<Attempt>) -> Option<Try<bool>> {
        match result {
            Err(error) => Some(Err(error)),
            Ok(Attempt::Done(updated)) => {
                tracing::debug!(
                    key = %self.backend_key,
                    attempt,
                    updated,
                    "Finished cache update"
                );
                Some(Ok(updated))
            }
            Ok(Attempt::Conflict) if attempt < self.max_attempts => {
                metric!(counter("cache.cas.retry") += 1);
                tracing::trace!(key = %self.backend_key, attempt, "Retrying cache update");
                None
            }
            Ok(Attempt::Conflict) => {
                tracing::debug!(
                    key = %self.backend_key,
                    attempt,
                    "Giving up cache update after concurrent modifications"
                );
                Some(Ok(false))
            }
        }
    }

    fn write(&self, current: Option<CasValue<V>>) -> ComposableFuture<Attempt> {
        let (previous, version) = match current {
            Some(CasValue { value, version }) => (Some(value), Some(version)),
            None => (None, None),
        };

        let Some(value) = (self.mapper)(&self.key, previous) else {
            return ComposableFuture::from_value(Attempt::Done(false));
        };

        match version {
            Some(version) => self
                .backend
                .compare_and_swap(&self.backend_key, version, value, self.expiration)
                .try_map(|outcome| match outcome {
                    CasOutcome::Applied => Ok(Attempt::Done(true)),
                    // a value that vanished since the read was modified concurrently as well
                    CasOutcome::VersionMismatch | CasOutcome::NotFound => Ok(Attempt::Conflict),
                    CasOutcome::Error(message) => Err(CacheError::Backend(message).into()),
                }),
            None => self
                .backend
                .add_if_absent(&self.backend_key, value, self.expiration)
                .map(|added| {
                    if added {
                        Attempt::Done(true)
                    } else {
                        Attempt::Conflict
                    }
                }),
        }
    }
}
