//! Transformations of a single [`ComposableFuture`].
//!
//! Every combinator returns a fresh future backed by a new cell, the source future is never
//! modified. User closures are run inside a panic guard: a panicking closure settles the
//! returned future with [`FutureError::Panicked`] instead of unwinding into whichever thread
//! happened to settle the source.

use std::time::Duration;

use crate::error::{FutureError, Try};
use crate::promise::{ComposableFuture, guarded};
use crate::scheduler::Scheduler;

impl<T> ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Transforms a successful value, errors are passed through unchanged.
    pub fn map<R, F>(&self, f: F) -> ComposableFuture<R>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Like [`map`](Self::map), for transformations that can fail.
    pub fn try_map<R, F>(&self, f: F) -> ComposableFuture<R>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Try<R> + Send + 'static,
    {
        let promise = self.derive();
        let future = promise.future();
        self.consume(move |result| {
            promise.set_try(result.and_then(|value| guarded(move || f(value))));
        });
        future
    }

    /// Continues a successful value with another future, errors are passed through unchanged.
    pub fn flat_map<R, F>(&self, f: F) -> ComposableFuture<R>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> ComposableFuture<R> + Send + 'static,
    {
        let promise = self.derive();
        let future = promise.future();
        self.consume(move |result| match result {
            Ok(value) => match guarded(move || Ok(f(value))) {
                Ok(next) => next.forward_to(promise),
                Err(error) => {
                    promise.set_error(error);
                }
            },
            Err(error) => {
                promise.set_error(error);
            }
        });
        future
    }

    /// Turns an error into a value, successful values are passed through unchanged.
    pub fn recover<F>(&self, f: F) -> ComposableFuture<T>
    where
        F: FnOnce(FutureError) -> T + Send + 'static,
    {
        let promise = self.derive();
        let future = promise.future();
        self.consume(move |result| {
            promise.set_try(result.or_else(|error| guarded(move || Ok(f(error)))));
        });
        future
    }

    /// Continues an error with another future, successful values are passed through unchanged.
    pub fn recover_with<F>(&self, f: F) -> ComposableFuture<T>
    where
        F: FnOnce(FutureError) -> ComposableFuture<T> + Send + 'static,
    {
        let promise = self.derive();
        let future = promise.future();
        self.consume(move |result| match result {
            Ok(value) => {
                promise.set(value);
            }
            Err(error) => match guarded(move || Ok(f(error))) {
                Ok(next) => next.forward_to(promise),
                Err(error) => {
                    promise.set_error(error);
                }
            },
        });
        future
    }

    /// Transforms the outcome, whether it is a value or an error.
    pub fn always<R, F>(&self, f: F) -> ComposableFuture<R>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(Try<T>) -> R + Send + 'static,
    {
        let promise = self.derive();
        let future = promise.future();
        self.consume(move |result| {
            promise.set_try(guarded(move || Ok(f(result))));
        });
        future
    }

    /// Continues the outcome with another future, whether it is a value or an error.
    pub fn always_with<R, F>(&self, f: F) -> ComposableFuture<R>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(Try<T>) -> ComposableFuture<R> + Send + 'static,
    {
        let promise = self.derive();
        let future = promise.future();
        self.consume(move |result| match guarded(move || Ok(f(result))) {
            Ok(next) => next.forward_to(promise),
            Err(error) => {
                promise.set_error(error);
            }
        });
        future
    }

    /// Observes the outcome without changing it.
    ///
    /// The returned future settles only after `observer` has run. A panicking observer is
    /// logged and ignored.
    pub fn and_then<F>(&self, observer: F) -> ComposableFuture<T>
    where
        F: FnOnce(&Try<T>) + Send + 'static,
    {
        let promise = self.derive();
        let future = promise.future();
        self.consume(move |result| {
            observe(|| observer(&result));
            promise.set_try(result);
        });
        future
    }

    /// Observes a successful value without changing the outcome.
    ///
    /// Errors skip the observer. A panicking observer is logged and ignored.
    pub fn peek<F>(&self, observer: F) -> ComposableFuture<T>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.and_then(move |result| {
            if let Ok(value) = result {
                observer(value);
            }
        })
    }

    /// Turns the outcome into a value, so the returned future always succeeds.
    pub fn successful(&self) -> ComposableFuture<Try<T>> {
        self.always(|result| result)
    }

    /// Delays a successful value by `duration`. Errors are passed through right away.
    pub fn delay<S>(&self, scheduler: &S, duration: Duration) -> ComposableFuture<T>
    where
        S: Scheduler + Clone,
    {
        let scheduler = scheduler.clone();
        self.flat_map(move |value| {
            ComposableFuture::from_scheduled(&scheduler, move || Ok(value), duration)
        })
    }

    /// Fails with [`FutureError::PredicateNotSatisfied`] if a value does not pass `predicate`.
    pub fn ensure<F>(&self, predicate: F) -> ComposableFuture<T>
    where
        F: FnOnce(&T) -> bool + Send + 'static,
    {
        self.try_map(move |value| {
            if predicate(&value) {
                Ok(value)
            } else {
                Err(FutureError::PredicateNotSatisfied)
            }
        })
    }
}

fn observe(f: impl FnOnce()) {
    let outcome = guarded(|| {
        f();
        Ok(())
    });
    if let Err(error) = outcome {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "error while observing future result"
        );
    }
}
