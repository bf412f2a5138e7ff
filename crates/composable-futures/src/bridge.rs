//! Interoperability with `async` code.

use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;

use crate::defer::defer;
use crate::error::{FutureError, Try};
use crate::promise::{ComposableFuture, Promise};

/// A [`std::future::Future`] resolving to the outcome of a [`ComposableFuture`].
///
/// Created by `.await`ing a [`ComposableFuture`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Settled<T> {
    receiver: oneshot::Receiver<Try<T>>,
}

impl<T> Future for Settled<T> {
    type Output = Try<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // the sender is only dropped without sending if an executor discarded the notification
        self.receiver
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(FutureError::Rejected)))
    }
}

impl<T> IntoFuture for ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Try<T>;
    type IntoFuture = Settled<T>;

    fn into_future(self) -> Self::IntoFuture {
        let (sender, receiver) = oneshot::channel();
        self.consume(move |result| {
            sender.send(result).ok();
        });
        Settled { receiver }
    }
}

impl<T> ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Spawns `future` on the given tokio runtime and settles with its output.
    ///
    /// A panic inside `future` settles with [`FutureError::Panicked`]. If the runtime shuts down
    /// before `future` completed, this settles with [`FutureError::Rejected`].
    pub fn from_std_future<F>(handle: &tokio::runtime::Handle, future: F) -> Self
    where
        F: Future<Output = Try<T>> + Send + 'static,
    {
        let promise = Promise::new();
        let result = promise.future();

        // dropped along with the task if the runtime never gets to complete it
        let rejected = promise.clone();
        let on_drop = defer(move || {
            rejected.set_error(FutureError::Rejected);
        });

        handle.spawn(async move {
            let output = AssertUnwindSafe(future).catch_unwind().await;
            promise.set_try(output.unwrap_or_else(|payload| Err(FutureError::from_panic(payload))));
            on_drop.disarm();
        });

        result
    }
}
