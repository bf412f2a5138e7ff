//! The single-assignment cell every future is built on.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::defer::defer;
use crate::error::{FutureError, Try};
use crate::executor::{DebugExecutor, Executor, ExecutorRef};
use crate::scheduler::Scheduler;

/// A callback waiting for the outcome of a cell.
type Consumer<T> = Box<dyn FnOnce(Try<T>) + Send + 'static>;

/// Shared state behind a [`Promise`] and its [`ComposableFuture`]s.
///
/// The result slot is written at most once. Consumers registered before that are parked in
/// `pending` and drained by whichever thread wins the write, consumers registered afterwards
/// are notified right away.
struct Cell<T> {
    result: OnceLock<Try<T>>,
    pending: Mutex<Vec<Consumer<T>>>,
    executor: Option<ExecutorRef>,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(executor: Option<ExecutorRef>) -> Self {
        Self {
            result: OnceLock::new(),
            pending: Mutex::new(Vec::new()),
            executor,
        }
    }

    fn settled(result: Try<T>) -> Self {
        Self {
            result: OnceLock::from(result),
            pending: Mutex::new(Vec::new()),
            executor: None,
        }
    }

    fn settle(&self, result: Try<T>) -> bool {
        if self.result.set(result).is_err() {
            return false;
        }

        // Registration checks the slot while holding this lock, so nobody can push after the
        // drain without also observing the stored result.
        let pending = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        if let Some(result) = self.result.get() {
            for consumer in pending {
                self.notify(consumer, result.clone());
            }
        }
        true
    }

    fn register(&self, consumer: Consumer<T>) {
        let result = {
            let mut pending = self.pending.lock();
            match self.result.get() {
                Some(result) => result.clone(),
                None => {
                    pending.push(consumer);
                    return;
                }
            }
        };
        self.notify(consumer, result);
    }

    fn notify(&self, consumer: Consumer<T>, result: Try<T>) {
        match &self.executor {
            Some(executor) => executor.execute(Box::new(move || run_consumer(consumer, result))),
            None => run_consumer(consumer, result),
        }
    }
}

fn run_consumer<T>(consumer: Consumer<T>, result: Try<T>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || consumer(result))) {
        let error = FutureError::from_panic(payload);
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "error while handling future callbacks"
        );
    }
}

/// Runs a user computation, turning a panic into a failure.
pub(crate) fn guarded<R>(f: impl FnOnce() -> Try<R>) -> Try<R> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(FutureError::from_panic(payload)))
}

/// The write side of a [`ComposableFuture`].
///
/// The first call to any of the `set` methods wins, all later calls are ignored and return
/// `false`. Promises are clonable so that several producers can race for the same cell.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for Promise<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("result", &self.cell.result.get())
            .field("executor", &DebugExecutor(&self.cell.executor))
            .finish()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an unsettled promise that notifies its consumers on the settling thread.
    pub fn new() -> Self {
        Self::with_optional_executor(None)
    }

    /// Creates an unsettled promise that notifies its consumers via `executor`.
    ///
    /// Futures derived from it through combinators use the same executor.
    pub fn with_executor(executor: ExecutorRef) -> Self {
        Self::with_optional_executor(Some(executor))
    }

    pub(crate) fn with_optional_executor(executor: Option<ExecutorRef>) -> Self {
        Self {
            cell: Arc::new(Cell::new(executor)),
        }
    }

    /// Settles the promise with a value.
    pub fn set(&self, value: T) -> bool {
        self.cell.settle(Ok(value))
    }

    /// Settles the promise with an error.
    pub fn set_error(&self, error: FutureError) -> bool {
        self.cell.settle(Err(error))
    }

    /// Settles the promise with the given outcome.
    pub fn set_try(&self, result: Try<T>) -> bool {
        self.cell.settle(result)
    }

    /// Returns `true` once the promise has been settled.
    pub fn is_settled(&self) -> bool {
        self.cell.result.get().is_some()
    }

    /// Returns the read side of this promise.
    pub fn future(&self) -> ComposableFuture<T> {
        ComposableFuture {
            cell: Arc::clone(&self.cell),
        }
    }
}

/// An asynchronous value that settles exactly once.
///
/// A `ComposableFuture` is eager: the computation producing it is already running (or done)
/// when the future is handed out. Consumers see the same [`Try`] no matter whether they were
/// registered before or after the future settled, and each consumer runs exactly once.
///
/// Combinators such as [`map`](Self::map) or [`with_timeout`](Self::with_timeout) never block;
/// the only blocking operations are [`blocking_get`](Self::blocking_get) and
/// [`blocking_get_timeout`](Self::blocking_get_timeout). Neither of them may be called from
/// inside a consumer, as this can deadlock the thread that is supposed to settle the future.
pub struct ComposableFuture<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for ComposableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for ComposableFuture<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposableFuture")
            .field("result", &self.cell.result.get())
            .field("executor", &DebugExecutor(&self.cell.executor))
            .finish()
    }
}

impl<T> ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a future that is already settled with `value`.
    pub fn from_value(value: T) -> Self {
        Self::from_try(Ok(value))
    }

    /// Creates a future that is already settled with `error`.
    pub fn from_error(error: FutureError) -> Self {
        Self::from_try(Err(error))
    }

    /// Creates a future that is already settled with `result`.
    pub fn from_try(result: Try<T>) -> Self {
        Self {
            cell: Arc::new(Cell::settled(result)),
        }
    }

    /// Submits `task` to `executor` and settles with its outcome.
    ///
    /// A panicking task settles the future with [`FutureError::Panicked`]. If the executor drops
    /// the task without running it, the future settles with [`FutureError::Rejected`].
    pub fn from_task<E, F>(executor: &E, task: F) -> Self
    where
        E: Executor + ?Sized,
        F: FnOnce() -> Try<T> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();

        let rejected = promise.clone();
        let on_drop = defer(move || {
            rejected.set_error(FutureError::Rejected);
        });

        executor.execute(Box::new(move || {
            promise.set_try(guarded(task));
            on_drop.disarm();
        }));

        future
    }

    /// Runs `task` once `delay` has elapsed and settles with its outcome.
    ///
    /// If the scheduler drops the task without running it, for instance because its runtime
    /// shuts down, the future settles with [`FutureError::Rejected`].
    pub fn from_scheduled<S, F>(scheduler: &S, task: F, delay: Duration) -> Self
    where
        S: Scheduler + ?Sized,
        F: FnOnce() -> Try<T> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();

        let rejected = promise.clone();
        let on_drop = defer(move || {
            rejected.set_error(FutureError::Rejected);
        });

        scheduler.schedule(
            Box::new(move || {
                promise.set_try(guarded(task));
                on_drop.disarm();
            }),
            delay,
        );
        future
    }

    /// Registers a consumer for the outcome of this future.
    ///
    /// If the future is already settled, the consumer runs immediately, otherwise it runs on the
    /// thread settling the future. Futures with a dispatch executor run their consumers there.
    /// A panicking consumer is logged and does not affect any other consumer.
    pub fn consume<F>(&self, consumer: F)
    where
        F: FnOnce(Try<T>) + Send + 'static,
    {
        self.cell.register(Box::new(consumer));
    }

    /// Returns `true` once the future has been settled.
    pub fn is_settled(&self) -> bool {
        self.cell.result.get().is_some()
    }

    /// Returns the outcome if the future has already settled, without blocking.
    pub fn peek_result(&self) -> Option<Try<T>> {
        self.cell.result.get().cloned()
    }

    /// Blocks the current thread until the future settles.
    ///
    /// Meant for top level code and tests. Never call this from within a consumer.
    pub fn blocking_get(&self) -> Try<T> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.consume(move |result| {
            sender.send(result).ok();
        });
        // the sender is only dropped without sending if an executor discarded the notification
        receiver.recv().unwrap_or(Err(FutureError::Rejected))
    }

    /// Blocks the current thread until the future settles or `timeout` elapses.
    ///
    /// Timing out does not affect the future, it may still settle later on.
    pub fn blocking_get_timeout(&self, timeout: Duration) -> Try<T> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.consume(move |result| {
            sender.send(result).ok();
        });
        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(FutureError::timeout("blocking get", timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(FutureError::Rejected),
        }
    }

    /// Creates an unsettled promise that shares this future's dispatch executor.
    pub(crate) fn derive<R>(&self) -> Promise<R>
    where
        R: Clone + Send + Sync + 'static,
    {
        Promise::with_optional_executor(self.cell.executor.clone())
    }

    /// Settles `promise` with the outcome of this future, once available.
    pub(crate) fn forward_to(&self, promise: Promise<T>) {
        self.consume(move |result| {
            promise.set_try(result);
        });
    }
}
