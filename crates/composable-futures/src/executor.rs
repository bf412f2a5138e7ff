//! Executors that run consumer notifications and submitted computations.

use std::fmt;
use std::sync::Arc;

/// A unit of work handed to an [`Executor`] or a [`Scheduler`](crate::Scheduler).
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run [`Task`]s, usually on a thread pool.
///
/// Executors may drop tasks without running them, for example when shutting down. Futures built
/// via [`ComposableFuture::from_task`](crate::ComposableFuture::from_task) settle with
/// [`FutureError::Rejected`](crate::FutureError::Rejected) in that case.
pub trait Executor: Send + Sync + 'static {
    /// Runs the given task, now or at some later point.
    fn execute(&self, task: Task);
}

/// A shared handle to an [`Executor`].
pub type ExecutorRef = Arc<dyn Executor>;

/// Runs every task on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

/// Runs tasks on the blocking pool of a tokio runtime.
///
/// Tasks may block, so they are never placed on the async worker threads.
impl Executor for tokio::runtime::Handle {
    fn execute(&self, task: Task) {
        // dropping the `JoinHandle` detaches the task
        drop(self.spawn_blocking(task));
    }
}

/// Runs tasks on a rayon thread pool, meant for CPU heavy computations.
impl Executor for rayon::ThreadPool {
    fn execute(&self, task: Task) {
        self.spawn(task)
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task)
    }
}

/// Debug helper for structs that hold an optional [`ExecutorRef`].
pub(crate) struct DebugExecutor<'a>(pub &'a Option<ExecutorRef>);

impl fmt::Debug for DebugExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Some(<executor>)"),
            None => f.write_str("None"),
        }
    }
}
