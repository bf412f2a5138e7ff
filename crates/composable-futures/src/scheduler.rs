//! Delayed task execution.
//!
//! The [`Scheduler`] is the only source of time for the combinators: timeouts, hedged requests
//! and delays are all built on [`Scheduler::schedule`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::executor::Task;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync + 'static {
    /// Schedules `task` to run once `delay` has elapsed.
    ///
    /// Cancelling the returned token before the delay elapsed prevents the task from running.
    /// Cancelling it afterwards, or more than once, has no effect.
    fn schedule(&self, task: Task, delay: Duration) -> CancellationToken;
}

/// A shared handle to a [`Scheduler`].
pub type SchedulerRef = Arc<dyn Scheduler>;

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn schedule(&self, task: Task, delay: Duration) -> CancellationToken {
        (**self).schedule(task, delay)
    }
}

/// A [`Scheduler`] backed by the timer of a tokio runtime.
///
/// Tasks run on the async worker threads once their timer fires, so they are expected to be
/// short. Settling a promise is the typical task.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Creates a scheduler for the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a scheduler for the runtime of the current context.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler").finish_non_exhaustive()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task, delay: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        self.handle.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    tracing::trace!("Scheduled task was cancelled before it fired");
                }
                _ = tokio::time::sleep(delay) => task(),
            }
        });

        token
    }
}
