use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The outcome every [`ComposableFuture`](crate::ComposableFuture) settles with.
///
/// Once a future is settled, every consumer observes a clone of the same `Try`.
pub type Try<T> = Result<T, FutureError>;

/// An error a future can settle with.
///
/// This error is cheaply clonable, as a single failure is handed out to every consumer of a
/// future. Errors of collaborators (backends, loaders, user computations) are carried in the
/// [`Custom`](Self::Custom) variant and can be recovered with [`downcast_ref`](Self::downcast_ref).
#[derive(Debug, Clone, Error)]
pub enum FutureError {
    /// A deadline elapsed before the observed computation settled.
    ///
    /// The computation itself keeps running, its result is discarded.
    #[error("timeout occurred on task ('{task}' {duration:?})")]
    Timeout {
        /// Description of the task that timed out.
        task: Arc<str>,
        /// The deadline that elapsed.
        duration: Duration,
    },
    /// A race was requested over an empty list of futures.
    #[error("empty future list")]
    EmptyFutureList,
    /// The value did not pass the predicate given to [`ensure`](crate::ComposableFuture::ensure).
    #[error("predicate is not satisfied")]
    PredicateNotSatisfied,
    /// A user supplied computation panicked.
    #[error("computation panicked: {0}")]
    Panicked(Arc<str>),
    /// An executor dropped a submitted task without running it.
    #[error("task was dropped by its executor before it ran")]
    Rejected,
    /// Any other error.
    #[error(transparent)]
    Custom(Arc<dyn StdError + Send + Sync + 'static>),
}

impl FutureError {
    /// Creates a [`Timeout`](Self::Timeout) error for the given task description.
    pub fn timeout(task: impl Into<Arc<str>>, duration: Duration) -> Self {
        Self::Timeout {
            task: task.into(),
            duration,
        }
    }

    /// Wraps an arbitrary error.
    pub fn custom<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(error))
    }

    /// Returns `true` if this is a [`Timeout`](Self::Timeout).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns a reference to the wrapped error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            Self::Custom(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Converts a panic payload caught by [`std::panic::catch_unwind`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).into()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str().into()
        } else {
            "<non-string panic payload>".into()
        };
        Self::Panicked(message)
    }
}

impl From<anyhow::Error> for FutureError {
    fn from(err: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = err.into();
        Self::Custom(Arc::from(boxed))
    }
}

impl From<std::io::Error> for FutureError {
    fn from(err: std::io::Error) -> Self {
        Self::custom(err)
    }
}
