//! Eager, composable futures for callback driven code.
//!
//! A [`ComposableFuture`] is a single-assignment cell that is settled exactly once, by whichever
//! producer gets there first, via its [`Promise`]. Consumers observe the outcome as a [`Try`]
//! and can be registered before or after settlement. Futures are combined through plain closures
//! ([`map`](ComposableFuture::map), [`flat_map`](ComposableFuture::flat_map),
//! [`recover`](ComposableFuture::recover), ...) and raced through [`collect_first`],
//! [`hedge`] and [`with_timeout`](ComposableFuture::with_timeout), all of which get their notion
//! of time from a [`Scheduler`].
//!
//! No dedicated event loop is required: settlement and notification can happen on any thread.
//! Consumers run on the settling thread, or on the dispatch [`Executor`] of a promise created
//! with [`Promise::with_executor`].
//!
//! ```
//! use std::time::Duration;
//!
//! use composable_futures::{ComposableFuture, InlineExecutor, TokioScheduler};
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let scheduler = TokioScheduler::new(runtime.handle().clone());
//!
//! let answer = ComposableFuture::from_task(&InlineExecutor, || Ok(21))
//!     .map(|value| value * 2)
//!     .with_timeout(&scheduler, Duration::from_secs(1), "compute answer");
//!
//! assert_eq!(answer.blocking_get().unwrap(), 42);
//! ```

#![warn(missing_docs)]

mod bridge;
mod combinators;
mod compose;
mod defer;
mod error;
mod executor;
mod promise;
mod scheduler;


pub use bridge::Settled;
pub use compose::{all_map, collect_all, collect_first, hedge};
pub use error::{FutureError, Try};
pub use executor::{Executor, ExecutorRef, InlineExecutor, Task};
pub use promise::{ComposableFuture, Promise};
pub use scheduler::{CancellationToken, Scheduler, SchedulerRef, TokioScheduler};
