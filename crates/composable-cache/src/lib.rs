//! Caches built on [`composable_futures`].
//!
//! - [`KeyValueBackend`] is the contract of a remote key-value store with compare-and-swap
//!   support. [`MemoryBackend`] implements it in process memory.
//! - [`TypedCache`] addresses values by logical keys. [`BackendCache`] implements it on top of
//!   any backend, and [`cas::update`] provides optimistic read-modify-write updates.
//! - [`LoadingCacheDelegate`] loads missing values through a [`CacheLoader`], sharing
//!   concurrent loads of the same key.

#[macro_use]
pub mod metrics;

pub mod backend;
pub mod cas;
pub mod config;
pub mod logging;

mod error;
mod inflight;
mod key;
mod loading;
mod memory;
mod typed;

pub use backend::{CasOutcome, CasValue, CasVersion, Expiration, KeyValueBackend};
pub use cas::EntryMapper;
pub use config::{CasConfig, Config, LoadingCacheConfig, MemoryConfig};
pub use error::CacheError;
pub use inflight::{InFlight, InFlightLoads};
pub use key::{CacheKeyTranslator, HashedKeyTranslator};
pub use loading::{CacheLoader, LoadingCacheDelegate, LoadingCacheStats};
pub use memory::MemoryBackend;
pub use typed::{BackendCache, TypedCache};
