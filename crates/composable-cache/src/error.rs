use std::time::Duration;

use composable_futures::FutureError;
use thiserror::Error;

/// Failures specific to the cache layer.
///
/// These travel through futures inside [`FutureError::Custom`], use
/// [`CacheError::from_future_error`] to get them back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The key-value backend failed.
    #[error("cache backend error: {0}")]
    Backend(String),
    /// The loader failed.
    #[error("loader error: {0}")]
    Loader(String),
    /// A cache lookup did not complete within its time budget.
    #[error("cache lookup timed out after {0:?}")]
    CacheTimeout(Duration),
    /// A load did not complete within its time budget.
    #[error("load timed out after {0:?}")]
    LoaderTimeout(Duration),
    /// The whole lookup, including cache lookup and load, did not complete in time.
    #[error("global timeout after {0:?}")]
    GlobalTimeout(Duration),
}

impl CacheError {
    /// Returns the cache error carried by `error`, if there is one.
    pub fn from_future_error(error: &FutureError) -> Option<&CacheError> {
        error.downcast_ref::<CacheError>()
    }

    /// Returns `true` for any of the timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CacheTimeout(_) | Self::LoaderTimeout(_) | Self::GlobalTimeout(_)
        )
    }
}

impl From<CacheError> for FutureError {
    fn from(error: CacheError) -> Self {
        FutureError::custom(error)
    }
}

/// Returns `true` if `error` is a timeout of any kind.
pub(crate) fn is_timeout(error: &FutureError) -> bool {
    error.is_timeout() || CacheError::from_future_error(error).is_some_and(CacheError::is_timeout)
}
