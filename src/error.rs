use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error produced by user-supplied update and fetch functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Construction-time failures. No cache instance exists with an unusable
/// configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ttl {0:?} is not usable, must be at least one millisecond")]
    InvalidTtl(Duration),
    #[error("purge interval {0:?} is not usable, must be at least one millisecond")]
    InvalidPurgeInterval(Duration),
}

/// Failures surfaced while serving data.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The update or batch fetch function failed. Every caller awaiting the
    /// same in-flight fetch observes this same error, and the in-flight slot
    /// is cleared so the next access can retry.
    #[error("fetch failed: {0}")]
    Fetch(Arc<dyn std::error::Error + Send + Sync>),
    /// Requested keys were rejected by the key guard before any fetch was
    /// attempted or any state was touched.
    #[error("keys rejected by key guard: {0}")]
    InvalidKeys(String),
}

impl CacheError {
    pub(crate) fn fetch(err: BoxError) -> Self {
        CacheError::Fetch(Arc::from(err))
    }
}
