//! Time-bounded, request-coalescing caches for asynchronously produced data.
//!
//! [`Cached`] holds a single value behind an update function; [`CachedCollection`]
//! holds a key/value mapping fetched in batches. Both serve possibly-stale data
//! immediately where the policy allows it, while guaranteeing at most one
//! concurrent refresh per cached unit: concurrent callers for the same unit
//! share the result of one underlying fetch.

pub mod cached;
pub mod clock;
pub mod collection;
pub mod error;

pub use cached::Cached;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collection::CachedCollection;
pub use error::{BoxError, CacheError, ConfigError};
