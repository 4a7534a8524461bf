//! Throttling Primitives
//!
//! Provides the counting [`Mutex`] and the [`RateLimiter`] composed from two of them.

mod limiter;
mod mutex;

pub use limiter::{
    LimiterEvent, LimiterPermit, RateLimiter, DEFAULT_CONCURRENCY, DEFAULT_INTERVAL, DEFAULT_LIMIT,
};
pub use mutex::{Mutex, MutexEvent, MutexPermit};

pub(crate) use limiter::Inner as LimiterInner;
