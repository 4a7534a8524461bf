//! Query Throttle - Request throttling core for API clients
//!
//! Provides a counting mutex with FIFO hand-off, a rate limiter bounding both
//! concurrency and starts per time window, and a TTL cache for responses.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod sync;
mod tasks;

pub use cache::{Cache, CacheRegistry};
pub use client::Client;
pub use config::Config;
pub use error::CacheError;
pub use sync::{Mutex, RateLimiter};
