//! Cache Module
//!
//! Provides in-memory caching with lazy TTL expiry, JSON snapshots, and a
//! registry of named cache instances.

mod entry;
mod registry;
mod stats;
mod store;


// Re-export public types
pub use entry::{current_timestamp_ms, CacheEntry};
pub use registry::{CacheRegistry, DEFAULT_CACHE};
pub use stats::CacheStats;
pub use store::{Cache, Snapshot};

// == Public Constants ==
/// TTL applied by `Cache::set` unless the cache was built with another one
pub const DEFAULT_TTL_MS: i64 = 60_000;
