//! Configuration Module
//!
//! Handles loading throttle and cache settings from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Throttle and cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of operations started per window
    pub rate_limit: usize,
    /// Window length in milliseconds
    pub rate_interval_ms: u64,
    /// Maximum number of operations in flight at once
    pub concurrency: usize,
    /// Default TTL in milliseconds for cache entries
    pub cache_ttl_ms: i64,
    /// Optional path of a persisted cache snapshot
    pub snapshot_path: Option<PathBuf>,
    /// Number of simulated lookups issued by the demo binary
    pub burst: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `RATE_LIMIT` - Operations started per window (default: 20)
    /// - `RATE_INTERVAL_MS` - Window length in milliseconds (default: 10000)
    /// - `RATE_CONCURRENCY` - Operations in flight (default: 2)
    /// - `CACHE_TTL_MS` - Default cache TTL in milliseconds (default: 60000)
    /// - `CACHE_SNAPSHOT` - Snapshot file path (default: unset)
    /// - `BURST` - Demo request count (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rate_limit: parse_var("RATE_LIMIT").unwrap_or(defaults.rate_limit),
            rate_interval_ms: parse_var("RATE_INTERVAL_MS").unwrap_or(defaults.rate_interval_ms),
            concurrency: parse_var("RATE_CONCURRENCY").unwrap_or(defaults.concurrency),
            cache_ttl_ms: parse_var("CACHE_TTL_MS").unwrap_or(defaults.cache_ttl_ms),
            snapshot_path: env::var_os("CACHE_SNAPSHOT")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            burst: parse_var("BURST").unwrap_or(defaults.burst),
        }
    }

    /// Window length as a Duration.
    pub fn rate_interval(&self) -> Duration {
        Duration::from_millis(self.rate_interval_ms)
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_limit: 20,
            rate_interval_ms: 10_000,
            concurrency: 2,
            cache_ttl_ms: 60_000,
            snapshot_path: None,
            burst: 10,
        }
    }
}
