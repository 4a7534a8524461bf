//! Cache Entry Module
//!
//! Defines individual cache entries with an absolute expiry. Entries serialize as
//! `{ "key": ..., "value": ..., "expires": <epoch ms> }`, the snapshot layout.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// == Cache Entry ==
/// A stored value with its absolute expiry time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// Key the entry was stored under
    pub key: String,
    /// The stored value
    pub value: V,
    /// Expiration timestamp (Unix milliseconds). `0` means already expired.
    pub expires: i64,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates an entry living for `ttl_ms` milliseconds from now.
    ///
    /// A non-positive TTL stores the entry already expired: it stays in the
    /// table but no read will return it.
    pub fn new(key: String, value: V, ttl_ms: i64) -> Self {
        let expires = if ttl_ms > 0 {
            current_timestamp_ms().saturating_add(ttl_ms)
        } else {
            0
        };

        Self {
            key,
            value,
            expires,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is readable only while `expires > now`, so it is expired from
    /// the exact millisecond its TTL elapses.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Checks expiry against a caller-supplied clock reading.
    ///
    /// # Arguments
    /// * `now_ms` - Unix timestamp in milliseconds
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires <= now_ms
    }

    /// Remaining lifetime in milliseconds, `0` once expired.
    pub fn ttl_remaining_ms(&self) -> i64 {
        self.ttl_remaining_ms_at(current_timestamp_ms())
    }

    /// Remaining lifetime measured from `now_ms`, `0` once expired.
    pub fn ttl_remaining_ms_at(&self, now_ms: i64) -> i64 {
        self.expires.saturating_sub(now_ms).max(0)
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}
