//! Cache Store Module
//!
//! Expiring key-value table with lazy expiry: entries are only checked, and
//! dropped when stale, at the moment they are read. There is no background sweep.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::cache::{current_timestamp_ms, CacheEntry, CacheStats, DEFAULT_TTL_MS};
use crate::error::Result;

/// Serialized form of a cache table: key to entry.
pub type Snapshot<V> = HashMap<String, CacheEntry<V>>;

#[derive(Debug)]
struct Table<V> {
    entries: HashMap<String, CacheEntry<V>>,
    stats: CacheStats,
}

// == Cache ==
/// TTL cache shared by reference (usually behind an `Arc`).
///
/// Values are opaque to the cache; the default value type is a JSON value so
/// API responses can be stored as received.
#[derive(Debug)]
pub struct Cache<V = Value> {
    table: Mutex<Table<V>>,
    default_ttl_ms: i64,
}

impl<V> Cache<V> {
    // == Constructor ==
    /// Creates an empty cache whose `set` keeps entries for 60 seconds.
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_TTL_MS)
    }

    /// Creates an empty cache with a custom TTL for `set`.
    pub fn with_default_ttl(default_ttl_ms: i64) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                stats: CacheStats::new(),
            }),
            default_ttl_ms,
        }
    }

    /// TTL in milliseconds applied by `set`.
    pub fn default_ttl_ms(&self) -> i64 {
        self.default_ttl_ms
    }

    // == Get ==
    /// Returns the value if present and not expired.
    ///
    /// An expired entry found here is removed as a side effect.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let mut guard = self.table();
        let table = &mut *guard;
        let now = current_timestamp_ms();

        let found = table
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired_at(now)).then(|| entry.value.clone()));

        match found {
            Some(Some(value)) => {
                table.stats.record_hit();
                Some(value)
            }
            Some(None) => {
                table.entries.remove(key);
                table.stats.record_expiration();
                trace!(key, "cache entry expired");
                None
            }
            None => {
                table.stats.record_miss();
                None
            }
        }
    }

    /// True if `key` holds a readable entry. Does not touch statistics.
    pub fn contains(&self, key: &str) -> bool {
        self.table()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Remaining lifetime of a readable entry.
    pub fn ttl_remaining_ms(&self, key: &str) -> Option<i64> {
        let now = current_timestamp_ms();
        self.table()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.ttl_remaining_ms_at(now))
    }

    // == Set ==
    /// Stores a value for the default TTL, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl_ms);
    }

    /// Stores a value for `ttl_ms` milliseconds.
    ///
    /// A TTL of zero or less stores the entry already expired, so `get` returns
    /// nothing until the key is overwritten or removed.
    ///
    /// # Arguments
    /// * `key` - Cache key
    /// * `value` - Value to store
    /// * `ttl_ms` - Lifetime in milliseconds
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl_ms: i64) {
        let key = key.into();
        let entry = CacheEntry::new(key.clone(), value, ttl_ms);

        let mut table = self.table();
        table.entries.insert(key, entry);
    }

    // == Remove ==
    /// Deletes an entry; removing an absent key does nothing.
    pub fn remove(&self, key: &str) {
        self.table().entries.remove(key);
    }

    // == Clear ==
    /// Drops every entry.
    pub fn clear(&self) {
        let mut table = self.table();
        let dropped = table.entries.len();
        table.entries.clear();
        debug!(dropped, "cache cleared");
    }

    /// Number of stored entries, expired ones not yet read included.
    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().entries.is_empty()
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let table = self.table();
        let mut stats = table.stats.clone();
        stats.set_total_entries(table.entries.len());
        stats
    }

    /// Copies the whole table, expired entries included.
    pub fn snapshot(&self) -> Snapshot<V>
    where
        V: Clone,
    {
        self.table().entries.clone()
    }

    fn table(&self) -> MutexGuard<'_, Table<V>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: DeserializeOwned> Cache<V> {
    // == Load ==
    /// Replaces the whole table with the entries of a JSON snapshot.
    ///
    /// The snapshot is decoded before anything is replaced, so a malformed one
    /// returns an error and leaves the current table untouched.
    pub fn load(&self, json: &str) -> Result<()> {
        let entries: Snapshot<V> = serde_json::from_str(json)?;
        let loaded = entries.len();

        self.table().entries = entries;
        debug!(loaded, "cache snapshot loaded");
        Ok(())
    }

    /// Loads a snapshot previously written by [`Cache::save_file`].
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = fs::read_to_string(path)?;
        self.load(&json)
    }
}

impl<V: Serialize> Cache<V> {
    /// Serializes the table in the snapshot layout.
    pub fn dump(&self) -> Result<String> {
        let table = self.table();
        Ok(serde_json::to_string(&table.entries)?)
    }

    /// Writes the snapshot to `path`.
    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = self.dump()?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl<V> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use serde_json::json;
    use std::thread::sleep;
    use std::time::Duration;

    fn new_cache() -> Cache<String> {
        Cache::new()
    }

    #[test]
    fn test_set_and_get() {
        let cache = new_cache();

        cache.set("test", "test".to_string());
        assert_eq!(cache.get("test").as_deref(), Some("test"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let cache = new_cache();
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_overwrite() {
        let cache = new_cache();

        cache.set("key", "one".to_string());
        cache.set("key", "two".to_string());

        assert_eq!(cache.get("key").as_deref(), Some("two"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_ttl_is_unreadable_but_stored() {
        let cache = new_cache();

        cache.set_with_ttl("test", "test".to_string(), 0);
        assert!(!cache.contains("test"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("test").is_none());
        // The read dropped the tombstone
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overwrite_revives_tombstone() {
        let cache = new_cache();

        cache.set_with_ttl("test", "gone".to_string(), -1);
        cache.set("test", "back".to_string());
        assert_eq!(cache.get("test").as_deref(), Some("back"));
    }

    #[test]
    fn test_ttl_expiration() {
        let cache = new_cache();

        cache.set_with_ttl("test", "test".to_string(), 300);
        assert_eq!(cache.get("test").as_deref(), Some("test"));

        sleep(Duration::from_millis(350));

        assert!(cache.get("test").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.total_entries, 0);
    }

    #[test]
    fn test_default_ttl() {
        let cache: Cache<String> = Cache::with_default_ttl(100);
        assert_eq!(cache.default_ttl_ms(), 100);

        cache.set("short", "lived".to_string());
        let remaining = cache.ttl_remaining_ms("short").unwrap();
        assert!(remaining > 0 && remaining <= 100);

        sleep(Duration::from_millis(150));
        assert!(cache.ttl_remaining_ms("short").is_none());
        assert!(!cache.contains("short"));
        assert_eq!(cache.len(), 1, "Lookups without get leave the entry stored");
    }

    #[test]
    fn test_remove() {
        let cache = new_cache();

        cache.set("test", "test".to_string());
        cache.remove("test");
        assert!(cache.get("test").is_none());

        // Absent key is a no-op
        cache.remove("test");
    }

    #[test]
    fn test_clear() {
        let cache = new_cache();

        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.clear();

        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_load_replaces_table() {
        let cache: Cache = Cache::new();
        cache.set("old", json!("stale"));

        let expires = current_timestamp_ms() + 1_000;
        let snapshot = json!({
            "test": { "key": "test", "value": { "id": 1 }, "expires": expires }
        });
        cache.load(&snapshot.to_string()).unwrap();

        assert_eq!(cache.get("test"), Some(json!({ "id": 1 })));
        assert!(cache.get("old").is_none());
    }

    #[test]
    fn test_load_keeps_expired_entries_unreadable() {
        let cache: Cache = Cache::new();
        let snapshot = json!({
            "past": { "key": "past", "value": 1, "expires": 5 },
            "never": { "key": "never", "value": 2, "expires": 0 }
        });
        cache.load(&snapshot.to_string()).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("past").is_none());
        assert!(cache.get("never").is_none());
    }

    #[test]
    fn test_load_malformed_leaves_table() {
        let cache = new_cache();
        cache.set("keep", "me".to_string());

        let result = cache.load("{\"broken\": ");
        assert!(matches!(result, Err(CacheError::Snapshot(_))));

        let result = cache.load(r#"{"k": {"key": "k", "value": "v"}}"#);
        assert!(matches!(result, Err(CacheError::Snapshot(_))));

        assert_eq!(cache.get("keep").as_deref(), Some("me"));
    }

    #[test]
    fn test_dump_then_load() {
        let source = new_cache();
        source.set("a", "alpha".to_string());
        source.set_with_ttl("b", "beta".to_string(), 0);

        let target = new_cache();
        target.load(&source.dump().unwrap()).unwrap();

        assert_eq!(target.snapshot(), source.snapshot());
        assert_eq!(target.get("a").as_deref(), Some("alpha"));
        assert!(target.get("b").is_none());
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!(
            "query_throttle_store_{}.json",
            std::process::id()
        ));

        let source = new_cache();
        source.set("persisted", "value".to_string());
        source.save_file(&path).unwrap();

        let target = new_cache();
        target.load_file(&path).unwrap();
        assert_eq!(target.get("persisted").as_deref(), Some("value"));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(target.load_file(&path), Err(CacheError::Io(_))));
    }

    #[test]
    fn test_stats() {
        let cache = new_cache();

        cache.set("key1", "value1".to_string());
        cache.get("key1");
        cache.get("nonexistent");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_entries, 1);
    }
}
