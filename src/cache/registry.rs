//! Cache Registry Module
//!
//! Named cache instances. A registry always holds a `"default"` cache, which
//! collaborators fall back to when they are not handed a cache of their own.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::cache::Cache;

/// Name of the cache every registry creates up front.
pub const DEFAULT_CACHE: &str = "default";

// == Cache Registry ==
/// Independently addressable caches keyed by name.
#[derive(Debug)]
pub struct CacheRegistry<V = Value> {
    caches: RwLock<HashMap<String, Arc<Cache<V>>>>,
}

impl<V> CacheRegistry<V> {
    /// Creates a registry holding only an empty default cache.
    pub fn new() -> Self {
        Self::with_default(Arc::new(Cache::new()))
    }

    /// Creates a registry around an existing default cache.
    pub fn with_default(cache: Arc<Cache<V>>) -> Self {
        let mut caches = HashMap::new();
        caches.insert(DEFAULT_CACHE.to_string(), cache);
        Self {
            caches: RwLock::new(caches),
        }
    }

    /// Returns the `"default"` cache.
    pub fn default_cache(&self) -> Arc<Cache<V>> {
        self.get_or_create(DEFAULT_CACHE)
    }

    /// Looks up a registered cache without creating it.
    ///
    /// # Arguments
    /// * `name` - Registered cache name
    pub fn get(&self, name: &str) -> Option<Arc<Cache<V>>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns the named cache, creating an empty one on first use.
    ///
    /// # Arguments
    /// * `name` - Cache name; new caches use the default TTL
    pub fn get_or_create(&self, name: &str) -> Arc<Cache<V>> {
        if let Some(cache) = self.get(name) {
            return cache;
        }

        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "cache created");
                Arc::new(Cache::new())
            })
            .clone()
    }

    /// Registers `cache` under `name`, returning the cache it replaced.
    ///
    /// # Arguments
    /// * `name` - Cache name, `"default"` included
    /// * `cache` - Shared cache instance to register
    pub fn insert(&self, name: impl Into<String>, cache: Arc<Cache<V>>) -> Option<Arc<Cache<V>>> {
        self.caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), cache)
    }

    /// Unregisters a named cache. The default cache cannot be removed, only cleared.
    pub fn remove(&self, name: &str) -> Option<Arc<Cache<V>>> {
        if name == DEFAULT_CACHE {
            return None;
        }
        self.caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }
}

impl CacheRegistry<Value> {
    /// The process-wide registry, built on first use and never dropped.
    ///
    /// Pass it (or its caches) explicitly to the components that need it; tests
    /// should construct their own registry instead.
    pub fn global() -> &'static CacheRegistry<Value> {
        static GLOBAL: OnceLock<CacheRegistry<Value>> = OnceLock::new();
        GLOBAL.get_or_init(CacheRegistry::new)
    }
}

impl<V> Default for CacheRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}
