//! Client Boundary Module
//!
//! The point where an API client meets the throttling core: every outbound
//! operation runs under a rate-limiter permit, and responses may be served from
//! or stored into an injected cache.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cache::{Cache, CacheRegistry};
use crate::sync::RateLimiter;

// == Client ==
/// Throttled, optionally cached access to a remote API.
///
/// The limiter and cache are both injected, so tests can hand each client an
/// isolated cache instead of the process-wide default.
#[derive(Debug)]
pub struct Client<V = Value> {
    limiter: RateLimiter,
    cache: Arc<Cache<V>>,
}

impl<V> Client<V> {
    /// Creates a client around a limiter and the cache it reads through.
    ///
    /// # Arguments
    /// * `limiter` - Shared rate limiter; clones share one budget
    /// * `cache` - Cache for responses of `cached` calls
    pub fn new(limiter: RateLimiter, cache: Arc<Cache<V>>) -> Self {
        Self { limiter, cache }
    }

    /// Uses the registry's default cache.
    pub fn from_registry(limiter: RateLimiter, registry: &CacheRegistry<V>) -> Self {
        Self::new(limiter, registry.default_cache())
    }

    /// The limiter every outbound operation runs under.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The cache backing `cached` calls.
    pub fn cache(&self) -> &Arc<Cache<V>> {
        &self.cache
    }

    // == Throttled ==
    /// Runs one outbound operation under a limiter permit.
    ///
    /// The permit is released when the operation finishes, fails, or is dropped.
    pub async fn throttled<F, Fut>(&self, operation: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _permit = self.limiter.acquire().await;
        operation().await
    }

    // == Cached ==
    /// Serves `key` from the cache, or fetches it under a permit and keeps a
    /// successful result for the cache's default TTL.
    pub async fn cached<F, Fut, E>(&self, key: &str, operation: F) -> Result<V, E>
    where
        V: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let ttl_ms = self.cache.default_ttl_ms();
        self.cached_with_ttl(key, ttl_ms, operation).await
    }

    /// Like [`Client::cached`] with an explicit TTL. Errors are never cached.
    pub async fn cached_with_ttl<F, Fut, E>(
        &self,
        key: &str,
        ttl_ms: i64,
        operation: F,
    ) -> Result<V, E>
    where
        V: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.cache.get(key) {
            debug!(key, "served from cache");
            return Ok(value);
        }

        let value = self.throttled(operation).await?;
        self.cache.set_with_ttl(key, value.clone(), ttl_ms);
        Ok(value)
    }
}

impl<V> Clone for Client<V> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            cache: self.cache.clone(),
        }
    }
}
