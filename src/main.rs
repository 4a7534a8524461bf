//! Query Throttle - demo driver
//!
//! Issues a burst of simulated API lookups through a throttled, cached client
//! and logs when each one was served.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use query_throttle::cache::DEFAULT_CACHE;
use query_throttle::{Cache, CacheRegistry, Client, Config, RateLimiter};

/// Distinct keys the burst cycles through, so later lookups hit the cache.
const DISTINCT_KEYS: usize = 4;
/// Simulated network latency per fetch.
const FETCH_LATENCY: Duration = Duration::from_millis(50);

/// Main entry point for the demo.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the rate limiter and register the default cache
/// 4. Load the cache snapshot, if configured
/// 5. Run the burst until done or interrupted
/// 6. Persist the snapshot and report cache statistics
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "query_throttle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting query throttle demo");

    let config = Config::from_env();
    info!(
        "Configuration loaded: limit={}, interval={}ms, concurrency={}, cache_ttl={}ms, burst={}",
        config.rate_limit,
        config.rate_interval_ms,
        config.concurrency,
        config.cache_ttl_ms,
        config.burst
    );

    let registry = CacheRegistry::<Value>::global();
    registry.insert(
        DEFAULT_CACHE,
        Arc::new(Cache::with_default_ttl(config.cache_ttl_ms)),
    );
    let client = Client::from_registry(RateLimiter::from_config(&config), registry);

    if let Some(path) = config.snapshot_path.as_deref().filter(|p| p.exists()) {
        client
            .cache()
            .load_file(path)
            .with_context(|| format!("Failed to load cache snapshot {}", path.display()))?;
        info!("Cache snapshot loaded: {} entries", client.cache().len());
    }

    tokio::select! {
        _ = run_burst(&client, config.burst) => {
            info!("Burst complete");
        }
        _ = shutdown_signal() => {
            warn!("Burst interrupted");
        }
    }

    if let Some(path) = config.snapshot_path.as_deref() {
        client
            .cache()
            .save_file(path)
            .with_context(|| format!("Failed to save cache snapshot {}", path.display()))?;
        info!("Cache snapshot saved to {}", path.display());
    }

    let stats = client.cache().stats();
    info!(
        "Cache stats: hits={}, misses={}, expirations={}, hit_rate={:.2}",
        stats.hits,
        stats.misses,
        stats.expirations,
        stats.hit_rate()
    );

    Ok(())
}

/// Fires `burst` concurrent lookups and waits for all of them.
async fn run_burst(client: &Client, burst: usize) {
    let start = Instant::now();
    let mut lookups = JoinSet::new();

    for request in 0..burst {
        let client = client.clone();
        let key = format!("problem:{}", request % DISTINCT_KEYS);

        lookups.spawn(async move {
            let fetched = client.cached(&key, || simulated_fetch(key.clone())).await;
            match fetched {
                Ok(_) => info!(
                    request,
                    key = %key,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Lookup served"
                ),
                Err(never) => match never {},
            }
        });
    }

    while let Some(joined) = lookups.join_next().await {
        if let Err(err) = joined {
            warn!("Lookup task failed: {}", err);
        }
    }
}

/// Stands in for a GraphQL round trip.
async fn simulated_fetch(key: String) -> Result<Value, Infallible> {
    tokio::time::sleep(FETCH_LATENCY).await;
    Ok(json!({
        "key": key,
        "fetched_at": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping...");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping...");
        }
    }
}
