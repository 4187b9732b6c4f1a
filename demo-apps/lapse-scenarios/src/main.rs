use anyhow::{ensure, Result};
use futures::future::join_all;
use lapse_core::{Cache, CacheConfig, CacheError, Expiry};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Scenario settings read from the environment
struct Settings {
    default_ttl: Duration,
    extend_on_read: bool,
    port_capacity: usize,
}

impl Settings {
    /// Reads:
    /// - `LAPSE_DEFAULT_TTL_MS` - TTL for plain `set` calls (default 500)
    /// - `LAPSE_EXTEND_ON_READ` - `true`/`false` (default false)
    /// - `LAPSE_PORT_CAPACITY` - per-entry mailbox depth (default 16)
    fn from_env() -> Self {
        let default_ttl_ms: u64 = std::env::var("LAPSE_DEFAULT_TTL_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .unwrap_or(500);
        let extend_on_read = std::env::var("LAPSE_EXTEND_ON_READ")
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false);
        let port_capacity = std::env::var("LAPSE_PORT_CAPACITY")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(lapse_core::DEFAULT_PORT_CAPACITY);

        Self {
            default_ttl: Duration::from_millis(default_ttl_ms),
            extend_on_read,
            port_capacity,
        }
    }

    fn config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_default_ttl(self.default_ttl)
            .with_extend_on_read(self.extend_on_read)
            .with_port_capacity(self.port_capacity)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lapse_scenarios=info,lapse_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env();

    tracing::info!("🧪 Lapse Scenarios");
    tracing::info!("   Default TTL: {:?}", settings.default_ttl);
    tracing::info!("   Extend on read: {}", settings.extend_on_read);
    println!();

    test_expiration().await?;
    test_extend_on_read().await?;
    test_update_rearms().await?;
    test_parallel_set_get(&settings).await?;
    test_teardown().await?;

    println!();
    tracing::info!("✅ All scenarios passed!");

    Ok(())
}

fn unique_key(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// TTL=500ms without extension: readable at 200ms, gone at 600ms
async fn test_expiration() -> Result<()> {
    tracing::info!("Test: TTL Expiration");

    let cache = Cache::new(None, Duration::from_millis(500), false);
    let key = unique_key("expire");

    cache.set(key.clone(), "a".to_string()).await?;

    sleep(Duration::from_millis(200)).await;
    ensure!(
        cache.get(&key).await.as_deref() == Some("a"),
        "Key should still be present at 200ms"
    );

    tracing::info!("   Waiting until 600ms for expiration...");
    sleep(Duration::from_millis(400)).await;
    ensure!(cache.get(&key).await.is_none(), "Key should have expired");
    ensure!(
        !cache.contains_key(&key),
        "Expired entry should have removed itself"
    );

    tracing::info!("   ✓ TTL expiration works correctly");
    Ok(())
}

/// TTL=1s with extension: reads every 400ms for 3s keep it alive
async fn test_extend_on_read() -> Result<()> {
    tracing::info!("Test: Extend on Read");

    let cache = Cache::new(None, Duration::from_secs(1), true);
    let key = unique_key("extend");

    cache.set(key.clone(), "a".to_string()).await?;

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(3) {
        sleep(Duration::from_millis(400)).await;
        ensure!(
            cache.get(&key).await.as_deref() == Some("a"),
            "Key expired after {:?} despite regular reads",
            start.elapsed()
        );
    }

    tracing::info!("   Reads stopped, waiting 1.2s...");
    sleep(Duration::from_millis(1200)).await;
    ensure!(cache.get(&key).await.is_none(), "Key should expire once reads stop");

    tracing::info!("   ✓ Extend on read works correctly");
    Ok(())
}

/// An update replaces the value and rearms the timer from the moment of the update
async fn test_update_rearms() -> Result<()> {
    tracing::info!("Test: Update Rearms Expiry");

    let cache = Cache::new(None, Duration::from_millis(300), false);
    let key = unique_key("update");

    cache.set(key.clone(), "v1".to_string()).await?;
    sleep(Duration::from_millis(200)).await;
    cache
        .set_ttl(key.clone(), "v2".to_string(), Duration::from_millis(600))
        .await?;

    sleep(Duration::from_millis(300)).await;
    ensure!(
        cache.get(&key).await.as_deref() == Some("v2"),
        "Updated value should outlive the original deadline"
    );

    cache
        .set_ttl(key.clone(), "v3".to_string(), Expiry::Never)
        .await?;
    ensure!(
        cache.get(&key).await.as_deref() == Some("v3"),
        "Update without TTL should still replace the value"
    );

    tracing::info!("   ✓ Updates replace values and rearm expiry");
    Ok(())
}

/// Parallel SET and GET on distinct keys - verify no data mixing
async fn test_parallel_set_get(settings: &Settings) -> Result<()> {
    let num_operations = 500;
    tracing::info!("Test: Parallel SET/GET ({} concurrent operations)", num_operations);

    let config = settings.config().with_default_ttl(Duration::from_secs(60));
    let cache = Cache::with_config(None, config);

    let test_data: Vec<(String, String)> = (0..num_operations)
        .map(|i| (unique_key(&format!("parallel-{}", i)), format!("value-{}", i)))
        .collect();

    let start = Instant::now();
    let set_futures = test_data.iter().map(|(key, value)| {
        let cache = cache.clone();
        let key = key.clone();
        let value = value.clone();
        async move { cache.set(key, value).await }
    });
    for result in join_all(set_futures).await {
        result?;
    }
    tracing::info!("   SET {} keys in {:?}", num_operations, start.elapsed());

    let start = Instant::now();
    let get_futures = test_data.iter().map(|(key, value)| {
        let cache = cache.clone();
        async move {
            let found = cache.get(key).await;
            if found.as_ref() != Some(value) {
                tracing::error!("Value mismatch for {}: {:?}", key, found);
                return false;
            }
            true
        }
    });
    let matched = join_all(get_futures).await.into_iter().filter(|ok| *ok).count();
    tracing::info!("   GET {} keys in {:?}", num_operations, start.elapsed());

    ensure!(
        matched == num_operations,
        "Only {} of {} values matched",
        matched,
        num_operations
    );

    tracing::info!("   ✓ All {} values verified correctly", num_operations);
    Ok(())
}

/// Canceling the parent scope tears everything down and rejects writes
async fn test_teardown() -> Result<()> {
    tracing::info!("Test: Teardown");

    let parent = CancellationToken::new();
    let cache = Cache::new(Some(parent.clone()), Expiry::Never, false);

    for i in 0..10 {
        cache.set(format!("teardown-{}", i), i).await?;
    }
    ensure!(cache.len() == 10, "Expected 10 live entries");

    parent.cancel();

    match cache.set("late".to_string(), 99).await {
        Err(CacheError::Canceled) => {}
        other => anyhow::bail!("Expected canceled instance error, got {:?}", other),
    }
    ensure!(
        cache.get(&"teardown-0".to_string()).await.is_none(),
        "Reads should miss after teardown"
    );
    ensure!(cache.is_sealed(), "Cache should be sealed");

    tracing::info!("   ✓ Teardown seals the cache and rejects writes");
    Ok(())
}
