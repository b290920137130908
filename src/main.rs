use arc_swap::ArcSwap;
use inferlimit::clock::{Clock, SystemClock};
use inferlimit::config::loader::{build_policy_cache, limits_path, load_config};
use inferlimit::config::watcher::watch_config_file;
use inferlimit::coordinator::{spawn_sync_worker, Coordinator, SyncQueue};
use inferlimit::quota::{BillingService, HttpBillingService, StaticBillingService};
use inferlimit::redis::pool::create_redis_pool;
use inferlimit::redis::{RedisStore, SharedStore};
use inferlimit::{start_server, AppState, HybridLimiter, ServerConfig, UsageQuotaTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BILLING_TIMEOUT_MS: u64 = 2_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inferlimit=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Admission gateway starting...");

    let config = load_config().await?;
    let policies = Arc::new(ArcSwap::from_pointee(build_policy_cache(&config.limits)));

    let pool = create_redis_pool(&config.redis).await?;
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::new(pool, &config.redis.url).await?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&store),
        config.limits.circuit_breaker.clone(),
        Arc::clone(&clock),
    ));

    let (queue, rx) = SyncQueue::new(config.limits.sync.queue_capacity);
    let limiter = Arc::new(HybridLimiter::new(
        Arc::clone(&policies),
        Arc::clone(&coordinator),
        queue,
        Arc::clone(&clock),
    ));
    spawn_sync_worker(Arc::clone(&limiter), rx, config.limits.sync.clone());

    let watched = Arc::clone(&policies);
    tokio::spawn(async move {
        if let Err(e) = watch_config_file(limits_path().into(), watched).await {
            tracing::error!("Limits file watcher stopped: {}", e);
        }
    });

    let billing: Arc<dyn BillingService> = match &config.limits.quota.billing_url {
        Some(url) => Arc::new(HttpBillingService::new(
            url,
            Duration::from_millis(BILLING_TIMEOUT_MS),
        )?),
        None => {
            tracing::warn!("No billing_url configured; quota totals are kept in process only");
            Arc::new(StaticBillingService::new())
        }
    };

    let quota = Arc::new(UsageQuotaTracker::new(
        Arc::clone(&policies),
        store,
        billing,
        clock,
    ));
    Arc::clone(&quota).spawn_subscriber();
    Arc::clone(&quota).spawn_reconciler();

    let mut degraded = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match degraded.recv().await {
                Ok(event) => tracing::warn!(
                    key = %event.key,
                    reason = event.reason,
                    at_ms = event.at_ms,
                    "Admission degraded to local limits"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} degraded signals", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server_config = ServerConfig::from_env();
    tracing::info!("Server will listen on: {}", server_config.addr());

    start_server(server_config, AppState { limiter, quota }).await?;

    Ok(())
}
