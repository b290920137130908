use crate::config::RedisConfig;
use crate::errors::{GatewayError, Result};
use deadpool::managed::PoolConfig as DeadpoolPoolConfig;
use deadpool_redis::{Config as DeadpoolRedisConfig, Pool, Runtime};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Create a Redis connection pool from configuration.
///
/// An unreachable Redis at startup is logged, not fatal: the pool connects
/// lazily and the coordinator runs degraded until Redis answers.
pub async fn create_redis_pool(config: &RedisConfig) -> Result<Pool> {
    info!("Creating Redis connection pool...");

    let mut cfg = DeadpoolRedisConfig::from_url(config.url.clone());

    let mut pool_config = DeadpoolPoolConfig::new(config.max_connections);
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    pool_config.timeouts.create = Some(connect_timeout);
    pool_config.timeouts.wait = Some(connect_timeout);
    cfg.pool = Some(pool_config);

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| GatewayError::Config(format!("Redis pool creation failed: {}", e)))?;

    info!(
        "Redis connection pool created (max_connections: {})",
        config.max_connections
    );

    debug!("Testing Redis connection...");
    match ping(&pool).await {
        Ok(()) => info!("Redis connection test successful"),
        Err(e) => warn!("Redis is not reachable yet ({}); starting in degraded mode", e),
    }

    Ok(pool)
}

async fn ping(pool: &Pool) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| GatewayError::StoreConnection(format!("Failed to get connection: {}", e)))?;

    let _pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}
