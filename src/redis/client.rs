use crate::errors::{GatewayError, Result};
use crate::redis::script::{bucket_script, load_scripts, window_script};
use crate::redis::{BucketSnapshot, SharedStore, WindowCounts};
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use tracing::{debug, error, warn};

/// Redis-backed shared store
pub struct RedisStore {
    pool: Pool,

    /// Pub/sub needs a dedicated connection outside the pool
    client: redis::Client,
}

impl RedisStore {
    /// Create a new Redis store. Script loading failures are tolerated;
    /// EVALSHA falls back to EVAL on the first call.
    pub async fn new(pool: Pool, url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::Config(format!("Invalid Redis URL: {}", e)))?;

        let store = Self { pool, client };
        match store.connection().await {
            Ok(mut conn) => {
                if let Err(e) = load_scripts(&mut *conn).await {
                    warn!("Could not preload Lua scripts: {}", e);
                }
            }
            Err(e) => warn!("Skipping Lua script preload: {}", e),
        }

        Ok(store)
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            GatewayError::StoreConnection(format!("Pool exhausted: {}", e))
        })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr_window(
        &self,
        current_key: &str,
        previous_key: &str,
        delta: u64,
        ttl_ms: u64,
    ) -> Result<WindowCounts> {
        let mut conn = self.connection().await?;

        debug!(
            "Executing window script: key={}, delta={}, ttl={}ms",
            current_key, delta, ttl_ms
        );

        let (current, previous): (i64, i64) = window_script()
            .key(current_key)
            .key(previous_key)
            .arg(delta)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;

        Ok(WindowCounts {
            current: current.max(0) as u64,
            previous: previous.max(0) as u64,
        })
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_per_ms: f64,
        delta: u64,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<BucketSnapshot> {
        let mut conn = self.connection().await?;

        debug!(
            "Executing bucket script: key={}, capacity={}, delta={}",
            key, capacity, delta
        );

        let (tokens, last_refill_ms, granted): (String, i64, i64) = bucket_script()
            .key(key)
            .arg(capacity)
            .arg(refill_per_ms)
            .arg(delta)
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;

        let tokens = tokens.parse::<f64>().map_err(|e| {
            GatewayError::Serialization(format!("Failed to parse bucket tokens '{}': {}", tokens, e))
        })?;

        Ok(BucketSnapshot {
            tokens: tokens.max(0.0),
            last_refill_ms: last_refill_ms.max(0) as u64,
            granted: granted == 1,
        })
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.connection().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!("Published on {} to {} subscribers", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        let response: String = redis::cmd("PING").query_async(&mut *conn).await?;

        if response != "PONG" {
            return Err(GatewayError::StoreConnection(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}
