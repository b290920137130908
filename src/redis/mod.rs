pub mod client;
pub mod memory;
pub mod pool;
pub mod script;

use crate::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use client::RedisStore;
pub use memory::MemoryStore;

/// Counts for the current window and the one before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    pub current: u64,
    pub previous: u64,
}

/// Shared bucket after a refill-then-take
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub last_refill_ms: u64,
    /// False when the bucket could not cover the taken amount
    pub granted: bool,
}

/// The shared low-latency store. Treated as unreliable: callers bound every
/// call with their own deadline and never depend on it for availability.
/// Every mutation is a single atomic operation on the store side.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Add `delta` to the current window counter and read both windows
    async fn incr_window(
        &self,
        current_key: &str,
        previous_key: &str,
        delta: u64,
        ttl_ms: u64,
    ) -> Result<WindowCounts>;

    /// Refill the shared bucket to `now_ms`, then take `delta` tokens
    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_per_ms: f64,
        delta: u64,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<BucketSnapshot>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Stream of payloads published on `channel` from now on
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<()>;
}
