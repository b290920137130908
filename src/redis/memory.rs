use crate::errors::{GatewayError, Result};
use crate::redis::{BucketSnapshot, SharedStore, WindowCounts};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

#[derive(Debug)]
struct Inner {
    windows: DashMap<String, u64>,
    buckets: DashMap<String, Bucket>,
    messages: broadcast::Sender<(String, Vec<u8>)>,
    delay_ms: AtomicU64,
    available: AtomicBool,
}

/// In-process shared store with the same atomicity as the Lua scripts.
///
/// Clones share state, so several limiters built over clones behave like
/// gateway instances sharing one Redis. Latency and outages can be injected.
/// Keys never expire.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(1_024);
        Self {
            inner: Arc::new(Inner {
                windows: DashMap::new(),
                buckets: DashMap::new(),
                messages,
                delay_ms: AtomicU64::new(0),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Every call sleeps this long before touching state.
    pub fn set_delay(&self, delay_ms: u64) {
        self.inner.delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    /// While unavailable every call fails with a connection error.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Relaxed);
    }

    /// Current value of a window counter
    pub fn window_count(&self, key: &str) -> u64 {
        self.inner.windows.get(key).map(|v| *v).unwrap_or(0)
    }

    async fn gate(&self) -> Result<()> {
        let delay = self.inner.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.inner.available.load(Ordering::Relaxed) {
            return Err(GatewayError::StoreConnection("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_window(
        &self,
        current_key: &str,
        previous_key: &str,
        delta: u64,
        _ttl_ms: u64,
    ) -> Result<WindowCounts> {
        self.gate().await?;

        let current = {
            let mut entry = self.inner.windows.entry(current_key.to_string()).or_insert(0);
            *entry += delta;
            *entry
        };
        let previous = self.window_count(previous_key);

        Ok(WindowCounts { current, previous })
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_per_ms: f64,
        delta: u64,
        now_ms: u64,
        _ttl_ms: u64,
    ) -> Result<BucketSnapshot> {
        self.gate().await?;

        let capacity = capacity as f64;
        let mut bucket = self.inner.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill_ms: now_ms,
        });

        let elapsed = now_ms.saturating_sub(bucket.last_refill_ms);
        bucket.tokens = (bucket.tokens + elapsed as f64 * refill_per_ms).min(capacity);
        bucket.last_refill_ms = bucket.last_refill_ms.max(now_ms);

        let granted = bucket.tokens >= delta as f64;
        bucket.tokens = if granted {
            bucket.tokens - delta as f64
        } else {
            0.0
        };

        Ok(BucketSnapshot {
            tokens: bucket.tokens,
            last_refill_ms: bucket.last_refill_ms,
            granted,
        })
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.gate().await?;
        // No subscribers is not an error
        let _ = self.inner.messages.send((channel.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        self.gate().await?;

        let channel = channel.to_string();
        let rx = self.inner.messages.subscribe();

        Ok(stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((name, payload)) if name == channel => return Some((payload, rx)),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed())
    }

    async fn health_check(&self) -> Result<()> {
        self.gate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_counts_shared_between_clones() {
        let store = MemoryStore::new();
        let other = store.clone();

        store.incr_window("w:2", "w:1", 3, 1_000).await.unwrap();
        let counts = other.incr_window("w:2", "w:1", 2, 1_000).await.unwrap();

        assert_eq!(counts, WindowCounts { current: 5, previous: 0 });
    }

    #[tokio::test]
    async fn test_bucket_refills_and_denies() {
        let store = MemoryStore::new();

        let snap = store.take_tokens("b", 10, 0.01, 10, 0, 2_000).await.unwrap();
        assert!(snap.granted);
        assert_eq!(snap.tokens, 0.0);

        let snap = store.take_tokens("b", 10, 0.01, 6, 500, 2_000).await.unwrap();
        assert!(!snap.granted);

        let snap = store.take_tokens("b", 10, 0.01, 5, 1_000, 2_000).await.unwrap();
        assert!(snap.granted);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = store.health_check().await.unwrap_err();
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_channel() {
        let store = MemoryStore::new();
        let mut updates = store.subscribe("usage").await.unwrap();

        store.publish("other", vec![1]).await.unwrap();
        store.publish("usage", vec![2]).await.unwrap();

        assert_eq!(updates.next().await, Some(vec![2]));
    }
}
