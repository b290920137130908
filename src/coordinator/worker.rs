//! Background reconciliation: one ticker scans for due keys and feeds a
//! bounded work queue drained by a few consumers.

use crate::config::SyncConfig;
use crate::limiter::{HybridLimiter, RateLimitKey};
use crate::metrics;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Producer side of the sync work queue. A key is queued at most once until
/// a consumer picks it up.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<RateLimitKey>,
    queued: Arc<DashMap<RateLimitKey, ()>>,
}

impl SyncQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RateLimitKey>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                queued: Arc::new(DashMap::new()),
            },
            rx,
        )
    }

    /// Queue `key` for a sync. Full queue drops the request; the next tick
    /// picks the key up again.
    pub fn request(&self, key: &RateLimitKey) {
        if self.queued.insert(key.clone(), ()).is_some() {
            return;
        }
        if self.tx.try_send(key.clone()).is_err() {
            self.queued.remove(key);
            metrics::record_sync_dropped();
        }
    }

    fn done(&self, key: &RateLimitKey) {
        self.queued.remove(key);
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// Spawn the ticker and `config.workers` consumers.
pub fn spawn_sync_worker(
    limiter: Arc<HybridLimiter>,
    rx: mpsc::Receiver<RateLimitKey>,
    config: SyncConfig,
) -> Vec<JoinHandle<()>> {
    info!(
        "Starting sync worker (tick: {}ms, consumers: {})",
        config.tick_ms, config.workers
    );

    let rx = Arc::new(Mutex::new(rx));
    let mut handles = Vec::with_capacity(config.workers + 1);

    for id in 0..config.workers.max(1) {
        let limiter = Arc::clone(&limiter);
        let rx = Arc::clone(&rx);
        handles.push(tokio::spawn(async move {
            loop {
                let key = match rx.lock().await.recv().await {
                    Some(key) => key,
                    None => break,
                };
                limiter.queue().done(&key);
                debug!(worker = id, key = %key, "Background sync");
                limiter.sync_key(&key).await;
            }
            debug!(worker = id, "Sync consumer stopped");
        }));
    }

    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            for key in limiter.due_keys() {
                limiter.queue().request(&key);
            }
            limiter.evict_idle();
        }
    }));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_dedupes_until_consumed() {
        let (queue, mut rx) = SyncQueue::new(8);
        let key = RateLimitKey::new("t", "m");

        queue.request(&key);
        queue.request(&key);
        assert_eq!(rx.try_recv().unwrap(), key);
        assert!(rx.try_recv().is_err());

        queue.done(&key);
        queue.request(&key);
        assert_eq!(rx.try_recv().unwrap(), key);
    }

    #[test]
    fn test_full_queue_drops_request() {
        let (queue, mut rx) = SyncQueue::new(1);
        let a = RateLimitKey::new("a", "m");
        let b = RateLimitKey::new("b", "m");

        queue.request(&a);
        queue.request(&b);
        assert_eq!(queue.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), a);
        assert!(rx.try_recv().is_err());
    }
}
