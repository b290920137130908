pub mod breaker;
pub mod worker;

use crate::clock::Clock;
use crate::config::{BreakerConfig, RateLimitConfig};
use crate::errors::{GatewayError, Result};
use crate::limiter::{
    window_start, Algorithm, RateLimitKey, RemoteState, SlidingWindowState, SlotDelta,
};
use crate::metrics;
use crate::redis::SharedStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use breaker::{BreakerPermit, CircuitBreaker, CircuitState};
pub use worker::{spawn_sync_worker, SyncQueue};

/// Slack added to key expiry on top of the data a key must outlive.
const TTL_SLACK_MS: u64 = 1_000;

/// A key fell back to local-only decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedEvent {
    pub key: RateLimitKey,
    pub reason: &'static str,
    pub at_ms: u64,
}

/// Result of one reconciliation attempt. Store failures are folded into
/// `Degraded` here and never travel further up.
#[derive(Debug)]
pub enum SyncOutcome {
    Synced(RemoteState),
    Degraded(GatewayError),
}

/// Keeps local algorithm state loosely in step with the shared store.
pub struct Coordinator {
    store: Arc<dyn SharedStore>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,

    /// Breaker window in which each key last signalled degradation
    signaled: DashMap<RateLimitKey, u64>,

    events: broadcast::Sender<DegradedEvent>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn SharedStore>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            breaker: CircuitBreaker::new(config, Arc::clone(&clock)),
            clock,
            signaled: DashMap::new(),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Degraded-mode signals for this instance
    pub fn subscribe(&self) -> broadcast::Receiver<DegradedEvent> {
        self.events.subscribe()
    }

    /// True when this policy must not reach the store at all right now.
    pub fn local_only(&self, policy: &RateLimitConfig) -> bool {
        policy.use_local_only_under_load && self.breaker.short_circuits()
    }

    /// Push admitted deltas for `key` and read back the global view.
    ///
    /// A single attempt bounded by the policy's own deadline. Never retried.
    pub async fn sync(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitConfig,
        algorithm: &Algorithm,
        deltas: &[SlotDelta],
    ) -> Result<RemoteState> {
        let permit = if policy.use_local_only_under_load {
            self.breaker.try_acquire().ok_or(GatewayError::CircuitOpen)?
        } else {
            self.breaker.observe()
        };

        let operation = match algorithm {
            Algorithm::TokenBucket(_) => "take_tokens",
            _ => "incr_window",
        };
        let deadline = Duration::from_millis(policy.redis_timeout_ms);
        let started = Instant::now();

        // Dropping this future before the timeout resolves drops `permit`,
        // which hands a half-open trial slot back to the breaker.
        let result = match tokio::time::timeout(deadline, self.call_store(key, policy, algorithm, deltas))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::StoreTimeout(policy.redis_timeout_ms)),
        };

        let elapsed = started.elapsed();
        metrics::record_store_duration(operation, elapsed.as_secs_f64());

        match &result {
            Ok(_) if elapsed.as_millis() as u64 > self.breaker.config().slow_call_ms => {
                debug!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "Slow store call");
                permit.record_failure();
            }
            Ok(_) => permit.record_success(),
            Err(e) => {
                metrics::record_store_error(operation, e.kind());
                if e.is_store_failure() {
                    permit.record_failure();
                } else {
                    // The store answered; the reply was unusable
                    warn!(key = %key, "Unexpected store reply: {}", e);
                }
            }
        }

        result
    }

    /// `sync`, with failures converted into a degraded continuation.
    pub async fn reconcile(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitConfig,
        algorithm: &Algorithm,
        deltas: &[SlotDelta],
    ) -> SyncOutcome {
        match self.sync(key, policy, algorithm, deltas).await {
            Ok(remote) => {
                metrics::record_sync(true);
                SyncOutcome::Synced(remote)
            }
            Err(e) => {
                metrics::record_sync(false);
                self.degrade(key, &e);
                SyncOutcome::Degraded(e)
            }
        }
    }

    /// Emit a degraded-mode signal for `key` unless one already went out in
    /// the current breaker window. Returns whether a signal was emitted.
    pub fn degrade(&self, key: &RateLimitKey, err: &GatewayError) -> bool {
        let now = self.clock.now_millis();
        let window = now / self.breaker.config().recovery_timeout_ms.max(1);

        match self.signaled.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == window {
                    return false;
                }
                entry.insert(window);
            }
            Entry::Vacant(entry) => {
                entry.insert(window);
            }
        }

        warn!(key = %key, reason = err.kind(), "Shared store unavailable; deciding locally");
        metrics::record_degraded(&key.model, err.kind());
        // Nobody listening is fine
        let _ = self.events.send(DegradedEvent {
            key: key.clone(),
            reason: err.kind(),
            at_ms: now,
        });
        true
    }

    /// Forget signal windows older than the previous one.
    pub fn evict_signals(&self) -> usize {
        let window = self.clock.now_millis() / self.breaker.config().recovery_timeout_ms.max(1);
        let before = self.signaled.len();
        self.signaled.retain(|_, w| *w + 1 >= window);
        before.saturating_sub(self.signaled.len())
    }

    async fn call_store(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitConfig,
        algorithm: &Algorithm,
        deltas: &[SlotDelta],
    ) -> Result<RemoteState> {
        let now = self.clock.now_millis();
        let prefix = key.store_prefix();

        match algorithm {
            Algorithm::TokenBucket(bucket) => {
                let total = deltas.iter().map(|d| d.cost).fold(0u64, u64::saturating_add);
                let refill_per_ms = policy.refill_per_ms().max(f64::MIN_POSITIVE);
                let full_after_ms = (bucket.capacity() as f64 / refill_per_ms).ceil() as u64;
                let snapshot = self
                    .store
                    .take_tokens(
                        &format!("{}:b", prefix),
                        bucket.capacity(),
                        refill_per_ms,
                        total,
                        now,
                        full_after_ms.saturating_mul(2).saturating_add(TTL_SLACK_MS),
                    )
                    .await?;

                Ok(RemoteState::Bucket {
                    tokens: snapshot.tokens,
                    last_refill_ms: snapshot.last_refill_ms,
                    exceeded: !snapshot.granted,
                })
            }
            Algorithm::FixedWindow(_) | Algorithm::SlidingWindow(_) => {
                let window_ms = policy.window_ms.max(1);
                let start = window_start(now, window_ms);
                let ttl_ms = window_ms.saturating_mul(2).saturating_add(TTL_SLACK_MS);

                // Cost admitted before the boundary belongs to the window
                // that admitted it; only the previous window is still read.
                let mut current_delta = 0u64;
                for delta in deltas {
                    if delta.slot >= start {
                        current_delta = current_delta.saturating_add(delta.cost);
                    } else if delta.slot.saturating_add(window_ms) == start {
                        self.store
                            .incr_window(
                                &format!("{}:w:{}", prefix, delta.slot),
                                &format!("{}:w:{}", prefix, delta.slot.saturating_sub(window_ms)),
                                delta.cost,
                                ttl_ms,
                            )
                            .await?;
                    } else {
                        debug!(key = %key, slot = delta.slot, cost = delta.cost, "Dropping delta for an expired window");
                    }
                }

                let counts = self
                    .store
                    .incr_window(
                        &format!("{}:w:{}", prefix, start),
                        &format!("{}:w:{}", prefix, start.saturating_sub(window_ms)),
                        current_delta,
                        ttl_ms,
                    )
                    .await?;

                let effective = match algorithm {
                    Algorithm::SlidingWindow(sliding) => sliding.effective_count(
                        &SlidingWindowState {
                            window_start: start,
                            current: counts.current,
                            previous: counts.previous,
                        },
                        now,
                    ),
                    _ => counts.current as f64,
                };

                Ok(RemoteState::Window {
                    window_start: start,
                    current: counts.current,
                    previous: counts.previous,
                    exceeded: effective > algorithm.limit() as f64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AlgorithmKind;
    use crate::redis::MemoryStore;

    fn setup(store: &MemoryStore, clock: &ManualClock) -> Coordinator {
        Coordinator::new(
            Arc::new(store.clone()),
            BreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 1_000,
                half_open_max_calls: 1,
                slow_call_ms: 50,
            },
            Arc::new(clock.clone()),
        )
    }

    fn policy(algorithm: AlgorithmKind, capacity: u64) -> RateLimitConfig {
        RateLimitConfig {
            algorithm,
            capacity,
            window_ms: 1_000,
            redis_timeout_ms: 5,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_window_sync_reports_exceeded() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(10_500);
        let coordinator = setup(&store, &clock);
        let policy = policy(AlgorithmKind::FixedWindow, 5);
        let algorithm = Algorithm::from_config(&policy);
        let key = RateLimitKey::new("t", "m");

        let remote = coordinator
            .sync(&key, &policy, &algorithm, &[SlotDelta::new(10_000, 5)])
            .await
            .unwrap();
        assert_eq!(
            remote,
            RemoteState::Window {
                window_start: 10_000,
                current: 5,
                previous: 0,
                exceeded: false
            }
        );

        let remote = coordinator
            .sync(&key, &policy, &algorithm, &[SlotDelta::new(10_000, 1)])
            .await
            .unwrap();
        assert!(remote.exceeded());
        assert_eq!(store.window_count("rl:{m:t}:w:10000"), 6);
    }

    #[tokio::test]
    async fn test_bucket_sync_takes_tokens() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(0);
        let coordinator = setup(&store, &clock);
        let mut policy = policy(AlgorithmKind::TokenBucket, 10);
        policy.refill_rate = Some(10.0);
        let algorithm = Algorithm::from_config(&policy);
        let key = RateLimitKey::new("t", "m");

        let remote = coordinator.sync(&key, &policy, &algorithm, &[SlotDelta::new(0, 4)]).await.unwrap();
        assert!(matches!(remote, RemoteState::Bucket { tokens, exceeded: false, .. } if tokens == 6.0));

        let remote = coordinator.sync(&key, &policy, &algorithm, &[SlotDelta::new(0, 7)]).await.unwrap();
        assert!(remote.exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_once_per_window() {
        let store = MemoryStore::new();
        store.set_delay(50);
        let clock = ManualClock::new(0);
        let coordinator = setup(&store, &clock);
        let mut policy = policy(AlgorithmKind::FixedWindow, 5);
        policy.redis_timeout_ms = 1;
        policy.use_local_only_under_load = false;
        let algorithm = Algorithm::from_config(&policy);
        let key = RateLimitKey::new("t", "m");
        let mut events = coordinator.subscribe();

        for _ in 0..3 {
            let outcome = coordinator.reconcile(&key, &policy, &algorithm, &[SlotDelta::new(0, 1)]).await;
            assert!(matches!(outcome, SyncOutcome::Degraded(GatewayError::StoreTimeout(1))));
        }

        let event = events.try_recv().unwrap();
        assert_eq!(event.key, key);
        assert_eq!(event.reason, "timeout");
        assert!(events.try_recv().is_err());

        clock.advance(1_000);
        coordinator.reconcile(&key, &policy, &algorithm, &[SlotDelta::new(1_000, 1)]).await;
        assert!(events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_local_only_policies() {
        let store = MemoryStore::new();
        store.set_available(false);
        let clock = ManualClock::new(0);
        let coordinator = setup(&store, &clock);
        let shedding = policy(AlgorithmKind::FixedWindow, 5);
        let strict = RateLimitConfig {
            use_local_only_under_load: false,
            ..shedding.clone()
        };
        let algorithm = Algorithm::from_config(&shedding);
        let key = RateLimitKey::new("t", "m");

        for _ in 0..2 {
            let err = coordinator.sync(&key, &shedding, &algorithm, &[]).await.unwrap_err();
            assert!(matches!(err, GatewayError::StoreConnection(_)));
        }
        assert_eq!(coordinator.breaker_state(), CircuitState::Open);
        assert!(coordinator.local_only(&shedding));
        assert!(!coordinator.local_only(&strict));

        store.set_available(true);
        let err = coordinator.sync(&key, &shedding, &algorithm, &[]).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen));
        // Policies without the flag still reach the store
        assert!(coordinator.sync(&key, &strict, &algorithm, &[]).await.is_ok());

        clock.advance(1_000);
        assert!(coordinator.sync(&key, &shedding, &algorithm, &[]).await.is_ok());
        assert_eq!(coordinator.breaker_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_boundary_sync_charges_admitting_window() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_050);
        let coordinator = setup(&store, &clock);
        let policy = policy(AlgorithmKind::FixedWindow, 10);
        let algorithm = Algorithm::from_config(&policy);
        let key = RateLimitKey::new("t", "m");

        let deltas = [SlotDelta::new(0, 8), SlotDelta::new(1_000, 1)];
        let remote = coordinator.sync(&key, &policy, &algorithm, &deltas).await.unwrap();

        assert_eq!(
            remote,
            RemoteState::Window {
                window_start: 1_000,
                current: 1,
                previous: 8,
                exceeded: false
            }
        );
        assert_eq!(store.window_count("rl:{m:t}:w:0"), 8);
        assert_eq!(store.window_count("rl:{m:t}:w:1000"), 1);

        // Two windows back nobody reads it any more
        clock.set(3_050);
        coordinator
            .sync(&key, &policy, &algorithm, &[SlotDelta::new(1_000, 4)])
            .await
            .unwrap();
        assert_eq!(store.window_count("rl:{m:t}:w:1000"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sync_frees_half_open_slot() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(0);
        let coordinator = Arc::new(setup(&store, &clock));
        let mut policy = policy(AlgorithmKind::FixedWindow, 5);
        policy.redis_timeout_ms = 100;
        let algorithm = Algorithm::from_config(&policy);
        let key = RateLimitKey::new("t", "m");

        store.set_available(false);
        for _ in 0..2 {
            assert!(coordinator.sync(&key, &policy, &algorithm, &[]).await.is_err());
        }
        assert_eq!(coordinator.breaker_state(), CircuitState::Open);

        store.set_available(true);
        store.set_delay(50);
        clock.advance(1_000);
        let in_flight = {
            let coordinator = Arc::clone(&coordinator);
            let (key, policy, algorithm) = (key.clone(), policy.clone(), algorithm.clone());
            tokio::spawn(async move { coordinator.sync(&key, &policy, &algorithm, &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.breaker_state(), CircuitState::HalfOpen);

        in_flight.abort();
        assert!(in_flight.await.unwrap_err().is_cancelled());

        store.set_delay(0);
        assert!(coordinator.sync(&key, &policy, &algorithm, &[]).await.is_ok());
        assert_eq!(coordinator.breaker_state(), CircuitState::Closed);
    }
}
