use crate::cache::{CacheMode, LocalDecisionCache};
use crate::clock::Clock;
use crate::config::{PolicyCache, RateLimitConfig};
use crate::coordinator::{Coordinator, SyncOutcome, SyncQueue};
use crate::limiter::{Algorithm, Decision, RateLimitKey, RateLimiter, StateMap};
use crate::metrics;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Local-first limiter backed by the shared store.
///
/// Every check runs against local state first. Denials are final. Allowed
/// requests either spend the cached local allowance or go to the store for
/// the global view; store failures fall back to a degraded per-key policy.
pub struct HybridLimiter {
    policies: Arc<ArcSwap<PolicyCache>>,
    states: Arc<StateMap>,

    /// State for the shrunken policy used while the store is unreachable
    degraded_states: StateMap,

    cache: LocalDecisionCache,
    coordinator: Arc<Coordinator>,
    queue: SyncQueue,
    clock: Arc<dyn Clock>,
}

impl HybridLimiter {
    pub fn new(
        policies: Arc<ArcSwap<PolicyCache>>,
        coordinator: Arc<Coordinator>,
        queue: SyncQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let states = Arc::new(StateMap::new());
        let cache = LocalDecisionCache::new(
            Arc::clone(&states),
            Arc::clone(&coordinator),
            queue.clone(),
            Arc::clone(&clock),
        );

        Self {
            policies,
            states,
            degraded_states: StateMap::new(),
            cache,
            coordinator,
            queue,
            clock,
        }
    }

    pub fn policies(&self) -> &Arc<ArcSwap<PolicyCache>> {
        &self.policies
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn cache(&self) -> &LocalDecisionCache {
        &self.cache
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Reconcile one key with the store; used by background consumers.
    pub async fn sync_key(&self, key: &RateLimitKey) {
        let policy = self.policies.load().policy_for(&key.model);
        if self.coordinator.local_only(&policy) {
            return;
        }
        let algorithm = Algorithm::from_config(&policy);
        self.cache.refresh(key, &policy, &algorithm).await;
    }

    /// Keys with unsynced admissions whose sync interval has elapsed.
    pub fn due_keys(&self) -> Vec<RateLimitKey> {
        let policies = self.policies.load();
        self.cache
            .pending()
            .due(self.clock.now_millis(), |key| {
                policies.policy_for(&key.model).sync_interval_ms
            })
    }

    /// Drop per-key state idle beyond the configured retention.
    pub fn evict_idle(&self) {
        let now = self.clock.now_millis();
        let retention = self.policies.load().get_full_config().sync.idle_retention_ms;

        let states = self.states.evict_idle(now, retention) + self.degraded_states.evict_idle(now, retention);
        let decisions = self.cache.evict_idle(now, retention);
        let pending = self.cache.pending().evict_idle(now, retention);
        let signals = self.coordinator.evict_signals();

        if states + decisions + pending + signals > 0 {
            debug!(states, decisions, pending, signals, "Evicted idle keys");
        }
        metrics::record_evictions("state", states);
        metrics::record_evictions("decision", decisions);
        metrics::record_evictions("pending", pending);
        metrics::record_evictions("signal", signals);
    }

    /// Admit against the degraded policy only. Full-policy state has already
    /// been charged by the caller when `charged` is set.
    fn check_degraded(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitConfig,
        algorithm: &Algorithm,
        cost: u64,
        now: u64,
        charged: bool,
    ) -> Decision {
        let degraded = Algorithm::from_config(&policy.degraded());
        let gate = self.degraded_states.check(key, &degraded, cost, now);
        if !gate.allowed {
            return Decision::deny(algorithm.limit(), gate.remaining, gate.retry_after_ms, gate.reset_after_ms);
        }

        let decision = if charged {
            self.states.peek(key, algorithm, 0, now)
        } else {
            let decision = self.states.check(key, algorithm, cost, now);
            if !decision.allowed {
                return decision;
            }
            self.cache.pending().add(key, algorithm.slot(now), cost, now);
            decision
        };

        Decision::allow(algorithm.limit(), decision.remaining.min(gate.remaining), decision.reset_after_ms)
    }

    async fn decide(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitConfig,
        algorithm: &Algorithm,
        cost: u64,
    ) -> (Decision, &'static str) {
        let entry = self.cache.get_or_refresh(key, policy, algorithm).await;
        let now = self.clock.now_millis();

        if entry.mode == CacheMode::LocalOnly {
            return (self.check_degraded(key, policy, algorithm, cost, now, false), "degraded");
        }

        let local = self.states.check(key, algorithm, cost, now);
        if !local.allowed {
            return (local, "local");
        }
        self.cache.pending().add(key, algorithm.slot(now), cost, now);

        if self.cache.try_spend_local(key, cost) {
            return (local, "local");
        }

        if policy.skip_redis_on_allow && entry.allowed {
            // Ship with the next periodic sync instead of writing now
            self.cache.request_refresh(key);
            return (local, "deferred");
        }

        match self.cache.refresh(key, policy, algorithm).await {
            (_, SyncOutcome::Synced(remote)) if remote.exceeded() => {
                let now = self.clock.now_millis();
                let status = self.states.peek(key, algorithm, cost, now);
                let retry = if status.allowed {
                    status.reset_after_ms.min(policy.window_ms).max(1)
                } else {
                    status.retry_after_ms
                };
                (Decision::deny(status.limit, 0, retry, status.reset_after_ms), "remote")
            }
            (_, SyncOutcome::Synced(_)) => (local, "remote"),
            (_, SyncOutcome::Degraded(_)) => {
                let now = self.clock.now_millis();
                (self.check_degraded(key, policy, algorithm, cost, now, true), "degraded")
            }
        }
    }
}

#[async_trait]
impl RateLimiter for HybridLimiter {
    async fn check(&self, key: &RateLimitKey, cost: u64) -> Decision {
        let started = Instant::now();
        let policy = self.policies.load().policy_for(&key.model);
        let algorithm = Algorithm::from_config(&policy);

        let (decision, path) = self.decide(key, &policy, &algorithm, cost).await;

        debug!(
            key = %key,
            cost,
            allowed = decision.allowed,
            remaining = decision.remaining,
            path,
            "Admission decision"
        );
        metrics::record_decision(
            &key.model,
            algorithm.kind().as_str(),
            decision.allowed,
            path,
            started.elapsed().as_secs_f64(),
        );

        decision
    }

    async fn status(&self, key: &RateLimitKey) -> Decision {
        let policy = self.policies.load().policy_for(&key.model);
        let algorithm = Algorithm::from_config(&policy);
        self.states.peek(key, &algorithm, 1, self.clock.now_millis())
    }
}
