//! Process-local decision cache.
//!
//! Holds the last global view per key for `cache_ttl_ms` and hands out a
//! local-allowance share of the remaining quota without asking the shared
//! store. Admitted cost that has not reached the store yet is tracked in
//! [`PendingDeltas`] and shipped on the next sync.

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::coordinator::{Coordinator, SyncOutcome, SyncQueue};
use crate::errors::GatewayError;
use crate::limiter::{Algorithm, Decision, RateLimitKey, SlotDelta, StateMap};
use crate::metrics;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a cached decision was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Backed by a successful sync with the shared store
    Synced,
    /// The store could not be reached; decide with the degraded policy
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedDecision {
    /// Whether the global view had room left when this was computed
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
    pub expires_at_ms: u64,

    /// Cost this instance may admit without the store until expiry
    pub local_budget: u64,
    pub local_spent: u64,
    pub mode: CacheMode,
}

impl CachedDecision {
    fn synced(status: Decision, exceeded: bool, policy: &RateLimitConfig, now_ms: u64) -> Self {
        let share = policy.local_allowance.clamp(0.0, 1.0);
        let local_budget = if exceeded {
            0
        } else {
            (status.remaining as f64 * share).floor() as u64
        };

        Self {
            allowed: status.allowed && !exceeded,
            limit: status.limit,
            remaining: status.remaining,
            reset_at_ms: now_ms + status.reset_after_ms,
            expires_at_ms: now_ms + policy.cache_ttl_ms,
            local_budget,
            local_spent: 0,
            mode: CacheMode::Synced,
        }
    }

    fn local_only(status: Decision, policy: &RateLimitConfig, now_ms: u64) -> Self {
        Self {
            allowed: status.allowed,
            limit: status.limit,
            remaining: status.remaining,
            reset_at_ms: now_ms + status.reset_after_ms,
            expires_at_ms: now_ms + policy.cache_ttl_ms.max(1),
            local_budget: 0,
            local_spent: 0,
            mode: CacheMode::LocalOnly,
        }
    }

    pub fn is_fresh(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

#[derive(Debug, Default)]
struct Pending {
    /// Unsynced cost by counter slot
    slots: BTreeMap<u64, u64>,
    last_sync_ms: u64,
    last_seen_ms: u64,
}

/// Admitted cost per key not yet pushed to the shared store. Cost stays
/// with the slot (window) it was admitted in, so a sync that runs after a
/// window boundary still charges the window that admitted it.
#[derive(Debug, Default)]
pub struct PendingDeltas {
    entries: DashMap<RateLimitKey, Pending>,
}

impl PendingDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &RateLimitKey, slot: u64, cost: u64, now_ms: u64) {
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| Pending {
            last_sync_ms: now_ms,
            ..Pending::default()
        });
        if cost > 0 {
            let pending = entry.slots.entry(slot).or_insert(0);
            *pending = pending.saturating_add(cost);
        }
        entry.last_seen_ms = now_ms;
    }

    /// Remove and return the unsynced deltas, oldest slot first.
    pub fn take(&self, key: &RateLimitKey) -> Vec<SlotDelta> {
        self.entries
            .get_mut(key)
            .map(|mut entry| {
                std::mem::take(&mut entry.slots)
                    .into_iter()
                    .map(|(slot, cost)| SlotDelta::new(slot, cost))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Put back deltas whose sync failed.
    pub fn restore(&self, key: &RateLimitKey, deltas: &[SlotDelta]) {
        if deltas.is_empty() {
            return;
        }
        let mut entry = self.entries.entry(key.clone()).or_default();
        for delta in deltas {
            let pending = entry.slots.entry(delta.slot).or_insert(0);
            *pending = pending.saturating_add(delta.cost);
        }
    }

    pub fn mark_synced(&self, key: &RateLimitKey, now_ms: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_sync_ms = now_ms;
        }
    }

    /// Total unsynced cost across slots.
    pub fn delta(&self, key: &RateLimitKey) -> u64 {
        self.entries
            .get(key)
            .map(|entry| entry.slots.values().sum())
            .unwrap_or(0)
    }

    /// Keys holding a delta whose sync interval has elapsed.
    pub fn due<F>(&self, now_ms: u64, interval_for: F) -> Vec<RateLimitKey>
    where
        F: Fn(&RateLimitKey) -> u64,
    {
        self.entries
            .iter()
            .filter(|entry| {
                !entry.slots.is_empty()
                    && now_ms.saturating_sub(entry.last_sync_ms) >= interval_for(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop idle keys with nothing left to ship.
    pub fn evict_idle(&self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !entry.slots.is_empty() || now_ms.saturating_sub(entry.last_seen_ms) <= retention_ms
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct LocalDecisionCache {
    entries: DashMap<RateLimitKey, CachedDecision>,
    states: Arc<StateMap>,
    pending: PendingDeltas,
    coordinator: Arc<Coordinator>,
    queue: SyncQueue,
    clock: Arc<dyn Clock>,
}

impl LocalDecisionCache {
    pub fn new(
        states: Arc<StateMap>,
        coordinator: Arc<Coordinator>,
        queue: SyncQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            states,
            pending: PendingDeltas::new(),
            coordinator,
            queue,
            clock,
        }
    }

    pub fn pending(&self) -> &PendingDeltas {
        &self.pending
    }

    pub fn get(&self, key: &RateLimitKey) -> Option<CachedDecision> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Cached decision for `key`, refreshed from the store when needed.
    ///
    /// Policies with `use_local_only_under_load` serve an expired entry while
    /// a background refresh runs, and skip the store entirely while the
    /// breaker is open. Other policies refresh inline on expiry.
    pub async fn get_or_refresh(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitConfig,
        algorithm: &Algorithm,
    ) -> CachedDecision {
        let now = self.clock.now_millis();

        let cached = self.get(key);
        if let Some(entry) = &cached {
            if entry.is_fresh(now) {
                metrics::record_cache_lookup("hit");
                return entry.clone();
            }
        }

        if self.coordinator.local_only(policy) {
            metrics::record_cache_lookup("local_only");
            self.coordinator.degrade(key, &GatewayError::CircuitOpen);
            return self.insert_local_only(key, algorithm, policy, now);
        }

        match cached {
            Some(_) if policy.use_local_only_under_load => {
                metrics::record_cache_lookup("stale");
                self.queue.request(key);
                // Serve the stale view for another TTL while the refresh runs
                let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
                    CachedDecision::local_only(self.states.peek(key, algorithm, 1, now), policy, now)
                });
                entry.expires_at_ms = now + policy.cache_ttl_ms.max(1);
                entry.clone()
            }
            Some(_) => {
                metrics::record_cache_lookup("expired");
                self.refresh(key, policy, algorithm).await.0
            }
            None => {
                metrics::record_cache_lookup("miss");
                self.refresh(key, policy, algorithm).await.0
            }
        }
    }

    /// Ship the pending delta for `key` and rebuild its cached decision.
    pub async fn refresh(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitConfig,
        algorithm: &Algorithm,
    ) -> (CachedDecision, SyncOutcome) {
        let deltas = self.pending.take(key);
        let outcome = self.coordinator.reconcile(key, policy, algorithm, &deltas).await;
        let now = self.clock.now_millis();

        let entry = match &outcome {
            SyncOutcome::Synced(remote) => {
                self.pending.mark_synced(key, now);
                let status = self.states.reconcile(key, algorithm, remote, now);
                let entry = CachedDecision::synced(status, remote.exceeded(), policy, now);
                self.entries.insert(key.clone(), entry.clone());
                entry
            }
            SyncOutcome::Degraded(_) => {
                self.pending.restore(key, &deltas);
                self.insert_local_only(key, algorithm, policy, now)
            }
        };

        (entry, outcome)
    }

    /// Spend `cost` from the local allowance of a fresh synced entry.
    pub fn try_spend_local(&self, key: &RateLimitKey, cost: u64) -> bool {
        let now = self.clock.now_millis();
        match self.entries.get_mut(key) {
            Some(mut entry)
                if entry.mode == CacheMode::Synced
                    && entry.is_fresh(now)
                    && entry.local_spent + cost <= entry.local_budget =>
            {
                entry.local_spent += cost;
                true
            }
            _ => false,
        }
    }

    /// Ask the sync worker to refresh `key` in the background.
    pub fn request_refresh(&self, key: &RateLimitKey) {
        self.queue.request(key);
    }

    pub fn evict_idle(&self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.expires_at_ms) <= retention_ms);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_local_only(
        &self,
        key: &RateLimitKey,
        algorithm: &Algorithm,
        policy: &RateLimitConfig,
        now_ms: u64,
    ) -> CachedDecision {
        let status = self.states.peek(key, algorithm, 1, now_ms);
        let entry = CachedDecision::local_only(status, policy, now_ms);
        self.entries.insert(key.clone(), entry.clone());
        entry
    }
}
