use crate::clock::Clock;
use crate::config::{PolicyCache, QuotaConfig};
use crate::errors::{GatewayError, Result};
use crate::metrics;
use crate::quota::{AccountQuota, BillingService, QuotaState, UsageRecord, UsageTotals, UsageUpdate};
use crate::redis::SharedStore;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PUBLISH_TIMEOUT_MS: u64 = 100;
const RESUBSCRIBE_DELAY_MS: u64 = 1_000;

/// Billing-cycle quotas per account.
///
/// Totals are a local view: own usage is added on completion, other
/// instances' usage arrives over pub/sub, and the billing service is the
/// authority that the reconciler periodically merges back in.
pub struct UsageQuotaTracker {
    instance_id: String,
    policies: Arc<ArcSwap<PolicyCache>>,
    states: DashMap<String, QuotaState>,

    /// Unreported usage of cycles that already ended, by (account, cycle)
    carryover: DashMap<(String, String), UsageTotals>,

    store: Arc<dyn SharedStore>,
    billing: Arc<dyn BillingService>,
    clock: Arc<dyn Clock>,
}

impl UsageQuotaTracker {
    pub fn new(
        policies: Arc<ArcSwap<PolicyCache>>,
        store: Arc<dyn SharedStore>,
        billing: Arc<dyn BillingService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            policies,
            states: DashMap::new(),
            carryover: DashMap::new(),
            store,
            billing,
            clock,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn config(&self) -> QuotaConfig {
        self.policies.load().get_full_config().quota.clone()
    }

    fn limits_for(config: &QuotaConfig, account: &str) -> AccountQuota {
        config
            .accounts
            .get(account)
            .cloned()
            .unwrap_or_else(|| config.default.clone())
    }

    /// Reject when `estimated_tokens` more would break the account's quota.
    pub async fn check_quota(&self, account: &str, estimated_tokens: u64) -> Result<()> {
        let config = self.config();
        if !config.enabled {
            return Ok(());
        }

        self.ensure_loaded(account, &config).await;
        let violation = self.with_state(account, &config, |state| state.violation(estimated_tokens));

        match violation {
            Some(reason) => {
                metrics::record_quota_rejection(reason);
                debug!(account, estimated_tokens, reason, "Quota exceeded");
                Err(GatewayError::QuotaExceeded {
                    account: account.to_string(),
                    reason: format!("{} limit reached", reason),
                })
            }
            None => Ok(()),
        }
    }

    /// Add the usage of a completed request and tell the other instances.
    pub async fn record_usage(
        &self,
        account: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    ) -> UsageRecord {
        let config = self.config();
        self.ensure_loaded(account, &config).await;

        let tokens = tokens_in.saturating_add(tokens_out);
        let cycle_id = self.with_state(account, &config, |state| {
            state.tokens_used = state.tokens_used.saturating_add(tokens);
            state.cost_used += cost;
            state.unreported_tokens = state.unreported_tokens.saturating_add(tokens);
            state.unreported_cost += cost;
            state.cycle_id.clone()
        });
        metrics::record_usage(tokens_in, tokens_out, cost, "local");

        let update = UsageUpdate {
            instance_id: self.instance_id.clone(),
            account: account.to_string(),
            cycle_id: cycle_id.clone(),
            tokens,
            cost,
        };
        if let Err(e) = self.publish(&config.channel, &update).await {
            warn!(account, "Failed to publish usage update: {}", e);
        }

        UsageRecord {
            account: account.to_string(),
            tokens_in,
            tokens_out,
            cost,
            cycle_id,
            recorded_at_ms: self.clock.now_millis(),
        }
    }

    /// Current totals for `account`.
    pub async fn quota_state(&self, account: &str) -> QuotaState {
        let config = self.config();
        self.ensure_loaded(account, &config).await;
        self.with_state(account, &config, |state| state.clone())
    }

    /// Apply an update published by another instance. Returns whether it
    /// changed local totals.
    pub fn apply_update(&self, update: &UsageUpdate) -> bool {
        if update.instance_id == self.instance_id {
            return false;
        }

        // Unloaded accounts pick the usage up from billing when first seen
        if !self.states.contains_key(&update.account) {
            return false;
        }

        let config = self.config();
        self.with_state(&update.account, &config, |state| {
            if state.cycle_id != update.cycle_id {
                return false;
            }
            state.tokens_used = state.tokens_used.saturating_add(update.tokens);
            state.cost_used += update.cost;
            true
        })
    }

    pub async fn subscribe_updates(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        self.store.subscribe(&self.config().channel).await
    }

    /// Drain `updates` until the stream ends.
    pub async fn apply_updates(&self, mut updates: BoxStream<'static, Vec<u8>>) {
        while let Some(payload) = updates.next().await {
            match rmp_serde::from_slice::<UsageUpdate>(&payload) {
                Ok(update) => {
                    self.apply_update(&update);
                }
                Err(e) => warn!("Dropping malformed usage update: {}", e),
            }
        }
    }

    /// Push unreported usage to the billing service and merge its totals
    /// back. Failures are logged and retried on the next round.
    pub async fn reconcile(&self) {
        let carried: Vec<_> = self
            .carryover
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for ((account, cycle_id), usage) in carried {
            match self.billing.report_usage(&account, &cycle_id, usage).await {
                Ok(()) => {
                    let key = (account, cycle_id);
                    // Usage may have been carried over while reporting
                    if let Some(mut left) = self.carryover.get_mut(&key) {
                        left.tokens = left.tokens.saturating_sub(usage.tokens);
                        left.cost -= usage.cost;
                    }
                    self.carryover
                        .remove_if(&key, |_, left| left.tokens == 0 && left.cost <= f64::EPSILON);
                }
                Err(e) => warn!(account = %account, cycle_id = %cycle_id, "Failed to report usage: {}", e),
            }
        }

        let config = self.config();
        let accounts: Vec<String> = self.states.iter().map(|entry| entry.key().clone()).collect();

        for account in accounts {
            let (cycle_id, unreported) = self.with_state(&account, &config, |state| {
                let unreported = UsageTotals {
                    tokens: std::mem::take(&mut state.unreported_tokens),
                    cost: std::mem::take(&mut state.unreported_cost),
                };
                (state.cycle_id.clone(), unreported)
            });

            if unreported.tokens > 0 || unreported.cost > 0.0 {
                if let Err(e) = self.billing.report_usage(&account, &cycle_id, unreported).await {
                    warn!(account = %account, "Failed to report usage: {}", e);
                    self.restore_unreported(&account, &cycle_id, unreported);
                    continue;
                }
            }

            match self.billing.fetch_usage(&account, &cycle_id).await {
                Ok(totals) => {
                    if let Some(mut state) = self.states.get_mut(&account) {
                        if state.cycle_id == cycle_id {
                            let pending_tokens = state.unreported_tokens;
                            let pending_cost = state.unreported_cost;
                            state.tokens_used = state
                                .tokens_used
                                .max(totals.tokens.saturating_add(pending_tokens));
                            state.cost_used = state.cost_used.max(totals.cost + pending_cost);
                        }
                    }
                }
                Err(e) => warn!(account = %account, "Failed to fetch usage: {}", e),
            }
        }
    }

    /// Drop accounts with nothing left to report that saw no local traffic
    /// within the idle retention. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let retention = self.policies.load().get_full_config().sync.idle_retention_ms;

        let before = self.states.len();
        self.states
            .retain(|_, state| state.has_unreported() || now.saturating_sub(state.last_seen_ms) <= retention);
        let evicted = before.saturating_sub(self.states.len());

        if evicted > 0 {
            debug!(evicted, "Evicted idle quota accounts");
        }
        metrics::record_evictions("quota", evicted);
        evicted
    }

    /// Keep a subscription to the usage channel alive for the life of the process.
    pub fn spawn_subscriber(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.subscribe_updates().await {
                    Ok(updates) => {
                        info!("Subscribed to usage updates");
                        self.apply_updates(updates).await;
                        warn!("Usage update stream ended; resubscribing");
                    }
                    Err(e) => warn!("Usage update subscription failed: {}", e),
                }
                tokio::time::sleep(Duration::from_millis(RESUBSCRIBE_DELAY_MS)).await;
            }
        })
    }

    pub fn spawn_reconciler(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_millis(self.config().reconcile_interval_ms.max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                self.reconcile().await;
                self.evict_idle();
            }
        })
    }

    async fn publish(&self, channel: &str, update: &UsageUpdate) -> Result<()> {
        let payload = rmp_serde::to_vec(update)
            .map_err(|e| GatewayError::Serialization(format!("Failed to encode usage update: {}", e)))?;

        tokio::time::timeout(
            Duration::from_millis(PUBLISH_TIMEOUT_MS),
            self.store.publish(channel, payload),
        )
        .await
        .map_err(|_| GatewayError::StoreTimeout(PUBLISH_TIMEOUT_MS))?
    }

    /// Load authoritative totals on first sight of an account.
    async fn ensure_loaded(&self, account: &str, config: &QuotaConfig) {
        let now = self.clock.now_millis();
        if let Some(mut state) = self.states.get_mut(account) {
            state.last_seen_ms = now;
            return;
        }

        let cycle_id = config.cycle.cycle_id(now);
        let totals = match self.billing.fetch_usage(account, &cycle_id).await {
            Ok(totals) => totals,
            Err(e) => {
                warn!(account, "Starting from zero usage; billing fetch failed: {}", e);
                UsageTotals::default()
            }
        };

        self.states.entry(account.to_string()).or_insert_with(|| {
            let mut state = QuotaState::new(account, config.cycle, Self::limits_for(config, account), now);
            state.tokens_used = totals.tokens;
            state.cost_used = totals.cost;
            state
        });
    }

    /// Run `f` on the account's state under its shard lock, rolling the
    /// state over first when the billing cycle changed.
    fn with_state<R>(&self, account: &str, config: &QuotaConfig, f: impl FnOnce(&mut QuotaState) -> R) -> R {
        let now = self.clock.now_millis();
        let cycle_id = config.cycle.cycle_id(now);
        let limits = Self::limits_for(config, account);

        let mut state = self
            .states
            .entry(account.to_string())
            .or_insert_with(|| QuotaState::new(account, config.cycle, limits.clone(), now));

        if state.cycle_id != cycle_id {
            if state.has_unreported() {
                let mut carried = self
                    .carryover
                    .entry((account.to_string(), state.cycle_id.clone()))
                    .or_default();
                carried.tokens = carried.tokens.saturating_add(state.unreported_tokens);
                carried.cost += state.unreported_cost;
            }
            debug!(account, from = %state.cycle_id, to = %cycle_id, "Billing cycle rolled over");
            let last_seen_ms = state.last_seen_ms;
            *state = QuotaState::new(account, config.cycle, limits, now);
            state.last_seen_ms = last_seen_ms;
        } else {
            state.limits = limits;
        }

        f(&mut state)
    }

    fn restore_unreported(&self, account: &str, cycle_id: &str, usage: UsageTotals) {
        match self.states.get_mut(account) {
            Some(mut state) if state.cycle_id == cycle_id => {
                state.unreported_tokens = state.unreported_tokens.saturating_add(usage.tokens);
                state.unreported_cost += usage.cost;
            }
            _ => {
                let mut carried = self
                    .carryover
                    .entry((account.to_string(), cycle_id.to_string()))
                    .or_default();
                carried.tokens = carried.tokens.saturating_add(usage.tokens);
                carried.cost += usage.cost;
            }
        }
    }
}
