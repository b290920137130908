pub mod loader;
pub mod validator;
pub mod watcher;

use crate::quota::{AccountQuota, BillingCycle};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Model key used when no model could be resolved and no default exists.
pub const UNKNOWN_MODEL: &str = "__unknown__";

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Shared store connection (environment variables only)
    pub redis: RedisConfig,

    /// Limits file contents (supports hot reload)
    pub limits: LimitsConfig,
}

/// Redis connection configuration (loaded from environment variables)
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Connection establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl RedisConfig {
    /// Load Redis configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("REDIS_URL").unwrap_or(defaults.url),

            max_connections: std::env::var("REDIS_MAX_CONN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),

            connect_timeout_ms: std::env::var("REDIS_CONNECT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_ms),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connect_timeout_ms: 500,
        }
    }
}

/// Limiting algorithm selected per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::FixedWindow => "fixed_window",
            AlgorithmKind::SlidingWindow => "sliding_window",
            AlgorithmKind::TokenBucket => "token_bucket",
        }
    }
}

/// Per-model rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub algorithm: AlgorithmKind,

    /// Requests (or cost units) per window, or bucket size.
    pub capacity: u64,

    /// Window length for the window algorithms.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Bucket refill in tokens per second. Defaults to `capacity` per window.
    #[serde(default)]
    pub refill_rate: Option<f64>,

    /// Extra allowance on top of `capacity`.
    #[serde(default)]
    pub burst: u64,

    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Share (0.0-1.0) of the last known remaining quota this instance may
    /// hand out without consulting the shared store.
    #[serde(default = "default_local_allowance")]
    pub local_allowance: f64,

    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,

    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    #[serde(default)]
    pub skip_redis_on_allow: bool,

    #[serde(default)]
    pub use_local_only_under_load: bool,
}

impl RateLimitConfig {
    /// Capacity including burst allowance.
    pub fn limit(&self) -> u64 {
        self.capacity.saturating_add(self.burst)
    }

    /// Bucket refill rate in tokens per millisecond.
    pub fn refill_per_ms(&self) -> f64 {
        match self.refill_rate {
            Some(rate) => rate / 1000.0,
            None => self.capacity as f64 / self.window_ms.max(1) as f64,
        }
    }

    /// Long-run admission rate in cost units per millisecond.
    pub fn admitted_per_ms(&self) -> f64 {
        match self.algorithm {
            AlgorithmKind::TokenBucket => self.refill_per_ms(),
            AlgorithmKind::FixedWindow | AlgorithmKind::SlidingWindow => {
                self.limit() as f64 / self.window_ms.max(1) as f64
            }
        }
    }

    /// Policy used while the shared store is unavailable: the same shape,
    /// shrunk to the local-allowance share of capacity (never below one).
    pub fn degraded(&self) -> RateLimitConfig {
        let share = self.local_allowance.clamp(0.0, 1.0);
        let scaled = ((self.limit() as f64) * share).ceil() as u64;
        let mut degraded = self.clone();
        degraded.capacity = scaled.max(1);
        degraded.burst = 0;
        degraded.refill_rate = Some((self.refill_per_ms() * 1000.0 * share).max(f64::MIN_POSITIVE));
        degraded
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::SlidingWindow,
            capacity: 60,
            window_ms: 60_000,
            refill_rate: None,
            burst: 0,
            cache_ttl_ms: default_cache_ttl_ms(),
            local_allowance: default_local_allowance(),
            redis_timeout_ms: default_redis_timeout_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            skip_redis_on_allow: false,
            use_local_only_under_load: true,
        }
    }
}

/// Model extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_override_header")]
    pub override_header: String,

    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Bodies larger than this are never buffered for inspection.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Path segments that are followed by a model name (`/v1/models/{model}`).
    #[serde(default = "default_path_markers")]
    pub path_markers: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            override_header: default_override_header(),
            tenant_header: default_tenant_header(),
            default_model: None,
            max_body_bytes: default_max_body_bytes(),
            path_markers: default_path_markers(),
        }
    }
}

/// Circuit breaker around shared-store calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,

    /// Calls slower than this count as failures.
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            slow_call_ms: default_slow_call_ms(),
        }
    }
}

/// Background reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Keys idle for longer than this are evicted.
    #[serde(default = "default_idle_retention_ms")]
    pub idle_retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            idle_retention_ms: default_idle_retention_ms(),
        }
    }
}

/// Billing-cycle quota settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub cycle: BillingCycle,

    #[serde(default)]
    pub default: AccountQuota,

    #[serde(default)]
    pub accounts: HashMap<String, AccountQuota>,

    /// Estimate used when the request body gives no hint.
    #[serde(default = "default_estimate_tokens")]
    pub default_estimate_tokens: u64,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Base URL of the billing service; static limits only when absent.
    #[serde(default)]
    pub billing_url: Option<String>,

    #[serde(default = "default_usage_channel")]
    pub channel: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle: BillingCycle::default(),
            default: AccountQuota::default(),
            accounts: HashMap::new(),
            default_estimate_tokens: default_estimate_tokens(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            billing_url: None,
            channel: default_usage_channel(),
        }
    }
}

/// Contents of the limits file. Model entries are kept raw so that one bad
/// entry can be rejected without failing the whole file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Raw like the model entries: a bad default falls back to the built-in
    /// one instead of failing the file. `null` means built-in.
    #[serde(default)]
    pub default: serde_json::Value,

    /// Policy for requests whose model could not be resolved.
    #[serde(default)]
    pub unknown: Option<serde_json::Value>,

    #[serde(default)]
    pub models: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub quota: QuotaConfig,
}

/// Runtime policy lookup with fast concurrent access
#[derive(Debug)]
pub struct PolicyCache {
    /// Map from model name -> validated policy
    policies: DashMap<String, Arc<RateLimitConfig>>,

    default_policy: Arc<RateLimitConfig>,

    unknown_policy: Arc<RateLimitConfig>,

    /// Models whose entries were rejected and fell back to the default
    rejected: Vec<String>,

    full_config: Arc<LimitsConfig>,
}

impl PolicyCache {
    pub fn new(
        config: LimitsConfig,
        default_policy: RateLimitConfig,
        policies: Vec<(String, RateLimitConfig)>,
        rejected: Vec<String>,
    ) -> Self {
        let default_policy = Arc::new(default_policy);
        let map = DashMap::new();
        for (model, policy) in policies {
            map.insert(model, Arc::new(policy));
        }

        let unknown_policy = strictest(&default_policy, &map);

        Self {
            policies: map,
            default_policy,
            unknown_policy,
            rejected,
            full_config: Arc::new(config),
        }
    }

    /// Use an explicit policy for unresolved models instead of the strictest one.
    pub fn with_unknown(mut self, policy: RateLimitConfig) -> Self {
        self.unknown_policy = Arc::new(policy);
        self
    }

    /// Policy for a model; unknown names fall back to the default policy.
    pub fn policy_for(&self, model: &str) -> Arc<RateLimitConfig> {
        if model == UNKNOWN_MODEL {
            return Arc::clone(&self.unknown_policy);
        }

        self.policies
            .get(model)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_policy))
    }

    pub fn extractor(&self) -> &ExtractorConfig {
        &self.full_config.extractor
    }

    pub fn get_full_config(&self) -> Arc<LimitsConfig> {
        Arc::clone(&self.full_config)
    }

    pub fn rejected_models(&self) -> &[String] {
        &self.rejected
    }

    pub fn stats(&self) -> ConfigStats {
        ConfigStats {
            model_count: self.policies.len(),
            rejected_count: self.rejected.len(),
        }
    }
}

/// Statistics about the policy cache
#[derive(Debug, Clone)]
pub struct ConfigStats {
    pub model_count: usize,
    pub rejected_count: usize,
}

fn strictest(
    default_policy: &Arc<RateLimitConfig>,
    policies: &DashMap<String, Arc<RateLimitConfig>>,
) -> Arc<RateLimitConfig> {
    let mut strictest = Arc::clone(default_policy);
    for entry in policies.iter() {
        if entry.value().admitted_per_ms() < strictest.admitted_per_ms() {
            strictest = Arc::clone(entry.value());
        }
    }
    strictest
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_cache_ttl_ms() -> u64 {
    100
}

fn default_local_allowance() -> f64 {
    0.1
}

fn default_redis_timeout_ms() -> u64 {
    5
}

fn default_sync_interval_ms() -> u64 {
    250
}

fn default_override_header() -> String {
    "x-model-override".to_string()
}

fn default_tenant_header() -> String {
    "x-tenant-id".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_path_markers() -> Vec<String> {
    vec!["models".to_string(), "deployments".to_string(), "engines".to_string()]
}

fn default_failure_threshold() -> usize {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    5_000
}

fn default_half_open_max_calls() -> usize {
    1
}

fn default_slow_call_ms() -> u64 {
    50
}

fn default_tick_ms() -> u64 {
    50
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_idle_retention_ms() -> u64 {
    600_000
}

fn default_true() -> bool {
    true
}

fn default_estimate_tokens() -> u64 {
    1_024
}

fn default_reconcile_interval_ms() -> u64 {
    30_000
}

fn default_usage_channel() -> String {
    "inferlimit:usage".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(capacity: u64) -> RateLimitConfig {
        RateLimitConfig {
            algorithm: AlgorithmKind::FixedWindow,
            capacity,
            ..RateLimitConfig::default()
        }
    }

    #[test]
    fn test_unknown_model_gets_strictest_policy() {
        let cache = PolicyCache::new(
            LimitsConfig::default(),
            fixed(100),
            vec![("gpt-4".to_string(), fixed(10)), ("small".to_string(), fixed(500))],
            vec![],
        );

        assert_eq!(cache.policy_for(UNKNOWN_MODEL).capacity, 10);
        assert_eq!(cache.policy_for("unlisted").capacity, 100);
        assert_eq!(cache.policy_for("small").capacity, 500);
    }

    #[test]
    fn test_strictest_compares_admitted_rate() {
        let per_hour = RateLimitConfig {
            capacity: 5,
            window_ms: 3_600_000,
            ..fixed(0)
        };
        let per_second = RateLimitConfig {
            capacity: 4,
            window_ms: 1_000,
            ..fixed(0)
        };
        let bucket = RateLimitConfig {
            algorithm: AlgorithmKind::TokenBucket,
            capacity: 1,
            refill_rate: Some(100.0),
            ..RateLimitConfig::default()
        };

        let cache = PolicyCache::new(
            LimitsConfig::default(),
            per_second,
            vec![("hourly".to_string(), per_hour), ("bucket".to_string(), bucket)],
            vec![],
        );

        let unknown = cache.policy_for(UNKNOWN_MODEL);
        assert_eq!(unknown.capacity, 5);
        assert_eq!(unknown.window_ms, 3_600_000);
    }

    #[test]
    fn test_explicit_unknown_policy_wins() {
        let cache = PolicyCache::new(LimitsConfig::default(), fixed(100), vec![], vec![])
            .with_unknown(fixed(3));
        assert_eq!(cache.policy_for(UNKNOWN_MODEL).capacity, 3);
    }

    #[test]
    fn test_degraded_policy_scales_capacity() {
        let mut policy = fixed(100);
        policy.local_allowance = 0.2;
        assert_eq!(policy.degraded().capacity, 20);

        policy.local_allowance = 0.0;
        assert_eq!(policy.degraded().capacity, 1);
    }

    #[test]
    fn test_refill_defaults_to_capacity_per_window() {
        let policy = RateLimitConfig {
            algorithm: AlgorithmKind::TokenBucket,
            capacity: 10,
            window_ms: 1_000,
            ..RateLimitConfig::default()
        };
        assert!((policy.refill_per_ms() - 0.01).abs() < 1e-12);
    }
}
