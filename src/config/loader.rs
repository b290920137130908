use crate::config::validator::{
    validate_breaker_config, validate_policy, validate_redis_config, validate_sync_config,
};
use crate::config::{AppConfig, LimitsConfig, PolicyCache, RateLimitConfig, RedisConfig};
use crate::errors::{GatewayError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

/// Load the limits file. Only unreadable files, JSON syntax errors and
/// invalid global sections fail the load; bad model entries are dealt with
/// in [`build_policy_cache`].
pub async fn load_limits_from_file<P: AsRef<Path>>(path: P) -> Result<LimitsConfig> {
    let path = path.as_ref();
    info!("Loading limits configuration from: {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;
    let config = parse_limits(&contents)?;

    info!("Limits configuration loaded successfully");
    log_limits_summary(&config);

    Ok(config)
}

/// Parse and validate the global sections of a limits document.
pub fn parse_limits(contents: &str) -> Result<LimitsConfig> {
    let config: LimitsConfig = serde_json::from_str(contents)?;
    validate_breaker_config(&config.circuit_breaker)?;
    validate_sync_config(&config.sync)?;
    Ok(config)
}

/// Load complete application configuration
/// - Redis config from environment variables
/// - Limits from the JSON file named by `LIMITS_CONFIG`
pub async fn load_config() -> Result<AppConfig> {
    info!("Loading application configuration...");

    let redis = RedisConfig::from_env();
    validate_redis_config(&redis)?;
    info!(
        "Redis URL: {} (max_connections: {}, connect_timeout: {}ms)",
        mask_password(&redis.url),
        redis.max_connections,
        redis.connect_timeout_ms
    );

    let config_path = limits_path();
    debug!("Limits config path: {}", config_path);

    let limits = match load_limits_from_file(&config_path).await {
        Ok(limits) => limits,
        Err(GatewayError::FileSystem(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Limits file '{}' not found; running with built-in default policy",
                config_path
            );
            LimitsConfig::default()
        }
        Err(e) => return Err(e),
    };

    Ok(AppConfig { redis, limits })
}

/// Path of the limits file
pub fn limits_path() -> String {
    std::env::var("LIMITS_CONFIG").unwrap_or_else(|_| "config/limits.json".to_string())
}

/// Build the runtime policy cache, rejecting invalid model entries one by one.
pub fn build_policy_cache(config: &LimitsConfig) -> PolicyCache {
    let default_policy = if config.default.is_null() {
        RateLimitConfig::default()
    } else {
        match parse_policy(&config.default, "default") {
            Ok(policy) => policy,
            Err(e) => {
                warn!("Default policy rejected: {}. Using built-in safe default.", e);
                crate::metrics::record_config_rejected("default");
                RateLimitConfig::default()
            }
        }
    };

    let mut policies = Vec::with_capacity(config.models.len());
    let mut rejected = Vec::new();

    for (model, raw) in &config.models {
        match parse_policy(raw, model) {
            Ok(policy) => policies.push((model.clone(), policy)),
            Err(e) => {
                warn!("Rejected policy for model '{}': {}. Falling back to default.", model, e);
                crate::metrics::record_config_rejected(model);
                rejected.push(model.clone());
            }
        }
    }

    let unknown = config.unknown.as_ref().and_then(|raw| match parse_policy(raw, "unknown") {
        Ok(policy) => Some(policy),
        Err(e) => {
            warn!("Unknown-model policy rejected: {}. Using strictest configured policy.", e);
            crate::metrics::record_config_rejected("unknown");
            None
        }
    });

    let mut cache = PolicyCache::new(config.clone(), default_policy, policies, rejected);
    if let Some(policy) = unknown {
        cache = cache.with_unknown(policy);
    }
    crate::metrics::update_config_metrics(cache.stats().model_count);
    cache
}

/// Deserialize and validate one raw policy entry.
fn parse_policy(raw: &serde_json::Value, name: &str) -> Result<RateLimitConfig> {
    let policy = serde_json::from_value::<RateLimitConfig>(raw.clone())
        .map_err(|e| GatewayError::Config(format!("policy '{}': {}", name, e)))?;
    validate_policy(&policy, name)?;
    Ok(policy)
}

fn log_limits_summary(config: &LimitsConfig) {
    debug!("=== Limits Summary ===");
    debug!("Default: {}", config.default);
    for model in config.models.keys() {
        debug!("  Model: {}", model);
    }
    debug!(
        "Breaker: threshold={} recovery={}ms slow_call={}ms",
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.recovery_timeout_ms,
        config.circuit_breaker.slow_call_ms
    );
    debug!(
        "Quota: enabled={} cycle={:?} billing_url={}",
        config.quota.enabled,
        config.quota.cycle,
        config.quota.billing_url.is_some()
    );
    debug!("======================");
}

/// Mask password in Redis URL for safe logging
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlgorithmKind;
    use std::io::Write;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("redis://:mypassword@localhost:6379"),
            "redis://:***@localhost:6379"
        );
        assert_eq!(mask_password("redis://localhost:6379"), "redis://localhost:6379");
    }

    #[test]
    fn test_invalid_model_falls_back_to_default() {
        let config = parse_limits(
            r#"{
                "default": {"algorithm": "fixed_window", "capacity": 100, "window_ms": 1000},
                "models": {
                    "gpt-4": {"algorithm": "token_bucket", "capacity": 10, "refill_rate": 10.0},
                    "broken": {"algorithm": "leaky_bucket", "capacity": 10},
                    "zero": {"algorithm": "fixed_window", "capacity": 0}
                }
            }"#,
        )
        .unwrap();

        let cache = build_policy_cache(&config);

        assert_eq!(cache.policy_for("gpt-4").algorithm, AlgorithmKind::TokenBucket);
        assert_eq!(cache.policy_for("broken").capacity, 100);
        assert_eq!(cache.policy_for("zero").capacity, 100);
        assert_eq!(cache.rejected_models(), &["broken".to_string(), "zero".to_string()]);
    }

    #[test]
    fn test_invalid_default_uses_builtin() {
        let config = parse_limits(
            r#"{"default": {"algorithm": "fixed_window", "capacity": 0}}"#,
        )
        .unwrap();

        let cache = build_policy_cache(&config);
        assert_eq!(*cache.policy_for("anything"), RateLimitConfig::default());
    }

    #[test]
    fn test_malformed_default_keeps_models() {
        let config = parse_limits(
            r#"{
                "default": {"algorithm": "leaky_bucket", "capacity": 10},
                "unknown": {"algorithm": "fixed_window"},
                "models": {
                    "gpt-4": {"algorithm": "fixed_window", "capacity": 7, "window_ms": 1000}
                }
            }"#,
        )
        .unwrap();

        let cache = build_policy_cache(&config);
        assert_eq!(*cache.policy_for("anything"), RateLimitConfig::default());
        assert_eq!(cache.policy_for("gpt-4").capacity, 7);
        // Missing capacity: strictest remaining policy is the built-in default
        assert_eq!(
            *cache.policy_for(crate::config::UNKNOWN_MODEL),
            RateLimitConfig::default()
        );
    }

    #[test]
    fn test_invalid_breaker_section_fails_load() {
        let result = parse_limits(r#"{"circuit_breaker": {"failure_threshold": 0}}"#);
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"models": {{"claude": {{"algorithm": "sliding_window", "capacity": 5}}}}}}"#
        )
        .unwrap();

        let limits = load_limits_from_file(file.path()).await.unwrap();
        assert!(limits.models.contains_key("claude"));
    }
}
