use crate::config::{AlgorithmKind, BreakerConfig, RateLimitConfig, RedisConfig, SyncConfig};
use crate::errors::{GatewayError, Result};
use tracing::{debug, warn};

/// Validate Redis configuration
pub fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(GatewayError::Config("Redis URL cannot be empty".to_string()));
    }

    // Basic URL validation (should start with redis:// or rediss://)
    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(GatewayError::Config(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(GatewayError::Config(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connect_timeout_ms == 0 {
        return Err(GatewayError::Config(
            "connect_timeout_ms must be greater than 0".to_string(),
        ));
    }

    debug!("Redis configuration valid");
    Ok(())
}

/// Validate one model's rate limit policy
pub fn validate_policy(policy: &RateLimitConfig, model: &str) -> Result<()> {
    if model.is_empty() {
        return Err(GatewayError::Config("Model name cannot be empty".to_string()));
    }

    if policy.capacity == 0 {
        return Err(GatewayError::Config(format!(
            "capacity must be positive for model '{}'",
            model
        )));
    }

    match policy.algorithm {
        AlgorithmKind::FixedWindow | AlgorithmKind::SlidingWindow => {
            if policy.window_ms == 0 {
                return Err(GatewayError::Config(format!(
                    "window_ms must be positive for model '{}' ({})",
                    model,
                    policy.algorithm.as_str()
                )));
            }
        }
        AlgorithmKind::TokenBucket => {
            if let Some(rate) = policy.refill_rate {
                if !rate.is_finite() || rate <= 0.0 {
                    return Err(GatewayError::Config(format!(
                        "refill_rate must be positive for model '{}' (got {})",
                        model, rate
                    )));
                }
            } else if policy.window_ms == 0 {
                return Err(GatewayError::Config(format!(
                    "token bucket for model '{}' needs refill_rate or window_ms",
                    model
                )));
            }
        }
    }

    if !policy.local_allowance.is_finite() || !(0.0..=1.0).contains(&policy.local_allowance) {
        return Err(GatewayError::Config(format!(
            "local_allowance must be within 0.0..=1.0 for model '{}' (got {})",
            model, policy.local_allowance
        )));
    }

    if policy.redis_timeout_ms == 0 {
        return Err(GatewayError::Config(format!(
            "redis_timeout_ms must be positive for model '{}'",
            model
        )));
    }

    if policy.sync_interval_ms == 0 {
        return Err(GatewayError::Config(format!(
            "sync_interval_ms must be positive for model '{}'",
            model
        )));
    }

    if policy.redis_timeout_ms > 100 {
        warn!(
            "redis_timeout_ms for model '{}' is {}ms; admission latency is bounded by it",
            model, policy.redis_timeout_ms
        );
    }

    if policy.local_allowance > 0.5 {
        warn!(
            "local_allowance {:.2} for model '{}' allows large over-admission across instances",
            policy.local_allowance, model
        );
    }

    debug!("Policy valid for model '{}'", model);
    Ok(())
}

pub fn validate_breaker_config(config: &BreakerConfig) -> Result<()> {
    if config.failure_threshold == 0 {
        return Err(GatewayError::Config(
            "circuit_breaker.failure_threshold must be > 0".to_string(),
        ));
    }

    if config.recovery_timeout_ms == 0 {
        return Err(GatewayError::Config(
            "circuit_breaker.recovery_timeout_ms must be > 0".to_string(),
        ));
    }

    if config.half_open_max_calls == 0 {
        return Err(GatewayError::Config(
            "circuit_breaker.half_open_max_calls must be > 0".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_sync_config(config: &SyncConfig) -> Result<()> {
    if config.tick_ms == 0 || config.workers == 0 || config.queue_capacity == 0 {
        return Err(GatewayError::Config(
            "sync.tick_ms, sync.workers and sync.queue_capacity must be > 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_policy() {
        assert!(validate_policy(&RateLimitConfig::default(), "default").is_ok());
    }

    #[test]
    fn test_validate_invalid_redis_url() {
        let mut config = RedisConfig::default();
        config.url = "invalid_url".to_string();
        assert!(validate_redis_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_capacity() {
        let policy = RateLimitConfig {
            capacity: 0,
            ..RateLimitConfig::default()
        };
        assert!(validate_policy(&policy, "gpt-4").is_err());
    }

    #[test]
    fn test_validate_local_allowance_range() {
        let policy = RateLimitConfig {
            local_allowance: 1.5,
            ..RateLimitConfig::default()
        };
        assert!(validate_policy(&policy, "gpt-4").is_err());
    }

    #[test]
    fn test_validate_negative_refill() {
        let policy = RateLimitConfig {
            algorithm: AlgorithmKind::TokenBucket,
            refill_rate: Some(-1.0),
            ..RateLimitConfig::default()
        };
        assert!(validate_policy(&policy, "gpt-4").is_err());
    }

    #[test]
    fn test_validate_breaker() {
        assert!(validate_breaker_config(&BreakerConfig::default()).is_ok());
        let config = BreakerConfig {
            failure_threshold: 0,
            ..BreakerConfig::default()
        };
        assert!(validate_breaker_config(&config).is_err());
    }
}
