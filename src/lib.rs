pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod extractor;
pub mod limiter;
pub mod metrics;
pub mod quota;
pub mod redis;
pub mod server;

// Re-export commonly used types
pub use config::{AppConfig, PolicyCache, RateLimitConfig};
pub use errors::{GatewayError, Result};
pub use limiter::{Decision, HybridLimiter, RateLimitKey, RateLimiter};
pub use quota::UsageQuotaTracker;
pub use server::{start_server, AppState, ServerConfig};
