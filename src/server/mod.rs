pub mod handler;
pub mod middleware;

use arc_swap::ArcSwap;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::PolicyCache;
use crate::errors::{GatewayError, Result};
use crate::limiter::HybridLimiter;
use crate::quota::UsageQuotaTracker;

/// HTTP server configuration
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("GATEWAY_HOST").unwrap_or(defaults.host),
            port: std::env::var("GATEWAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared handles for the middleware and handlers
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<HybridLimiter>,
    pub quota: Arc<UsageQuotaTracker>,
}

impl AppState {
    pub fn policies(&self) -> &Arc<ArcSwap<PolicyCache>> {
        self.limiter.policies()
    }
}

/// Management endpoints are served directly; every other path goes through
/// admission first.
pub fn router(state: AppState) -> Router {
    let admitted = Router::new()
        .fallback(handler::admitted)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admission,
        ));

    Router::new()
        .route("/v1/usage", post(handler::record_usage))
        .route("/v1/quota/{account}", get(handler::quota))
        .route("/healthz", get(handler::healthz))
        .route("/metrics", get(handler::metrics))
        .merge(admitted)
        .with_state(state)
}

/// Serve the gateway until the listener fails
pub async fn start_server(config: ServerConfig, state: AppState) -> Result<()> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("Failed to bind {}: {}", addr, e)))?;

    info!("Admission gateway listening on http://{}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
