use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::errors::GatewayError;
use crate::extractor::ResolvedModel;
use crate::limiter::Decision;
use crate::metrics;
use crate::quota::is_valid_account;
use crate::server::middleware::TenantId;
use crate::server::AppState;

const HEALTH_TIMEOUT_MS: u64 = 250;

/// Completed-request usage report
#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub account: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost: f64,
}

pub async fn record_usage(
    State(state): State<AppState>,
    Json(req): Json<UsageRequest>,
) -> Result<Response, GatewayError> {
    if !is_valid_account(&req.account) {
        return Err(GatewayError::InvalidRequest(format!("invalid account: {:?}", req.account)));
    }
    if !req.cost.is_finite() || req.cost < 0.0 {
        return Err(GatewayError::InvalidRequest(format!("invalid cost: {}", req.cost)));
    }

    info!(
        account = %req.account,
        tokens_in = req.tokens_in,
        tokens_out = req.tokens_out,
        cost = req.cost,
        "Recording usage"
    );

    let record = state
        .quota
        .record_usage(&req.account, req.tokens_in, req.tokens_out, req.cost)
        .await;

    Ok((StatusCode::ACCEPTED, Json(record)).into_response())
}

pub async fn quota(State(state): State<AppState>, Path(account): Path<String>) -> Response {
    debug!(account = %account, "Quota status request");
    Json(state.quota.quota_state(&account).await).into_response()
}

/// Always 200: the gateway keeps admitting while the store is down.
pub async fn healthz(State(state): State<AppState>) -> Response {
    let coordinator = state.limiter.coordinator();
    let store_up = matches!(
        tokio::time::timeout(
            Duration::from_millis(HEALTH_TIMEOUT_MS),
            coordinator.store().health_check()
        )
        .await,
        Ok(Ok(()))
    );

    let policies = state.policies().load();
    let stats = policies.stats();

    Json(serde_json::json!({
        "status": if store_up { "ok" } else { "degraded" },
        "store": if store_up { "up" } else { "down" },
        "circuit_breaker": coordinator.breaker_state().as_str(),
        "models": stats.model_count,
        "rejected_models": policies.rejected_models(),
    }))
    .into_response()
}

pub async fn metrics() -> Response {
    match metrics::gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Terminal handler for admitted requests: reports what admission resolved,
/// for use as a forward-auth check in front of the real upstream.
pub async fn admitted(
    Extension(model): Extension<ResolvedModel>,
    Extension(TenantId(tenant)): Extension<TenantId>,
    Extension(decision): Extension<Decision>,
) -> Response {
    Json(serde_json::json!({
        "admitted": true,
        "model": model.model,
        "model_source": model.source.as_str(),
        "tenant": tenant,
        "remaining": decision.remaining,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use crate::clock::{Clock, ManualClock};
    use crate::config::{AlgorithmKind, LimitsConfig, PolicyCache, RateLimitConfig};
    use crate::coordinator::{Coordinator, SyncQueue};
    use crate::limiter::HybridLimiter;
    use crate::quota::{AccountQuota, StaticBillingService, UsageQuotaTracker};
    use crate::redis::MemoryStore;
    use crate::server::{router, AppState};
    use arc_swap::ArcSwap;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(capacity: u64, token_limit: Option<u64>) -> Router {
        let store = MemoryStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));

        let mut limits = LimitsConfig::default();
        limits.quota.default = AccountQuota {
            token_limit,
            cost_limit: None,
        };
        let policy = RateLimitConfig {
            algorithm: AlgorithmKind::FixedWindow,
            capacity,
            window_ms: 1_000,
            ..RateLimitConfig::default()
        };
        let policies = Arc::new(ArcSwap::from_pointee(PolicyCache::new(
            limits,
            policy,
            vec![],
            vec![],
        )));

        let coordinator = Arc::new(Coordinator::new(
            Arc::new(store.clone()),
            Default::default(),
            Arc::clone(&clock),
        ));
        let (queue, _rx) = SyncQueue::new(16);
        let limiter = Arc::new(HybridLimiter::new(
            Arc::clone(&policies),
            coordinator,
            queue,
            Arc::clone(&clock),
        ));
        let quota = Arc::new(UsageQuotaTracker::new(
            policies,
            Arc::new(store),
            Arc::new(StaticBillingService::new()),
            clock,
        ));

        router(AppState { limiter, quota })
    }

    fn completion(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("content-length", body.len())
            .header("x-tenant-id", "acme")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_carries_model_and_headers() {
        let app = app(5, None);

        let response = app
            .oneshot(completion(r#"{"model":"gpt-4","messages":[]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
        let body = json(response).await;
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["model_source"], "body");
        assert_eq!(body["tenant"], "acme");
    }

    #[tokio::test]
    async fn test_rate_limited_request_gets_429() {
        let app = app(1, None);

        let first = app.clone().oneshot(completion(r#"{"model":"gpt-4"}"#)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(completion(r#"{"model":"gpt-4"}"#)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["retry-after"], "1");
        assert_eq!(second.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(json(second).await["error"]["type"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_quota_rejection_is_distinct() {
        let app = app(100, Some(100));

        let response = app
            .oneshot(completion(r#"{"model":"gpt-4","max_tokens":4000}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("retry-after").is_none());
        assert_eq!(json(response).await["error"]["type"], "insufficient_quota");
    }

    #[tokio::test]
    async fn test_usage_endpoint_updates_quota() {
        let app = app(100, Some(1_000));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/usage")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"account":"acme","tokens_in":10,"tokens_out":20,"cost":0.01}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .oneshot(Request::builder().uri("/v1/quota/acme").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["tokens_used"], 30);
        assert_eq!(body["limits"]["token_limit"], 1_000);
    }

    #[tokio::test]
    async fn test_healthz_reports_breaker() {
        let app = app(100, None);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["circuit_breaker"], "closed");
    }

    #[tokio::test]
    async fn test_model_resolved_from_large_body() {
        let padding = "x".repeat(70 * 1024);
        let body = format!(r#"{{"model":"gpt-4","messages":[{{"role":"user","content":"{}"}}]}}"#, padding);

        let sized = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-length", body.len())
            .header("x-tenant-id", "acme")
            .body(Body::from(body.clone()))
            .unwrap();
        let response = app(5, None).oneshot(sized).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["model"], "gpt-4");

        let streamed = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("x-tenant-id", "acme")
            .body(Body::from_stream(futures::stream::iter(vec![
                Ok::<_, std::io::Error>(body[..10].to_string()),
                Ok(body[10..].to_string()),
            ])))
            .unwrap();
        let response = app(5, None).oneshot(streamed).await.unwrap();
        assert_eq!(json(response).await["model"], "gpt-4");
    }
}
