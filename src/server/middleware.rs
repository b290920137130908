//! Admission stage of the middleware chain.
//!
//! Resolves the model and tenant, runs the rate limiter and the pre-dispatch
//! quota check, and annotates the request for later stages. Authentication
//! is a later stage; the tenant here is only a limiting identity.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::extractor::{scan_u64_field, ModelExtractor};
use crate::limiter::{Decision, RateLimitKey, RateLimiter};
use crate::server::AppState;

pub const ANONYMOUS_TENANT: &str = "anonymous";

/// Limiting identity attached to admitted requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantId(pub String);

pub async fn admission(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let policies = state.policies().load_full();
    let extractor_config = policies.extractor();
    let (parts, body) = req.into_parts();

    let (peeked, body) = match peek_body(body, extractor_config.max_body_bytes).await {
        Ok(peeked) => peeked,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "Request body could not be read",
            );
        }
    };

    let resolved = ModelExtractor::new(extractor_config).extract(
        &parts.method,
        parts.uri.path(),
        &parts.headers,
        Some(&peeked[..]),
    );
    let tenant = tenant_id(&parts.headers, &extractor_config.tenant_header);
    let key = RateLimitKey::new(tenant.clone(), resolved.model.clone());

    let decision = state.limiter.check(&key, 1).await;
    if !decision.allowed {
        debug!(key = %key, retry_after_ms = decision.retry_after_ms, "Rate limited");
        return rate_limited(&decision);
    }

    let estimate = estimate_tokens(
        Some(&peeked[..]),
        content_length(&parts.headers),
        policies.get_full_config().quota.default_estimate_tokens,
    );
    if let Err(e) = state.quota.check_quota(&tenant, estimate).await {
        let mut response = e.into_response();
        apply_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(resolved);
    req.extensions_mut().insert(TenantId(tenant));
    req.extensions_mut().insert(decision);

    let mut response = next.run(req).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

/// Buffer at most `limit` bytes from the front of `body`. Returns that
/// prefix and a body that replays it ahead of the unread remainder.
pub async fn peek_body(body: Body, limit: usize) -> Result<(Bytes, Body), axum::Error> {
    let mut rest = body.into_data_stream();
    let mut head = Vec::new();
    while head.len() < limit {
        match rest.next().await {
            Some(chunk) => head.extend_from_slice(&chunk?),
            None => {
                let head = Bytes::from(head);
                return Ok((head.clone(), Body::from(head)));
            }
        }
    }

    let head = Bytes::from(head);
    let prefix = head.slice(..limit);
    let replay = stream::once(async move { Ok::<_, axum::Error>(head) });
    Ok((prefix, Body::from_stream(replay.chain(rest))))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Tenant header, else a hash of the bearer token, else anonymous.
pub fn tenant_id(headers: &HeaderMap, tenant_header: &str) -> String {
    if let Some(tenant) = headers
        .get(tenant_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return tenant.to_string();
    }

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match token {
        Some(token) => {
            let digest = Sha256::digest(token.as_bytes());
            let short: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
            format!("key-{}", short)
        }
        None => ANONYMOUS_TENANT.to_string(),
    }
}

/// Upper-bound token estimate for the quota check. `body` may be a prefix;
/// `body_len` is the full length when the client declared one.
pub fn estimate_tokens(body: Option<&[u8]>, body_len: Option<usize>, default_estimate: u64) -> u64 {
    let Some(body) = body else {
        return default_estimate;
    };

    match scan_u64_field(body, "max_tokens").or_else(|| scan_u64_field(body, "max_completion_tokens")) {
        Some(max_tokens) => max_tokens.saturating_add(body_len.unwrap_or(body.len()) as u64 / 4),
        None => default_estimate,
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(ceil_secs(decision.reset_after_ms)),
    );
}

fn rate_limited(decision: &Decision) -> Response {
    let retry_secs = ceil_secs(decision.retry_after_ms).max(1);
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "rate_limit_exceeded",
        &format!("Rate limit exceeded. Retry after {} seconds.", retry_secs),
    );

    let headers = response.headers_mut();
    apply_rate_limit_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_secs));
    response
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_resolution_order() {
        let mut headers = HeaderMap::new();
        assert_eq!(tenant_id(&headers, "x-tenant-id"), ANONYMOUS_TENANT);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-secret"));
        let hashed = tenant_id(&headers, "x-tenant-id");
        assert!(hashed.starts_with("key-"));
        assert_eq!(hashed.len(), 4 + 16);
        assert!(!hashed.contains("sk-secret"));

        headers.insert("x-tenant-id", HeaderValue::from_static("acme"));
        assert_eq!(tenant_id(&headers, "x-tenant-id"), "acme");
    }

    #[test]
    fn test_estimate_tokens() {
        let body = br#"{"model":"gpt-4","max_tokens":500,"messages":[]}"#;
        assert_eq!(estimate_tokens(Some(body), None, 1_024), 500 + body.len() as u64 / 4);

        let body = br#"{"model":"o1","max_completion_tokens":100}"#;
        assert_eq!(estimate_tokens(Some(body), None, 1_024), 100 + body.len() as u64 / 4);

        // Prefix of a larger body
        assert_eq!(estimate_tokens(Some(body), Some(4_000), 1_024), 100 + 1_000);

        assert_eq!(estimate_tokens(Some(br#"{"model":"gpt-4"}"#), None, 1_024), 1_024);
        assert_eq!(estimate_tokens(None, None, 1_024), 1_024);
    }

    fn chunked(chunks: Vec<&'static [u8]>) -> Body {
        let chunks = chunks.into_iter().map(|c| Ok::<_, axum::Error>(Bytes::from_static(c)));
        Body::from_stream(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_peek_body_keeps_whole_small_body() {
        let (prefix, body) = peek_body(Body::from(r#"{"model":"gpt-4"}"#), 64).await.unwrap();

        assert_eq!(&prefix[..], br#"{"model":"gpt-4"}"#);
        let replayed = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&replayed[..], br#"{"model":"gpt-4"}"#);
    }

    #[tokio::test]
    async fn test_peek_body_bounds_prefix_and_replays_rest() {
        let body = chunked(vec![b"{\"model\":", b"\"gpt-4\",", b"\"messages\":[]}"]);

        let (prefix, body) = peek_body(body, 12).await.unwrap();

        assert_eq!(&prefix[..], b"{\"model\":\"gp");
        let replayed = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&replayed[..], br#"{"model":"gpt-4","messages":[]}"#);
    }
}
