use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shared store call timed out after {0}ms")]
    StoreTimeout(u64),

    #[error("Shared store connection error: {0}")]
    StoreConnection(String),

    #[error("Shared store circuit is open")]
    CircuitOpen,

    #[error("Usage quota exceeded for account '{account}' ({reason})")]
    QuotaExceeded { account: String, reason: String },

    #[error("Model could not be resolved unambiguously: {0}")]
    ModelExtractionAmbiguous(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Billing service error: {0}")]
    Billing(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// True for failures of the shared store, which are always converted
    /// into degraded local-only decisions.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::StoreTimeout(_)
                | GatewayError::StoreConnection(_)
                | GatewayError::CircuitOpen
        )
    }

    /// Short label used for metrics and degraded-mode events.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::StoreTimeout(_) => "timeout",
            GatewayError::StoreConnection(_) => "connection",
            GatewayError::CircuitOpen => "circuit_open",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::ModelExtractionAmbiguous(_) => "model_ambiguous",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Billing(_) => "billing",
            GatewayError::Serialization(_) => "serialization",
            GatewayError::FileSystem(_) => "filesystem",
            GatewayError::Json(_) => "json",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            GatewayError::StoreTimeout(0)
        } else {
            GatewayError::StoreConnection(err.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            GatewayError::QuotaExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "insufficient_quota")
            }
            GatewayError::Json(_)
            | GatewayError::ModelExtractionAmbiguous(_)
            | GatewayError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            GatewayError::StoreTimeout(_)
            | GatewayError::StoreConnection(_)
            | GatewayError::CircuitOpen
            | GatewayError::Billing(_) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
            GatewayError::Config(_)
            | GatewayError::Serialization(_)
            | GatewayError::FileSystem(_)
            | GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = serde_json::json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        });

        (status, Json(body)).into_response()
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_are_classified() {
        assert!(GatewayError::StoreTimeout(5).is_store_failure());
        assert!(GatewayError::StoreConnection("refused".into()).is_store_failure());
        assert!(GatewayError::CircuitOpen.is_store_failure());
        assert!(!GatewayError::Config("bad".into()).is_store_failure());
    }

    #[test]
    fn test_quota_exceeded_maps_to_429() {
        let err = GatewayError::QuotaExceeded {
            account: "acct".into(),
            reason: "tokens".into(),
        };
        assert_eq!(err.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
