use serde_json::json;
use thiserror::Error;

/// Transport-independent error taxonomy.
///
/// Recoverable upstream failures (429/5xx) never reach this type — they are
/// absorbed by the orchestrator retry loop. What remains maps 1:1 onto the
/// client-facing Anthropic error dialect.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("api error: {0}")]
    Api(String),

    /// Typed: the boundary returns 400 with this specific JSON payload.
    #[error("model not found: {model}")]
    ModelNotFound { model: String, request_id: String },

    #[error("no available token")]
    NoAvailableToken,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

impl ApiError {
    /// Anthropic error-type string for JSON bodies and stream `error` events.
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request_error",
            ApiError::Unauthorized(_) | ApiError::Forbidden(_) => "authentication_error",
            ApiError::NotFound(_) => "not_found_error",
            ApiError::RateLimited(_) => "rate_limit_error",
            ApiError::Overloaded(_) => "overloaded_error",
            ApiError::Api(_) | ApiError::RefreshFailed(_) | ApiError::NoAvailableToken => "api_error",
            ApiError::ModelNotFound { .. } => "invalid_request_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) | ApiError::ModelNotFound { .. } => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::RateLimited(_) => 429,
            ApiError::Overloaded(_) => 503,
            ApiError::Api(_) | ApiError::RefreshFailed(_) | ApiError::NoAvailableToken => 500,
        }
    }

    /// Client-facing JSON body.
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            ApiError::ModelNotFound { model, request_id } => json!({
                "error": {
                    "code": "model_not_found",
                    "message": format!(
                        "分组 default 下模型 {} 无可用渠道（distributor） (request id: {})",
                        model, request_id
                    ),
                    "type": "new_api_error",
                }
            }),
            other => json!({
                "error": {
                    "type": other.error_type(),
                    "message": other.to_string(),
                }
            }),
        }
    }
}
