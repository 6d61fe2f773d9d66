// 上游错误 → 客户端方言映射
//
// 状态码加响应体谓词的策略表，表达为带数据的枚举而不是多态对象。
// 每个映射同时决定三件事：客户端看到什么、HTTP 状态码是多少、
// 凭据要不要标记失败。
//
// 429 是瞬态错误，只触发冷却不禁用凭据——高流量时把凭据禁光是
// 早期版本踩过的坑。

use serde::Deserialize;
use serde_json::json;

/// 上游错误体（reason + message）。
#[derive(Debug, Default, Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// 400 + CONTENT_LENGTH_EXCEEDS_THRESHOLD：伪装成 max_tokens 正常结束
    ContentLengthExceeded,
    /// 其余 400
    InvalidRequest,
    /// 402 月度配额耗尽
    MonthlyQuota,
    /// 403 账号被上游临时封禁，凭据进入长冷却
    Suspended,
    /// 403 凭据失效
    Forbidden,
    /// 429 瞬态限流
    RateLimited,
    /// 500
    InternalError,
    /// 503
    Overloaded,
    /// 其他非 200
    Other,
}

#[derive(Debug, Clone)]
pub struct MappedError {
    pub kind: UpstreamErrorKind,
    /// 返回给客户端的 HTTP 状态码
    pub http_status: u16,
    /// 客户端方言的错误类型字符串
    pub error_code: &'static str,
    pub message: String,
    /// 是否应把当前凭据标记失败
    pub mark_token_failed: bool,
}

impl MappedError {
    /// 是否应以 200 + stop_reason=max_tokens 的形态返回。
    pub fn is_max_tokens_disposition(&self) -> bool {
        self.kind == UpstreamErrorKind::ContentLengthExceeded
    }

    /// JSON 错误体：`{"error": {"type", "message"}}`。
    pub fn to_json_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.error_code,
                "message": self.message,
            }
        })
    }

    /// 流式错误事件。
    pub fn to_stream_event(&self) -> serde_json::Value {
        json!({
            "type": "error",
            "error": {
                "type": self.error_code,
                "message": self.message,
            }
        })
    }
}

/// 状态码 + 响应体 → 映射结果。200 不应走到这里。
pub fn map_upstream_error(status: u16, body: &[u8]) -> MappedError {
    let parsed: UpstreamErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let upstream_message = parsed.message.trim().to_string();
    let with_default = |default: &str| {
        if upstream_message.is_empty() {
            default.to_string()
        } else {
            upstream_message.clone()
        }
    };

    match status {
        400 if parsed.reason == "CONTENT_LENGTH_EXCEEDS_THRESHOLD" => MappedError {
            kind: UpstreamErrorKind::ContentLengthExceeded,
            http_status: 200,
            error_code: "max_tokens",
            message: "Content length exceeds threshold, response truncated".to_string(),
            mark_token_failed: false,
        },
        400 => MappedError {
            kind: UpstreamErrorKind::InvalidRequest,
            http_status: 400,
            error_code: "invalid_request_error",
            message: with_default("请求参数无效"),
            mark_token_failed: false,
        },
        402 if parsed.reason.contains("MONTHLY_REQUEST_COUNT")
            || upstream_message.contains("monthly")
            || upstream_message.contains("quota") =>
        {
            MappedError {
                kind: UpstreamErrorKind::MonthlyQuota,
                http_status: 429,
                error_code: "rate_limited",
                message: with_default("月度请求配额已耗尽，请稍后重试或更换凭据"),
                mark_token_failed: true,
            }
        }
        403 if parsed.reason.contains("TEMPORARILY_SUSPENDED")
            || upstream_message.contains("TEMPORARILY_SUSPENDED") =>
        {
            MappedError {
                kind: UpstreamErrorKind::Suspended,
                http_status: 401,
                error_code: "unauthorized",
                message: with_default("账号被上游临时封禁，凭据已进入长时间冷却"),
                mark_token_failed: true,
            }
        }
        403 => MappedError {
            kind: UpstreamErrorKind::Forbidden,
            http_status: 401,
            error_code: "unauthorized",
            message: with_default("Token 已失效，请重试"),
            mark_token_failed: true,
        },
        429 => MappedError {
            kind: UpstreamErrorKind::RateLimited,
            http_status: 429,
            error_code: "rate_limited",
            message: with_default("请求过于频繁，请稍后重试"),
            mark_token_failed: false,
        },
        500 => MappedError {
            kind: UpstreamErrorKind::InternalError,
            http_status: 500,
            error_code: "api_error",
            message: with_default("上游服务内部错误"),
            mark_token_failed: false,
        },
        503 => MappedError {
            kind: UpstreamErrorKind::Overloaded,
            http_status: 503,
            error_code: "overloaded_error",
            message: "服务暂时不可用，请稍后重试".to_string(),
            mark_token_failed: false,
        },
        other => MappedError {
            kind: UpstreamErrorKind::Other,
            http_status: other,
            error_code: "api_error",
            message: format!(
                "Upstream error: {}",
                String::from_utf8_lossy(body)
            ),
            mark_token_failed: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_exceeded_becomes_max_tokens_200() {
        let body = br#"{"reason": "CONTENT_LENGTH_EXCEEDS_THRESHOLD", "message": "Input is too long."}"#;
        let mapped = map_upstream_error(400, body);
        assert_eq!(mapped.kind, UpstreamErrorKind::ContentLengthExceeded);
        assert_eq!(mapped.http_status, 200);
        assert!(mapped.is_max_tokens_disposition());
        assert!(!mapped.mark_token_failed);
    }

    #[test]
    fn plain_400_is_invalid_request() {
        let mapped = map_upstream_error(400, br#"{"message": "bad field"}"#);
        assert_eq!(mapped.kind, UpstreamErrorKind::InvalidRequest);
        assert_eq!(mapped.http_status, 400);
        assert_eq!(mapped.error_code, "invalid_request_error");
        assert_eq!(mapped.message, "bad field");
        assert!(!mapped.mark_token_failed);
    }

    #[test]
    fn monthly_quota_402_marks_failed_and_maps_429() {
        let body = br#"{"reason": "MONTHLY_REQUEST_COUNT", "message": "monthly"}"#;
        let mapped = map_upstream_error(402, body);
        assert_eq!(mapped.kind, UpstreamErrorKind::MonthlyQuota);
        assert_eq!(mapped.http_status, 429);
        assert_eq!(mapped.error_code, "rate_limited");
        assert!(mapped.mark_token_failed);
    }

    #[test]
    fn quota_keyword_in_message_also_matches() {
        let mapped = map_upstream_error(402, br#"{"message": "quota exhausted"}"#);
        assert_eq!(mapped.kind, UpstreamErrorKind::MonthlyQuota);
    }

    #[test]
    fn non_quota_402_falls_to_passthrough() {
        let mapped = map_upstream_error(402, br#"{"message": "payment needed"}"#);
        assert_eq!(mapped.kind, UpstreamErrorKind::Other);
        assert_eq!(mapped.http_status, 402);
    }

    #[test]
    fn forbidden_maps_to_unauthorized_401() {
        let mapped = map_upstream_error(403, b"{}");
        assert_eq!(mapped.kind, UpstreamErrorKind::Forbidden);
        assert_eq!(mapped.http_status, 401);
        assert_eq!(mapped.error_code, "unauthorized");
        assert!(mapped.mark_token_failed);
    }

    #[test]
    fn suspended_403_detected_from_reason_or_message() {
        let by_reason = map_upstream_error(403, br#"{"reason": "TEMPORARILY_SUSPENDED"}"#);
        assert_eq!(by_reason.kind, UpstreamErrorKind::Suspended);
        assert_eq!(by_reason.http_status, 401);
        assert!(by_reason.mark_token_failed);

        let by_message =
            map_upstream_error(403, br#"{"message": "Account TEMPORARILY_SUSPENDED for abuse"}"#);
        assert_eq!(by_message.kind, UpstreamErrorKind::Suspended);

        // 普通 403 不会误判为封禁
        let plain = map_upstream_error(403, br#"{"message": "expired token"}"#);
        assert_eq!(plain.kind, UpstreamErrorKind::Forbidden);
    }

    #[test]
    fn rate_limit_429_is_transient() {
        let mapped = map_upstream_error(429, b"{}");
        assert_eq!(mapped.http_status, 429);
        // 瞬态错误不禁用凭据
        assert!(!mapped.mark_token_failed);
    }

    #[test]
    fn server_errors() {
        assert_eq!(map_upstream_error(500, b"{}").error_code, "api_error");
        assert_eq!(map_upstream_error(500, b"{}").http_status, 500);
        assert_eq!(map_upstream_error(503, b"{}").error_code, "overloaded_error");
        assert_eq!(map_upstream_error(503, b"{}").http_status, 503);
    }

    #[test]
    fn unknown_status_passthrough() {
        let mapped = map_upstream_error(418, b"teapot");
        assert_eq!(mapped.kind, UpstreamErrorKind::Other);
        assert_eq!(mapped.http_status, 418);
        assert!(mapped.message.contains("teapot"));
    }

    #[test]
    fn json_body_shape() {
        let mapped = map_upstream_error(429, b"{}");
        let body = mapped.to_json_body();
        assert_eq!(body["error"]["type"], "rate_limited");
        assert!(body["error"]["message"].is_string());

        let event = mapped.to_stream_event();
        assert_eq!(event["type"], "error");
    }

    #[test]
    fn garbage_body_does_not_panic() {
        let mapped = map_upstream_error(400, b"\xFF\xFEnot json");
        assert_eq!(mapped.kind, UpstreamErrorKind::InvalidRequest);
    }
}
