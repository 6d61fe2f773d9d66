// Anthropic /v1/messages 边界处理
//
// 请求归一化（-thinking 别名、会话 id 提取）→ 会话池取凭据 →
// 重试编排 → 上游字节流接进 EventStream 解析器和 SSE 状态机。
// 非流式路径把同一条管线完整跑干后折叠成单个 JSON。

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::extract_session_id;
use crate::core::Core;
use crate::error::ApiError;
use crate::models::claude::AnthropicRequest;
use crate::proxy::retry::{execute_with_retry, OrchestratorError, UpstreamAttempt};
use crate::proxy::upstream::event_stream::EventStreamParser;
use crate::proxy::upstream::stream_processor::{
    estimate_request_tokens, format_sse, format_sse_batch, NonStreamCollector, StreamProcessor,
};

pub fn new_message_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &raw[..24])
}

pub fn session_id_from_headers(headers: &HeaderMap) -> String {
    extract_session_id(
        headers.get("x-session-id").and_then(|v| v.to_str().ok()),
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
    )
}

fn error_response(err: &ApiError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_body())).into_response()
}

/// max_tokens 伪装响应（内容超限时 HTTP 200 收尾）。
fn max_tokens_body() -> serde_json::Value {
    json!({
        "type": "message_delta",
        "delta": {"stop_reason": "max_tokens", "stop_sequence": null},
        "usage": {"input_tokens": 0, "output_tokens": 0},
    })
}

fn orchestrator_error_response(err: OrchestratorError, is_stream: bool, model: &str) -> Response {
    match err {
        OrchestratorError::Api(api) => error_response(&api),
        OrchestratorError::Upstream(mapped) => {
            if mapped.is_max_tokens_disposition() {
                info!("内容长度超限，映射为 max_tokens stop_reason");
                if is_stream {
                    // 还没开流就超限：给出最小但完整的合法序列
                    let message_id = new_message_id();
                    let events = vec![
                        json!({
                            "type": "message_start",
                            "message": {
                                "id": message_id,
                                "type": "message",
                                "role": "assistant",
                                "content": [],
                                "model": model,
                                "stop_reason": null,
                                "stop_sequence": null,
                                "usage": {"input_tokens": 0, "output_tokens": 0},
                            },
                        }),
                        max_tokens_body(),
                        json!({"type": "message_stop"}),
                    ];
                    return sse_response(Body::from(format_sse_batch(&events)));
                }
                return (StatusCode::OK, Json(max_tokens_body())).into_response();
            }

            let status =
                StatusCode::from_u16(mapped.http_status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(mapped.to_json_body())).into_response()
        }
    }
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap()
}

pub async fn handle_messages(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut req: AnthropicRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "请求体解析失败");
            return error_response(&ApiError::BadRequest(format!("请求体解析失败: {}", e)));
        }
    };
    req.apply_thinking_alias();

    let session_id = session_id_from_headers(&headers);
    info!(
        session_id = %session_id,
        model = %req.model,
        message_count = req.messages.len(),
        is_stream = req.stream,
        thinking_enabled = req.thinking_enabled(),
        tool_count = req.tools.as_ref().map(Vec::len).unwrap_or(0),
        max_tokens = req.max_tokens,
        "收到 Anthropic 格式请求"
    );

    let attempt = match execute_with_retry(&core, &session_id, &req, req.stream).await {
        Ok(attempt) => attempt,
        Err(e) => return orchestrator_error_response(e, req.stream, &req.model),
    };

    if req.stream {
        stream_response(core, req, attempt)
    } else {
        non_stream_response(core, req, attempt).await
    }
}

fn stream_response(core: Arc<Core>, req: AnthropicRequest, attempt: UpstreamAttempt) -> Response {
    let message_id = new_message_id();
    let input_tokens = estimate_request_tokens(&req);
    let model = req.model.clone();
    let max_errors = core.tuning.parser_max_errors;

    let sse_stream = async_stream::stream! {
        let mut processor = StreamProcessor::new(message_id, model, input_tokens);
        let mut parser = EventStreamParser::new(max_errors);

        yield Ok::<Bytes, std::io::Error>(Bytes::from(format_sse_batch(&processor.initial_events())));

        let mut chunk_count: usize = 0;
        let mut total_bytes: usize = 0;
        let mut byte_stream = attempt.response.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(chunk) => {
                    chunk_count += 1;
                    total_bytes += chunk.len();
                    match parser.feed(&chunk) {
                        Ok(events) => {
                            for event in events {
                                let out = processor.process_upstream(&event);
                                if !out.is_empty() {
                                    yield Ok(Bytes::from(format_sse_batch(&out)));
                                }
                            }
                        }
                        Err(e) => {
                            // 坏帧预算耗尽：发 error 事件后终止流
                            error!(error = %e, "EventStream 解析失败，终止流");
                            yield Ok(Bytes::from(format_sse(&json!({
                                "type": "error",
                                "error": {"type": "api_error", "message": "上游响应解析失败"},
                            }))));
                            return;
                        }
                    }
                }
                Err(e) => {
                    // 流中途断开：停止读取，凭据不标记失败
                    warn!(
                        error = %e,
                        chunk_count,
                        total_bytes,
                        "上游流读取中断"
                    );
                    break;
                }
            }
        }

        let finals = processor.final_events();
        if !finals.is_empty() {
            yield Ok(Bytes::from(format_sse_batch(&finals)));
        }
        info!(chunk_count, total_bytes, "SSE 流结束");
    };

    sse_response(Body::from_stream(sse_stream))
}

/// 非流式管线：完整吃干上游响应体，折叠成 Anthropic 消息 JSON。
/// OpenAI 边界复用同一入口后再做一次方言转换。
pub(crate) async fn collect_anthropic_response(
    core: &Core,
    req: &AnthropicRequest,
    attempt: UpstreamAttempt,
) -> Result<serde_json::Value, Response> {
    let message_id = new_message_id();
    let input_tokens = estimate_request_tokens(req);

    let body = match tokio::time::timeout(
        core.tuning.non_stream_parse_timeout,
        attempt.response.bytes(),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            error!(error = %e, "读取上游响应体失败");
            return Err(error_response(&ApiError::Api(format!(
                "读取响应体失败: {}",
                e
            ))));
        }
        Err(_) => {
            error!("非流式响应读取超时");
            return Err((
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({
                    "error": {"type": "api_error", "message": "请求处理超时，请稍后重试"}
                })),
            )
                .into_response());
        }
    };

    let events = match EventStreamParser::parse_response(&body, core.tuning.parser_max_errors) {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, response_size = body.len(), "非流式解析失败");
            return Err(error_response(&ApiError::Api("无法解析上游响应格式".into())));
        }
    };

    let mut processor = StreamProcessor::new(message_id.clone(), req.model.clone(), input_tokens);
    let mut collector = NonStreamCollector::new();
    collector.absorb(&processor.initial_events());
    for event in &events {
        collector.absorb(&processor.process_upstream(event));
    }
    collector.absorb(&processor.final_events());

    let stop_reason = collector
        .stop_reason()
        .unwrap_or_else(|| processor.stop_reason())
        .to_string();
    let output_tokens = processor.effective_output_tokens();
    let content = collector.into_content_blocks();

    Ok(json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "model": req.model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        },
    }))
}

async fn non_stream_response(
    core: Arc<Core>,
    req: AnthropicRequest,
    attempt: UpstreamAttempt,
) -> Response {
    match collect_anthropic_response(&core, &req, attempt).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(response) => response,
    }
}
