// OpenAI /v1/chat/completions 边界处理
//
// 请求先转换成内部 Anthropic 形态走同一条编排管线；响应在边界再
// 转回 chat.completion。流式路径把状态机放行的 Anthropic 事件逐个
// 翻译成 chat.completion.chunk。

use std::collections::HashMap;
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
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::claude::{collect_anthropic_response, new_message_id, session_id_from_headers};
use crate::core::Core;
use crate::models::openai::{convert_anthropic_to_openai, convert_openai_to_anthropic, OpenAiRequest};
use crate::proxy::retry::{execute_with_retry, OrchestratorError, UpstreamAttempt};
use crate::proxy::upstream::event_stream::EventStreamParser;
use crate::proxy::upstream::stream_processor::{estimate_request_tokens, StreamProcessor};

fn openai_error(status: StatusCode, message: &str, error_type: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": error_type,
            }
        })),
    )
        .into_response()
}

fn orchestrator_error_to_openai(err: OrchestratorError) -> Response {
    match err {
        OrchestratorError::Api(api) => {
            let status =
                StatusCode::from_u16(api.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            openai_error(status, &api.to_string(), api.error_type())
        }
        OrchestratorError::Upstream(mapped) => {
            if mapped.is_max_tokens_disposition() {
                // OpenAI 方言里对应 finish_reason=length 的空回答
                let body = json!({
                    "id": new_message_id(),
                    "object": "chat.completion",
                    "created": chrono::Utc::now().timestamp(),
                    "model": "",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": ""},
                        "finish_reason": "length",
                    }],
                    "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
                });
                return (StatusCode::OK, Json(body)).into_response();
            }
            let status =
                StatusCode::from_u16(mapped.http_status).unwrap_or(StatusCode::BAD_GATEWAY);
            openai_error(status, &mapped.message, mapped.error_code)
        }
    }
}

pub async fn handle_chat_completions(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let openai_req: OpenAiRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "OpenAI 请求体解析失败");
            return openai_error(
                StatusCode::BAD_REQUEST,
                &format!("请求体解析失败: {}", e),
                "invalid_request_error",
            );
        }
    };

    let client_model = openai_req.model.clone();
    let req = convert_openai_to_anthropic(openai_req);
    let session_id = session_id_from_headers(&headers);

    info!(
        session_id = %session_id,
        model = %req.model,
        message_count = req.messages.len(),
        is_stream = req.stream,
        "收到 OpenAI 格式请求"
    );

    let attempt = match execute_with_retry(&core, &session_id, &req, req.stream).await {
        Ok(attempt) => attempt,
        Err(e) => return orchestrator_error_to_openai(e),
    };

    if req.stream {
        stream_response(core, req, client_model, attempt)
    } else {
        match collect_anthropic_response(&core, &req, attempt).await {
            Ok(anthropic) => {
                let message_id = new_message_id();
                let created = chrono::Utc::now().timestamp();
                let body =
                    convert_anthropic_to_openai(&anthropic, &client_model, &message_id, created);
                (StatusCode::OK, Json(body)).into_response()
            }
            Err(response) => response,
        }
    }
}

/// Anthropic 事件 → chat.completion.chunk 翻译器。
struct ChunkAdapter {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    /// 块索引 → tool_calls 数组下标
    tool_slots: HashMap<i64, usize>,
    next_tool_slot: usize,
}

impl ChunkAdapter {
    fn new(model: String) -> Self {
        Self {
            id: new_message_id(),
            model,
            created: chrono::Utc::now().timestamp(),
            sent_role: false,
            tool_slots: HashMap::new(),
            next_tool_slot: 0,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    fn translate(&mut self, event: &Value) -> Vec<Value> {
        let mut out = Vec::new();
        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                if !self.sent_role {
                    self.sent_role = true;
                    out.push(self.chunk(json!({"role": "assistant", "content": ""}), None));
                }
            }
            "content_block_start" => {
                let cb = &event["content_block"];
                if cb["type"] == "tool_use" {
                    let index = event["index"].as_i64().unwrap_or(0);
                    let slot = match self.tool_slots.get(&index) {
                        Some(slot) => *slot,
                        None => {
                            let slot = self.next_tool_slot;
                            self.next_tool_slot += 1;
                            self.tool_slots.insert(index, slot);
                            slot
                        }
                    };
                    out.push(self.chunk(
                        json!({
                            "tool_calls": [{
                                "index": slot,
                                "id": cb["id"],
                                "type": "function",
                                "function": {"name": cb["name"], "arguments": ""},
                            }]
                        }),
                        None,
                    ));
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(self.chunk(json!({"content": text}), None));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta["thinking"].as_str() {
                            out.push(self.chunk(json!({"reasoning_content": text}), None));
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta["partial_json"].as_str() {
                            let index = event["index"].as_i64().unwrap_or(0);
                            if let Some(slot) = self.tool_slots.get(&index) {
                                out.push(self.chunk(
                                    json!({
                                        "tool_calls": [{
                                            "index": slot,
                                            "function": {"arguments": partial},
                                        }]
                                    }),
                                    None,
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                let reason = match event["delta"]["stop_reason"].as_str().unwrap_or("end_turn") {
                    "tool_use" => "tool_calls",
                    "max_tokens" => "length",
                    _ => "stop",
                };
                out.push(self.chunk(json!({}), Some(reason)));
            }
            "error" => {
                out.push(json!({"error": event["error"].clone()}));
            }
            _ => {}
        }
        out
    }
}

fn format_chunk_batch(chunks: &[Value]) -> String {
    chunks
        .iter()
        .map(|c| format!("data: {}\n\n", serde_json::to_string(c).unwrap_or_default()))
        .collect()
}

fn stream_response(
    core: Arc<Core>,
    req: crate::models::claude::AnthropicRequest,
    client_model: String,
    attempt: UpstreamAttempt,
) -> Response {
    let input_tokens = estimate_request_tokens(&req);
    let model = req.model.clone();
    let max_errors = core.tuning.parser_max_errors;

    let sse_stream = async_stream::stream! {
        let mut processor = StreamProcessor::new(new_message_id(), model, input_tokens);
        let mut parser = EventStreamParser::new(max_errors);
        let mut adapter = ChunkAdapter::new(client_model);

        let mut translated = Vec::new();
        for event in processor.initial_events() {
            translated.extend(adapter.translate(&event));
        }
        if !translated.is_empty() {
            yield Ok::<Bytes, std::io::Error>(Bytes::from(format_chunk_batch(&translated)));
        }

        let mut byte_stream = attempt.response.bytes_stream();
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(chunk) => match parser.feed(&chunk) {
                    Ok(events) => {
                        for event in events {
                            let accepted = processor.process_upstream(&event);
                            let mut chunks = Vec::new();
                            for accepted_event in &accepted {
                                chunks.extend(adapter.translate(accepted_event));
                            }
                            if !chunks.is_empty() {
                                yield Ok(Bytes::from(format_chunk_batch(&chunks)));
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "EventStream 解析失败，终止流");
                        let err = json!({"error": {"message": "上游响应解析失败", "type": "api_error"}});
                        yield Ok(Bytes::from(format!("data: {}\n\n", err)));
                        return;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "上游流读取中断");
                    break;
                }
            }
        }

        let mut chunks = Vec::new();
        for event in processor.final_events() {
            chunks.extend(adapter.translate(&event));
        }
        if !chunks.is_empty() {
            yield Ok(Bytes::from(format_chunk_batch(&chunks)));
        }
        yield Ok(Bytes::from("data: [DONE]\n\n"));
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(sse_stream))
        .unwrap()
}
