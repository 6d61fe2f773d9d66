// 流处理上下文
//
// 把上游语义事件接进 SSE 状态机，维护工具调用证据与 token 统计，
// 负责首尾合成事件（message_start/ping 与 message_delta/message_stop）。
// 非流式路径复用同一条管线，最后折叠成单个 JSON 响应体。

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::event_stream::UpstreamEvent;
use super::parsers::{deduplicate_tool_calls, parse_bracket_tool_calls};
use super::sse_state::SseStateMachine;
use super::tool_lifecycle::{ToolCall, ToolLifecycleManager};
use crate::models::claude::{
    AnthropicRequest, ContentBlock, MessageContent, SystemPrompt,
};

/// 估算系数：Claude 分词比 cl100k 约多 15%
const TOKEN_CORRECTION_FACTOR: f64 = 1.15;
const TOKEN_ESTIMATION_RATIO: usize = 4;

/// 文本的粗粒度 token 估算（上游没给 usage 时的回退）。
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let base = (text.len() / TOKEN_ESTIMATION_RATIO).max(1);
    (base as f64 * TOKEN_CORRECTION_FACTOR) as u64
}

/// 请求侧输入 token 估算。
pub fn estimate_request_tokens(req: &AnthropicRequest) -> u64 {
    let mut total: u64 = 0;

    if let Some(system) = &req.system {
        match system {
            SystemPrompt::String(s) => total += estimate_tokens(s),
            SystemPrompt::Array(blocks) => {
                for block in blocks {
                    total += estimate_tokens(&block.text);
                }
            }
        }
    }

    for msg in &req.messages {
        total += 4; // 消息结构开销
        match &msg.content {
            MessageContent::String(s) => total += estimate_tokens(s),
            MessageContent::Array(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => total += estimate_tokens(text),
                        ContentBlock::Thinking { thinking, .. } => total += estimate_tokens(thinking),
                        ContentBlock::Image { .. } => total += 100,
                        _ => total += 10,
                    }
                }
            }
        }
    }

    total + 3
}

/// SSE 文本编码：`event: <type>\ndata: <json>\n\n`。
pub fn format_sse(event: &Value) -> String {
    let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("message");
    format!(
        "event: {}\ndata: {}\n\n",
        event_type,
        serde_json::to_string(event).unwrap_or_default()
    )
}

pub fn format_sse_batch(events: &[Value]) -> String {
    events.iter().map(format_sse).collect()
}

/// 累积中的索引无关工具调用（上游旧式 toolUseEvent 形态）。
struct PendingToolCall {
    id: String,
    name: String,
    input_buffer: String,
}

pub struct StreamProcessor {
    state: SseStateMachine,
    tools: ToolLifecycleManager,
    message_id: String,
    model: String,
    input_tokens: u64,

    // 工具调用证据（stop_reason 判定用）
    tool_use_by_index: HashMap<i64, String>,
    completed_tool_ids: HashSet<String>,
    pending_tool: Option<PendingToolCall>,

    // token 统计
    upstream_output_tokens: u64,
    output_chars: usize,
    /// 文本累计，流尾用于恢复 `[Called ...]` 字面量工具调用
    accumulated_text: String,
}

impl StreamProcessor {
    pub fn new(message_id: String, model: String, input_tokens: u64) -> Self {
        Self {
            state: SseStateMachine::new(false),
            tools: ToolLifecycleManager::new(),
            message_id,
            model,
            input_tokens,
            tool_use_by_index: HashMap::new(),
            completed_tool_ids: HashSet::new(),
            pending_tool: None,
            upstream_output_tokens: 0,
            output_chars: 0,
            accumulated_text: String::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    /// 初始事件：message_start + ping。
    ///
    /// 不预发空文本块——如果上游只回 tool_use，预发的 start/stop 对
    /// 会产生非法的空块；块由状态机在首个 delta 到达时自动补。
    pub fn initial_events(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        let start = json!({
            "type": "message_start",
            "message": {
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": self.model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
            },
        });
        out.extend(self.state.process(start).unwrap_or_default());
        out.push(json!({"type": "ping"}));
        out
    }

    /// 处理一个上游事件，返回应写出的下游事件。
    pub fn process_upstream(&mut self, event: &UpstreamEvent) -> Vec<Value> {
        let map = event.to_anthropic_map();
        let event_type = map.get("type").and_then(|t| t.as_str()).unwrap_or("");

        if event_type == "exception" {
            return self.handle_exception(&map);
        }

        // 上游的 messageStop 只是内容结束信号；合法的
        // message_delta + message_stop 尾巴由 final_events 统一合成
        if event_type == "message_stop" {
            debug!("上游内容流结束");
            return Vec::new();
        }

        // 旧式工具事件：payload 不带块索引，由生命周期管理器分配
        if event_type == "toolUseEvent" {
            return self.handle_tool_use_event(&map);
        }

        // 工具证据与 usage 统计在转发前采集
        match event_type {
            "content_block_start" => self.track_tool_start(&map),
            "content_block_stop" => self.track_tool_stop(&map),
            "message_delta" => {
                if let Some(output) = map
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    if output > 0 {
                        self.upstream_output_tokens = output;
                    }
                }
            }
            _ => {}
        }

        let accepted = match self.state.process(map) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "SSE 事件发送违规");
                Vec::new()
            }
        };

        // 输出字符统计只看实际放行的 delta
        for event in &accepted {
            if event["type"] == "content_block_delta" {
                let delta = &event["delta"];
                for field in ["text", "thinking", "partial_json"] {
                    if let Some(s) = delta.get(field).and_then(|v| v.as_str()) {
                        self.output_chars += s.len();
                    }
                }
                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                    self.accumulated_text.push_str(text);
                }
            }
            // 自动补出来的工具块 start 也要记作证据
            if event["type"] == "content_block_start"
                && event["content_block"]["type"] == "tool_use"
            {
                self.track_tool_start(event);
            }
        }

        accepted
    }

    /// 索引无关的工具事件流：`{name, toolUseId}` 开头、若干 `{input}`
    /// 分片、`{stop: true}` 收尾。块索引由生命周期管理器分配（0 预留
    /// 给前置文本），产出维持"先头后体"的事件形态。
    fn handle_tool_use_event(&mut self, map: &Value) -> Vec<Value> {
        // input 分片可能同时带 name/toolUseId，必须先判 input
        if let Some(input) = map.get("input").and_then(|v| v.as_str()) {
            if let Some(pending) = self.pending_tool.as_mut() {
                pending.input_buffer.push_str(input);
            } else {
                warn!("收到没有归属的工具参数分片");
            }
            return Vec::new();
        }

        if map.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
            return self.finalize_pending_tool();
        }

        let name = map.get("name").and_then(|v| v.as_str());
        let id = map
            .get("toolUseId")
            .or_else(|| map.get("tool_use_id"))
            .and_then(|v| v.as_str());
        if let (Some(name), Some(id)) = (name, id) {
            // 新调用开始前先把上一个收掉
            let mut out = self.finalize_pending_tool();
            self.pending_tool = Some(PendingToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input_buffer: String::new(),
            });
            out
        } else {
            Vec::new()
        }
    }

    fn finalize_pending_tool(&mut self) -> Vec<Value> {
        let Some(pending) = self.pending_tool.take() else {
            return Vec::new();
        };

        let call = ToolCall {
            id: pending.id.clone(),
            name: pending.name,
            arguments: pending.input_buffer,
        };
        let mut emitted = self.tools.handle_tool_requests(&[call]);
        emitted.extend(self.tools.handle_tool_result(&pending.id, Value::Null));
        self.route_tool_events(emitted)
    }

    /// 流尾兜底：正文里 `[Called ...]` 字面量恢复成 tool_use 块。
    fn recover_bracket_tool_calls(&mut self) -> Vec<Value> {
        let calls = deduplicate_tool_calls(parse_bracket_tool_calls(&self.accumulated_text));
        if calls.is_empty() {
            return Vec::new();
        }
        debug!(count = calls.len(), "从正文恢复字面量工具调用");
        let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
        let mut emitted = self.tools.handle_tool_requests(&calls);
        for id in &ids {
            emitted.extend(self.tools.handle_tool_result(id, Value::Null));
        }
        self.route_tool_events(emitted)
    }

    /// 生命周期管理器产出的事件仍要过状态机，保持序列合法。
    fn route_tool_events(&mut self, emitted: Vec<Value>) -> Vec<Value> {
        let mut out = Vec::new();
        for event in emitted {
            if event["type"] == "content_block_start" {
                self.track_tool_start(&event);
            }
            if event["type"] == "content_block_stop" {
                self.track_tool_stop(&event);
            }
            match self.state.process(event) {
                Ok(accepted) => out.extend(accepted),
                Err(e) => warn!(error = %e, "工具事件发送违规"),
            }
        }
        out
    }

    fn track_tool_start(&mut self, map: &Value) {
        let Some(cb) = map.get("content_block") else {
            return;
        };
        if cb.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
            return;
        }
        let Some(index) = map.get("index").and_then(|v| v.as_i64()) else {
            return;
        };
        let Some(id) = cb.get("id").and_then(|v| v.as_str()) else {
            return;
        };
        self.tool_use_by_index.insert(index, id.to_string());
        debug!(tool_use_id = id, index, "转发 tool_use 开始");
    }

    fn track_tool_stop(&mut self, map: &Value) {
        let Some(index) = map.get("index").and_then(|v| v.as_i64()) else {
            return;
        };
        // 先记完成证据再移除，否则结束时 stop_reason 会误判成 end_turn
        if let Some(id) = self.tool_use_by_index.remove(&index) {
            self.completed_tool_ids.insert(id);
        }
    }

    fn handle_exception(&mut self, map: &Value) -> Vec<Value> {
        let exception_type = map
            .get("exception_type")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let output_tokens = self.effective_output_tokens();
        if let Some(events) =
            self.state
                .handle_exception(exception_type, self.input_tokens, output_tokens)
        {
            return events;
        }
        // 未识别的异常：给客户端一个成形的 error 事件而不是裸转发
        let message = map
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("upstream exception");
        warn!(exception_type, "未识别的上游异常帧");
        vec![json!({
            "type": "error",
            "error": {"type": "api_error", "message": message},
        })]
    }

    fn has_tool_evidence(&self) -> bool {
        !self.tool_use_by_index.is_empty() || !self.completed_tool_ids.is_empty()
    }

    pub fn effective_output_tokens(&self) -> u64 {
        if self.upstream_output_tokens > 0 {
            self.upstream_output_tokens
        } else {
            let mut estimated = (self.output_chars / TOKEN_ESTIMATION_RATIO) as u64;
            if self.has_tool_evidence() {
                estimated = (estimated as f64 * TOKEN_CORRECTION_FACTOR) as u64;
            }
            if estimated == 0 && self.output_chars > 0 {
                estimated = 1;
            }
            estimated
        }
    }

    pub fn stop_reason(&self) -> &'static str {
        if self.has_tool_evidence() {
            "tool_use"
        } else {
            "end_turn"
        }
    }

    /// 结束事件：补关未关闭的块，发唯一的 message_delta + message_stop。
    ///
    /// 异常路径（内容超限）已经收过尾时这里自然为空——状态机的
    /// 去重保证不会出第二个 message_delta/message_stop。
    pub fn final_events(&mut self) -> Vec<Value> {
        let mut out = Vec::new();

        // 没等到 stop 标记的工具调用也要收掉
        out.extend(self.finalize_pending_tool());
        out.extend(self.state.flush_pending());
        out.extend(self.recover_bracket_tool_calls());

        for index in self.state.open_block_indices() {
            debug!(index, "最终事件前关闭未关闭的 content_block");
            if let Ok(events) = self
                .state
                .process(json!({"type": "content_block_stop", "index": index}))
            {
                out.extend(events);
            }
        }

        let stop_reason = self.stop_reason();
        let output_tokens = self.effective_output_tokens();
        debug!(stop_reason, output_tokens, "创建结束事件");

        if let Ok(events) = self.state.process(json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {"input_tokens": self.input_tokens, "output_tokens": output_tokens},
        })) {
            out.extend(events);
        }
        if let Ok(events) = self.state.process(json!({"type": "message_stop"})) {
            out.extend(events);
        }

        out
    }

    pub fn is_message_ended(&self) -> bool {
        self.state.is_message_ended()
    }
}

/// 非流式响应折叠器：把状态机放行的事件重组成 Anthropic 消息体。
#[derive(Default)]
pub struct NonStreamCollector {
    /// index → (类型, 文本缓冲)
    blocks: Vec<(i64, String, String)>,
    /// tool_use: index → (id, name, partial_json 缓冲)
    tools: HashMap<i64, (String, String, String)>,
    order: Vec<i64>,
    stop_reason_override: Option<String>,
}

impl NonStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, events: &[Value]) {
        for event in events {
            match event["type"].as_str().unwrap_or("") {
                "content_block_start" => {
                    let index = event["index"].as_i64().unwrap_or(0);
                    let cb = &event["content_block"];
                    let block_type = cb["type"].as_str().unwrap_or("text").to_string();
                    if block_type == "tool_use" {
                        self.tools.insert(
                            index,
                            (
                                cb["id"].as_str().unwrap_or("").to_string(),
                                cb["name"].as_str().unwrap_or("").to_string(),
                                String::new(),
                            ),
                        );
                    } else {
                        self.blocks.push((index, block_type, String::new()));
                    }
                    if !self.order.contains(&index) {
                        self.order.push(index);
                    }
                }
                "content_block_delta" => {
                    let index = event["index"].as_i64().unwrap_or(0);
                    let delta = &event["delta"];
                    match delta["type"].as_str().unwrap_or("") {
                        "text_delta" => {
                            if let Some(text) = delta["text"].as_str() {
                                self.append_text(index, "text", text);
                            }
                        }
                        "thinking_delta" => {
                            if let Some(text) = delta["thinking"].as_str() {
                                self.append_text(index, "thinking", text);
                            }
                        }
                        "input_json_delta" => {
                            if let Some(partial) = delta["partial_json"].as_str() {
                                if let Some(tool) = self.tools.get_mut(&index) {
                                    tool.2.push_str(partial);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                "message_delta" => {
                    if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                        self.stop_reason_override = Some(reason.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    fn append_text(&mut self, index: i64, block_type: &str, text: &str) {
        if let Some(entry) = self
            .blocks
            .iter_mut()
            .find(|(i, t, _)| *i == index && t.as_str() == block_type)
        {
            entry.2.push_str(text);
            return;
        }
        self.blocks.push((index, block_type.to_string(), text.to_string()));
        if !self.order.contains(&index) {
            self.order.push(index);
        }
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason_override.as_deref()
    }

    /// 折叠成 content 数组，顺序按块索引。
    pub fn into_content_blocks(self) -> Vec<Value> {
        let mut entries: Vec<(i64, Value)> = Vec::new();

        for (index, block_type, text) in self.blocks {
            if text.is_empty() {
                continue;
            }
            let block = match block_type.as_str() {
                "thinking" => json!({"type": "thinking", "thinking": text}),
                _ => json!({"type": "text", "text": text}),
            };
            entries.push((index, block));
        }

        for (index, (id, name, input_buffer)) in self.tools {
            let input: Value = if input_buffer.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&input_buffer).unwrap_or(json!({}))
            };
            entries.push((
                index,
                json!({"type": "tool_use", "id": id, "name": name, "input": input}),
            ));
        }

        entries.sort_by_key(|(index, _)| *index);
        entries.into_iter().map(|(_, block)| block).collect()
    }
}
