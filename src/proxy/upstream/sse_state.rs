// SSE 事件状态机
//
// 坐在上游事件流和客户端 writer 之间，保证产出序列满足 Anthropic
// 协议约束：message_start 只出现一次；每个 content_block_delta /
// content_block_stop 之前必有对应 start；工具块启动前自动关掉还开着
// 的文本块；message_delta 只发一次且发送前所有块已关闭。
//
// 上游把 thinking 以裸文本 <thinking>...</thinking> 形式混在 text_delta
// 里时，这里负责把它切分成独立的 thinking 块；切分点的前瞻缓冲永远
// 落在字符边界上，不会把多字节字符劈开。
//
// 实现为纯转换器：process() 吃一个事件、吐零或多个事件，写出只在
// 外层 sink 发生，属性测试不需要网络。

use std::collections::HashMap;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error};

use crate::utils::utf8::find_char_boundary;

const THINKING_START_TAG: &str = "<thinking>";
const THINKING_END_TAG: &str = "</thinking>";

#[derive(Debug, Error)]
pub enum SseViolation {
    #[error("协议违规: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
struct BlockState {
    block_type: String, // "text" | "tool_use" | "thinking"
    started: bool,
    stopped: bool,
    #[allow(dead_code)]
    tool_use_id: Option<String>,
}

/// thinking 裸文本合成所处的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkingPhase {
    /// 流开头，缓冲区还可能长成 <thinking> 标签
    Scanning,
    /// 确认没有裸 thinking 标签，全部直传
    Off,
    /// 在 thinking 块内，扫描闭合标签
    Inside,
    /// thinking 已闭合，原索引上的后续文本重定向到新文本块
    After,
}

pub struct SseStateMachine {
    strict: bool,
    message_started: bool,
    message_delta_sent: bool,
    message_ended: bool,
    blocks: HashMap<i64, BlockState>,
    next_block_index: i64,

    // thinking 合成状态
    phase: ThinkingPhase,
    tag_buffer: String,
    thinking_block_index: i64,
    after_text_block_index: i64,
    after_text_block_started: bool,
}

impl SseStateMachine {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            message_started: false,
            message_delta_sent: false,
            message_ended: false,
            blocks: HashMap::new(),
            next_block_index: 0,
            phase: ThinkingPhase::Scanning,
            tag_buffer: String::new(),
            thinking_block_index: 0,
            after_text_block_index: 0,
            after_text_block_started: false,
        }
    }

    pub fn is_message_started(&self) -> bool {
        self.message_started
    }

    pub fn is_message_delta_sent(&self) -> bool {
        self.message_delta_sent
    }

    pub fn is_message_ended(&self) -> bool {
        self.message_ended
    }

    /// 尚未关闭的块索引（升序）。
    pub fn open_block_indices(&self) -> Vec<i64> {
        let mut indices: Vec<i64> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.started && !b.stopped)
            .map(|(i, _)| *i)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// 处理一个事件，返回实际应写出的事件序列。
    pub fn process(&mut self, event: Value) -> Result<Vec<Value>, SseViolation> {
        let Some(event_type) = event.get("type").and_then(|t| t.as_str()).map(str::to_string) else {
            return self.violation("事件缺少 type 字段".into());
        };

        match event_type.as_str() {
            "message_start" => self.handle_message_start(event),
            "content_block_start" => self.handle_content_block_start(event),
            "content_block_delta" => self.handle_content_block_delta(event),
            "content_block_stop" => self.handle_content_block_stop(event),
            "message_delta" => self.handle_message_delta(event),
            "message_stop" => self.handle_message_stop(event),
            // ping 等其他事件直接转发
            _ => Ok(vec![event]),
        }
    }

    /// 流侧异常帧处理。
    ///
    /// 内容超限映射为 max_tokens 正常收尾（吞掉异常，线上保持合法
    /// 序列）；限流映射为 overloaded error 事件。无法识别的异常返回
    /// None，由调用方决定如何兜底。
    pub fn handle_exception(
        &mut self,
        exception_type: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Option<Vec<Value>> {
        if exception_type == "ContentLengthExceededException"
            || exception_type.contains("CONTENT_LENGTH_EXCEEDS")
        {
            let mut out = Vec::new();
            for index in self.open_block_indices() {
                if let Ok(events) =
                    self.process(json!({"type": "content_block_stop", "index": index}))
                {
                    out.extend(events);
                }
            }
            if let Ok(events) = self.process(json!({
                "type": "message_delta",
                "delta": {"stop_reason": "max_tokens", "stop_sequence": null},
                "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
            })) {
                out.extend(events);
            }
            if let Ok(events) = self.process(json!({"type": "message_stop"})) {
                out.extend(events);
            }
            return Some(out);
        }

        if exception_type == "ThrottlingException" || exception_type.contains("Throttling") {
            return Some(vec![json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "服务繁忙，请稍后重试"},
            })]);
        }

        None
    }

    /// 流结束时冲掉合成缓冲里残留的文本。
    ///
    /// 扣在扫描窗口里的半截标签按普通文本放行；没等到闭合标签的
    /// thinking 内容按 thinking_delta 放行。
    pub fn flush_pending(&mut self) -> Vec<Value> {
        if self.tag_buffer.is_empty() {
            return Vec::new();
        }
        let buffered = std::mem::take(&mut self.tag_buffer);
        match self.phase {
            ThinkingPhase::Scanning => {
                let event = json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": buffered},
                });
                self.phase = ThinkingPhase::Off;
                self.forward_delta(0, "text_delta", event).unwrap_or_default()
            }
            ThinkingPhase::Inside => vec![json!({
                "type": "content_block_delta",
                "index": self.thinking_block_index,
                "delta": {"type": "thinking_delta", "thinking": buffered},
            })],
            _ => Vec::new(),
        }
    }

    // ---- 各事件处理 ----

    fn handle_message_start(&mut self, event: Value) -> Result<Vec<Value>, SseViolation> {
        if self.message_started {
            error!("违规：message_start 只能出现一次");
            return self.violation("message_start 只能出现一次".into());
        }
        self.message_started = true;
        Ok(vec![event])
    }

    fn handle_content_block_start(&mut self, event: Value) -> Result<Vec<Value>, SseViolation> {
        if !self.message_started {
            error!("违规：content_block_start 必须在 message_start 之后");
            if self.strict {
                return Err(SseViolation::Protocol(
                    "content_block_start 必须在 message_start 之后".into(),
                ));
            }
        }
        if self.message_ended {
            error!("违规：message 已结束，不能发送 content_block_start");
            return self.violation("message 已结束".into());
        }

        let index = extract_index(&event).unwrap_or(self.next_block_index);

        // 上游可能重复发 start；静默跳过避免中断流
        if let Some(block) = self.blocks.get(&index) {
            if block.started && !block.stopped {
                debug!(block_index = index, block_type = %block.block_type, "跳过重复的 content_block_start");
                return Ok(Vec::new());
            }
        }

        let block_type = event
            .get("content_block")
            .and_then(|cb| cb.get("type"))
            .and_then(|t| t.as_str())
            .unwrap_or("text")
            .to_string();

        let mut out = Vec::new();

        // 工具块启动前，自动关闭所有未关闭的文本块。上游在工具调用
        // 期间仍可能往 index:0 发文本，不先关掉会产生非法交错。
        if block_type == "tool_use" {
            let open_text: Vec<i64> = self
                .blocks
                .iter()
                .filter(|(_, b)| b.block_type == "text" && b.started && !b.stopped)
                .map(|(i, _)| *i)
                .collect();
            for text_index in open_text {
                debug!(
                    text_block_index = text_index,
                    new_tool_block_index = index,
                    "工具块启动前自动关闭文本块"
                );
                out.push(json!({"type": "content_block_stop", "index": text_index}));
                if let Some(block) = self.blocks.get_mut(&text_index) {
                    block.stopped = true;
                }
            }

            // 重置 thinking 合成状态，避免工具块之后的文本被错误重定向
            if self.phase != ThinkingPhase::Scanning {
                debug!(tool_block_index = index, "工具块启动时重置 thinking 状态");
            }
            self.phase = ThinkingPhase::Scanning;
            self.tag_buffer.clear();
            self.after_text_block_started = false;
        }

        let tool_use_id = event
            .get("content_block")
            .and_then(|cb| cb.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.blocks.insert(
            index,
            BlockState {
                block_type,
                started: true,
                stopped: false,
                tool_use_id,
            },
        );
        if index >= self.next_block_index {
            self.next_block_index = index + 1;
        }

        out.push(event);
        Ok(out)
    }

    fn handle_content_block_delta(&mut self, event: Value) -> Result<Vec<Value>, SseViolation> {
        let Some(index) = extract_index(&event) else {
            error!("content_block_delta 缺少有效索引");
            return self.violation("content_block_delta 缺少有效索引".into());
        };

        let delta_type = event
            .get("delta")
            .and_then(|d| d.get("type"))
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        let delta_text = event
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or("");

        // 裸文本 thinking 合成只看 text_delta
        if delta_type == "text_delta" && !delta_text.is_empty() {
            match self.phase {
                ThinkingPhase::Scanning => return self.scan_for_thinking(index, delta_text),
                ThinkingPhase::Inside => return self.feed_thinking(delta_text),
                ThinkingPhase::After if index == self.thinking_block_index => {
                    return self.redirect_after_thinking(delta_text);
                }
                _ => {}
            }
        }

        self.forward_delta(index, &delta_type, event)
    }

    /// 流开头的标签探测。
    fn scan_for_thinking(&mut self, index: i64, text: &str) -> Result<Vec<Value>, SseViolation> {
        self.tag_buffer.push_str(text);

        let buffered = self.tag_buffer.clone();
        if let Some(rest) = buffered.strip_prefix(THINKING_START_TAG) {
            debug!(block_index = index, "检测到 thinking 开始标签");
            self.phase = ThinkingPhase::Inside;
            self.thinking_block_index = index;
            self.tag_buffer.clear();

            let mut out = self.start_block(
                index,
                json!({"type": "thinking", "thinking": ""}),
            )?;
            if !rest.is_empty() {
                let mut tail = self.feed_thinking(rest)?;
                out.append(&mut tail);
            }
            return Ok(out);
        }

        if THINKING_START_TAG.starts_with(self.tag_buffer.as_str()) {
            // 还可能长成完整标签，先扣住
            return Ok(Vec::new());
        }

        // 不是 thinking 开头；把扣下的全部文本一次性放行，之后直传
        self.phase = ThinkingPhase::Off;
        let buffered = std::mem::take(&mut self.tag_buffer);
        let event = json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "text_delta", "text": buffered},
        });
        self.forward_delta(index, "text_delta", event)
    }

    /// thinking 块内：搜闭合标签，留足回看窗口。
    fn feed_thinking(&mut self, text: &str) -> Result<Vec<Value>, SseViolation> {
        self.tag_buffer.push_str(text);
        let mut out = Vec::new();

        if let Some(end_pos) = self.tag_buffer.find(THINKING_END_TAG) {
            let content = self.tag_buffer[..end_pos].to_string();
            let mut after = self.tag_buffer[end_pos + THINKING_END_TAG.len()..].to_string();
            self.tag_buffer.clear();

            debug!(
                thinking_content_len = content.len(),
                after_len = after.len(),
                "检测到 thinking 结束标签"
            );

            if !content.is_empty() {
                out.push(json!({
                    "type": "content_block_delta",
                    "index": self.thinking_block_index,
                    "delta": {"type": "thinking_delta", "thinking": content},
                }));
            }

            let mut stop =
                self.process(json!({"type": "content_block_stop", "index": self.thinking_block_index}))?;
            out.append(&mut stop);

            self.phase = ThinkingPhase::After;

            // 跳过闭合标签后的空行
            if let Some(stripped) = after.strip_prefix("\n\n") {
                after = stripped.to_string();
            } else if let Some(stripped) = after.strip_prefix('\n') {
                after = stripped.to_string();
            }

            if !after.is_empty() {
                let mut tail = self.redirect_after_thinking(&after)?;
                out.append(&mut tail);
            }
            return Ok(out);
        }

        // 闭合标签可能被劈在 chunk 边界上，留 len(tag)-1 字节回看；
        // 切分点回退到字符边界
        let safe_len = self
            .tag_buffer
            .len()
            .saturating_sub(THINKING_END_TAG.len() - 1);
        if safe_len == 0 {
            return Ok(out);
        }
        let boundary = find_char_boundary(&self.tag_buffer, safe_len);
        if boundary == 0 {
            return Ok(out);
        }
        let safe: String = self.tag_buffer.drain(..boundary).collect();
        out.push(json!({
            "type": "content_block_delta",
            "index": self.thinking_block_index,
            "delta": {"type": "thinking_delta", "thinking": safe},
        }));
        Ok(out)
    }

    /// thinking 闭合后，原索引上的文本改道到新文本块。
    fn redirect_after_thinking(&mut self, text: &str) -> Result<Vec<Value>, SseViolation> {
        let mut out = Vec::new();
        if !self.after_text_block_started {
            self.after_text_block_index = self.next_block_index;
            let mut start = self.start_block(
                self.after_text_block_index,
                json!({"type": "text", "text": ""}),
            )?;
            out.append(&mut start);
            self.after_text_block_started = true;
            debug!(index = self.after_text_block_index, "已启动 thinking 后的文本块");
        }
        out.push(json!({
            "type": "content_block_delta",
            "index": self.after_text_block_index,
            "delta": {"type": "text_delta", "text": text},
        }));
        Ok(out)
    }

    fn start_block(&mut self, index: i64, content_block: Value) -> Result<Vec<Value>, SseViolation> {
        self.process(json!({
            "type": "content_block_start",
            "index": index,
            "content_block": content_block,
        }))
    }

    /// 常规 delta 路径：未启动的块自动补 start，已停止的块静默丢弃。
    fn forward_delta(
        &mut self,
        index: i64,
        delta_type: &str,
        event: Value,
    ) -> Result<Vec<Value>, SseViolation> {
        let mut out = Vec::new();

        let needs_start = self
            .blocks
            .get(&index)
            .map(|b| !b.started)
            .unwrap_or(true);
        if needs_start {
            debug!(block_index = index, "delta 先于 start 到达，自动生成 content_block_start");
            let content_block = if delta_type == "input_json_delta" {
                json!({
                    "type": "tool_use",
                    "id": format!("tooluse_auto_{}", index),
                    "name": "auto_detected",
                    "input": {},
                })
            } else {
                json!({"type": "text", "text": ""})
            };
            let mut start = self.start_block(index, content_block)?;
            out.append(&mut start);
        }

        if let Some(block) = self.blocks.get(&index) {
            if block.stopped {
                // 上游在块关闭后仍发 delta；跳过，不中断流
                debug!(block_index = index, block_type = %block.block_type, "跳过已停止块的 delta");
                return Ok(out);
            }
        }

        out.push(event);
        Ok(out)
    }

    fn handle_content_block_stop(&mut self, event: Value) -> Result<Vec<Value>, SseViolation> {
        let Some(index) = extract_index(&event) else {
            error!("content_block_stop 缺少有效索引");
            return self.violation("content_block_stop 缺少有效索引".into());
        };

        match self.blocks.get_mut(&index) {
            None => {
                error!(block_index = index, "违规：content_block 未启动就发送 stop");
                self.violation(format!("索引 {} 未启动就 stop", index))
            }
            Some(block) if !block.started => {
                error!(block_index = index, "违规：content_block 未启动就发送 stop");
                self.violation(format!("索引 {} 未启动就 stop", index))
            }
            Some(block) if block.stopped => {
                error!(block_index = index, "违规：content_block 重复停止");
                self.violation(format!("索引 {} 重复停止", index))
            }
            Some(block) => {
                block.stopped = true;
                Ok(vec![event])
            }
        }
    }

    fn handle_message_delta(&mut self, event: Value) -> Result<Vec<Value>, SseViolation> {
        if !self.message_started {
            error!("违规：message_delta 必须在 message_start 之后");
            if self.strict {
                return Err(SseViolation::Protocol(
                    "message_delta 必须在 message_start 之后".into(),
                ));
            }
        }

        // message_delta 一条消息只能有一次
        if self.message_delta_sent {
            error!("违规：message_delta 只能出现一次");
            return self.violation("message_delta 只能出现一次".into());
        }

        let mut out = Vec::new();

        // 发送前必须先关闭所有 content_block
        let unclosed = self.open_block_indices();
        if !unclosed.is_empty() {
            debug!(unclosed_blocks = ?unclosed, "message_delta 前自动关闭未关闭的 content_block");
            if !self.strict {
                for index in unclosed {
                    out.push(json!({"type": "content_block_stop", "index": index}));
                    if let Some(block) = self.blocks.get_mut(&index) {
                        block.stopped = true;
                    }
                }
            }
        }

        self.message_delta_sent = true;
        out.push(event);
        Ok(out)
    }

    fn handle_message_stop(&mut self, event: Value) -> Result<Vec<Value>, SseViolation> {
        if !self.message_started {
            error!("违规：message_stop 必须在 message_start 之后");
            if self.strict {
                return Err(SseViolation::Protocol(
                    "message_stop 必须在 message_start 之后".into(),
                ));
            }
        }
        if self.message_ended {
            error!("违规：message_stop 只能出现一次");
            return self.violation("message_stop 只能出现一次".into());
        }
        self.message_ended = true;
        Ok(vec![event])
    }

    fn violation(&self, message: String) -> Result<Vec<Value>, SseViolation> {
        if self.strict {
            Err(SseViolation::Protocol(message))
        } else {
            Ok(Vec::new())
        }
    }
}

fn extract_index(event: &Value) -> Option<i64> {
    event.get("index").and_then(|v| v.as_i64())
}
