// 工具调用生命周期
//
// 负责给 tool_use 块分配索引（从 1 开始，0 留给前置文本）、跟踪
// 活跃/已完成的调用、校验 tool_use↔tool_result 配对，以及在结果里
// 发现嵌套调用时递归展开（深度有上限）。
//
// 事件形状约定：content_block_start 里 input 恒为空对象，参数统一
// 通过一条 input_json_delta 下发。即使参数是一次性完整拿到的也封装
// 成 delta，下游转换器依赖这种“先头后体”的流式形态。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// 默认最大嵌套深度
pub const DEFAULT_MAX_NESTING_DEPTH: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub id: String,
    pub name: String,
    pub block_index: u64,
    pub arguments: Value,
    pub status: ToolStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// 一次工具调用请求（上游解析出的调用）。
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON 文本形式的参数
    pub arguments: String,
}

pub struct ToolLifecycleManager {
    active: HashMap<String, ToolExecution>,
    completed: HashMap<String, ToolExecution>,
    block_index_map: HashMap<String, u64>,
    next_block_index: u64,
    current_nesting_depth: u32,
    max_nesting_depth: u32,
}

impl Default for ToolLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolLifecycleManager {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            completed: HashMap::new(),
            block_index_map: HashMap::new(),
            next_block_index: 1, // 索引 0 预留给文本内容
            current_nesting_depth: 0,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }

    pub fn set_max_nesting_depth(&mut self, depth: u32) {
        if depth > 0 {
            self.max_nesting_depth = depth;
        }
    }

    /// 处理一批工具调用，生成对应的 SSE 事件。
    pub fn handle_tool_requests(&mut self, calls: &[ToolCall]) -> Vec<Value> {
        let mut events = Vec::with_capacity(calls.len() * 2);

        for call in calls {
            let arguments: Value = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str(&call.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(tool_id = %call.id, tool_name = %call.name, error = %e, "解析工具调用参数失败");
                        json!({})
                    }
                }
            };

            // 重复 id：只更新参数，不再发头
            if let Some(existing) = self.active.get_mut(&call.id) {
                debug!(tool_id = %call.id, "工具已存在，更新参数");
                if arguments.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
                    existing.arguments = arguments;
                }
                continue;
            }

            let block_index = self.block_index_for(&call.id);
            let mut execution = ToolExecution {
                id: call.id.clone(),
                name: call.name.clone(),
                block_index,
                arguments: arguments.clone(),
                status: ToolStatus::Pending,
                start_time: Utc::now(),
                end_time: None,
                result: None,
                error: None,
            };

            debug!(tool_id = %call.id, tool_name = %call.name, block_index, "开始处理工具调用");

            events.push(json!({
                "type": "content_block_start",
                "index": block_index,
                "content_block": {
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": {},
                }
            }));

            let has_args = arguments.as_object().map(|o| !o.is_empty()).unwrap_or(false);
            if has_args {
                let args_json = serde_json::to_string(&arguments).unwrap_or_else(|_| "{}".into());
                events.push(json!({
                    "type": "content_block_delta",
                    "index": block_index,
                    "delta": {
                        "type": "input_json_delta",
                        "partial_json": args_json,
                    }
                }));
            }

            execution.status = ToolStatus::Running;
            self.active.insert(call.id.clone(), execution);
        }

        events
    }

    /// 处理工具调用结果：关闭块，并递归展开结果里的嵌套调用。
    pub fn handle_tool_result(&mut self, tool_call_id: &str, result: Value) -> Vec<Value> {
        let Some(mut execution) = self.active.remove(tool_call_id) else {
            warn!(tool_call_id, "收到未知工具调用的结果");
            return Vec::new();
        };

        execution.end_time = Some(Utc::now());
        execution.result = Some(result.clone());
        execution.status = ToolStatus::Completed;

        let mut events = vec![json!({
            "type": "content_block_stop",
            "index": execution.block_index,
        })];

        self.completed.insert(tool_call_id.to_string(), execution);

        let nested = extract_nested_tool_calls(&result);
        if !nested.is_empty() {
            info!(
                parent_tool_id = tool_call_id,
                nested_count = nested.len(),
                current_depth = self.current_nesting_depth,
                "检测到嵌套工具调用"
            );
            if self.current_nesting_depth >= self.max_nesting_depth {
                warn!(
                    current_depth = self.current_nesting_depth,
                    max_depth = self.max_nesting_depth,
                    parent_tool_id = tool_call_id,
                    "嵌套工具调用深度超过限制，停止展开"
                );
            } else {
                self.current_nesting_depth += 1;
                events.extend(self.handle_tool_requests(&nested));
                self.current_nesting_depth -= 1;
            }
        }

        events
    }

    /// 工具调用出错：发 error 事件并关闭块。
    pub fn handle_tool_error(&mut self, tool_call_id: &str, error: &str) -> Vec<Value> {
        let Some(mut execution) = self.active.remove(tool_call_id) else {
            warn!(tool_call_id, "收到未知工具调用的错误");
            return Vec::new();
        };

        execution.end_time = Some(Utc::now());
        execution.error = Some(error.to_string());
        execution.status = ToolStatus::Error;

        warn!(tool_id = %tool_call_id, tool_name = %execution.name, error, "工具调用失败");

        let events = vec![
            json!({
                "type": "error",
                "error": {
                    "type": "tool_error",
                    "message": error,
                    "tool_call_id": tool_call_id,
                }
            }),
            json!({
                "type": "content_block_stop",
                "index": execution.block_index,
            }),
        ];

        self.completed.insert(tool_call_id.to_string(), execution);
        events
    }

    /// 过滤孤立的 tool_result：只保留有对应调用记录的条目。
    pub fn validate_tool_pairing(&self, tool_results: Vec<Value>) -> Vec<Value> {
        if tool_results.is_empty() {
            return tool_results;
        }

        let total = tool_results.len();
        let valid: Vec<Value> = tool_results
            .into_iter()
            .filter(|result| {
                let Some(id) = result.get("tool_use_id").and_then(|v| v.as_str()) else {
                    warn!("工具结果缺少 tool_use_id，跳过");
                    return false;
                };
                if self.has_tool_call(id) {
                    true
                } else {
                    warn!(tool_use_id = id, "发现孤立的工具结果，对应调用不存在");
                    false
                }
            })
            .collect();

        if valid.len() != total {
            info!(
                total_results = total,
                valid_results = valid.len(),
                orphaned_results = total - valid.len(),
                "工具配对校验完成，已移除孤立结果"
            );
        }
        valid
    }

    pub fn has_tool_call(&self, tool_id: &str) -> bool {
        self.active.contains_key(tool_id) || self.completed.contains_key(tool_id)
    }

    pub fn get_execution(&self, tool_id: &str) -> Option<&ToolExecution> {
        self.active.get(tool_id).or_else(|| self.completed.get(tool_id))
    }

    pub fn active_tools(&self) -> impl Iterator<Item = &ToolExecution> {
        self.active.values()
    }

    pub fn completed_tools(&self) -> impl Iterator<Item = &ToolExecution> {
        self.completed.values()
    }

    pub fn has_any_tools(&self) -> bool {
        !self.active.is_empty() || !self.completed.is_empty()
    }

    pub fn block_index_of(&self, tool_id: &str) -> Option<u64> {
        self.block_index_map.get(tool_id).copied()
    }

    fn block_index_for(&mut self, tool_id: &str) -> u64 {
        if let Some(index) = self.block_index_map.get(tool_id) {
            return *index;
        }
        let index = self.next_block_index;
        self.block_index_map.insert(tool_id.to_string(), index);
        self.next_block_index += 1;
        index
    }
}

/// 从工具结果里提取嵌套调用。
///
/// 兼容三种形态：单个 tool_use 块、Anthropic content 数组、OpenAI
/// tool_calls 数组；字符串结果先尝试按 JSON 解析。
fn extract_nested_tool_calls(result: &Value) -> Vec<ToolCall> {
    match result {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => extract_nested_tool_calls(&parsed),
            Err(_) => Vec::new(),
        },
        Value::Object(obj) => {
            let mut calls = Vec::new();
            if let Some(call) = parse_tool_use_block(result) {
                calls.push(call);
            }
            if let Some(content) = obj.get("content").and_then(|c| c.as_array()) {
                for item in content {
                    if let Some(call) = parse_tool_use_block(item) {
                        calls.push(call);
                    }
                }
            }
            if let Some(tool_calls) = obj.get("tool_calls").and_then(|c| c.as_array()) {
                for item in tool_calls {
                    if let Some(call) = parse_openai_tool_call(item) {
                        calls.push(call);
                    }
                }
            }
            calls
        }
        Value::Array(items) => items.iter().filter_map(parse_tool_use_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_tool_use_block(block: &Value) -> Option<ToolCall> {
    if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
        return None;
    }
    let id = block.get("id").and_then(|v| v.as_str())?;
    let name = block.get("name").and_then(|v| v.as_str())?;
    if id.is_empty() || name.is_empty() {
        return None;
    }

    let arguments = match block.get("input") {
        Some(Value::Object(obj)) => serde_json::to_string(obj).unwrap_or_else(|_| "{}".into()),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => "{}".to_string(),
    };

    Some(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    })
}

fn parse_openai_tool_call(block: &Value) -> Option<ToolCall> {
    if let Some(t) = block.get("type").and_then(|t| t.as_str()) {
        if t != "function" {
            return None;
        }
    }
    let id = block.get("id").and_then(|v| v.as_str())?;
    if id.is_empty() {
        return None;
    }
    let function = block.get("function")?;
    let name = function.get("name").and_then(|v| v.as_str())?;
    if name.is_empty() {
        return None;
    }

    let arguments = match function.get("arguments") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Object(obj)) => serde_json::to_string(obj).unwrap_or_else(|_| "{}".into()),
        _ => "{}".to_string(),
    };

    Some(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    #[test]
    fn block_indices_start_at_one() {
        let mut mgr = ToolLifecycleManager::new();
        let events = mgr.handle_tool_requests(&[
            call("t1", "get_weather", r#"{"city":"SF"}"#),
            call("t2", "get_time", "{}"),
        ]);

        assert_eq!(mgr.block_index_of("t1"), Some(1));
        assert_eq!(mgr.block_index_of("t2"), Some(2));

        // t1: start + delta；t2 无参数: 只有 start
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["type"], "content_block_start");
        assert_eq!(events[0]["content_block"]["input"], json!({}));
        assert_eq!(events[1]["type"], "content_block_delta");
        assert_eq!(events[1]["delta"]["type"], "input_json_delta");
        assert_eq!(events[2]["index"], 2);
    }

    #[test]
    fn header_then_body_shape_even_for_one_shot_args() {
        let mut mgr = ToolLifecycleManager::new();
        let events = mgr.handle_tool_requests(&[call("t1", "w", r#"{"city":"SF"}"#)]);
        // 头里 input 为空，参数全在 delta 里
        assert_eq!(events[0]["content_block"]["input"], json!({}));
        let partial: Value =
            serde_json::from_str(events[1]["delta"]["partial_json"].as_str().unwrap()).unwrap();
        assert_eq!(partial["city"], "SF");
    }

    #[test]
    fn result_closes_block_and_completes() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.handle_tool_requests(&[call("t1", "w", "{}")]);
        assert_eq!(mgr.active_tools().count(), 1);

        let events = mgr.handle_tool_result("t1", json!("42 degrees"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "content_block_stop");
        assert_eq!(events[0]["index"], 1);

        assert_eq!(mgr.active_tools().count(), 0);
        assert_eq!(mgr.completed_tools().count(), 1);
        assert_eq!(mgr.get_execution("t1").unwrap().status, ToolStatus::Completed);
    }

    #[test]
    fn unknown_result_ignored() {
        let mut mgr = ToolLifecycleManager::new();
        assert!(mgr.handle_tool_result("ghost", json!("x")).is_empty());
    }

    #[test]
    fn duplicate_request_updates_arguments_without_new_events() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.handle_tool_requests(&[call("t1", "w", "{}")]);
        let events = mgr.handle_tool_requests(&[call("t1", "w", r#"{"city":"LA"}"#)]);
        assert!(events.is_empty());
        assert_eq!(mgr.get_execution("t1").unwrap().arguments["city"], "LA");
    }

    #[test]
    fn nested_calls_expand_within_depth() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.handle_tool_requests(&[call("t1", "outer", "{}")]);

        let nested_result = json!({
            "content": [
                {"type": "tool_use", "id": "t2", "name": "inner", "input": {"k": 1}}
            ]
        });
        let events = mgr.handle_tool_result("t1", nested_result);

        // stop(t1) + start(t2) + delta(t2)
        assert_eq!(events.len(), 3);
        assert_eq!(events[1]["content_block"]["id"], "t2");
        assert_eq!(mgr.block_index_of("t2"), Some(2));
    }

    #[test]
    fn nesting_depth_is_capped() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.set_max_nesting_depth(1);
        mgr.current_nesting_depth = 1; // 已在第一层
        mgr.handle_tool_requests(&[call("t1", "outer", "{}")]);

        let nested_result = json!([{"type": "tool_use", "id": "t2", "name": "inner", "input": {}}]);
        let events = mgr.handle_tool_result("t1", nested_result);
        // 只关闭 t1，不展开 t2
        assert_eq!(events.len(), 1);
        assert!(!mgr.has_tool_call("t2"));
    }

    #[test]
    fn openai_style_nested_calls() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.handle_tool_requests(&[call("t1", "outer", "{}")]);
        let result = json!({
            "tool_calls": [
                {"id": "t2", "type": "function", "function": {"name": "inner", "arguments": "{\"a\":1}"}}
            ]
        });
        let events = mgr.handle_tool_result("t1", result);
        assert_eq!(events.len(), 3);
        assert_eq!(events[1]["content_block"]["name"], "inner");
    }

    #[test]
    fn string_result_parsed_as_json() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.handle_tool_requests(&[call("t1", "outer", "{}")]);
        let result = json!(
            r#"[{"type": "tool_use", "id": "t2", "name": "inner", "input": {}}]"#
        );
        let events = mgr.handle_tool_result("t1", result);
        assert_eq!(events.len(), 2); // stop + nested start（无参数）
    }

    #[test]
    fn pairing_filters_orphans() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.handle_tool_requests(&[call("t1", "w", "{}")]);
        mgr.handle_tool_result("t1", json!("ok"));

        let results = vec![
            json!({"tool_use_id": "t1", "content": "ok"}),
            json!({"tool_use_id": "orphan", "content": "lost"}),
            json!({"content": "no id"}),
        ];
        let valid = mgr.validate_tool_pairing(results);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0]["tool_use_id"], "t1");
    }

    #[test]
    fn error_emits_error_event_then_stop() {
        let mut mgr = ToolLifecycleManager::new();
        mgr.handle_tool_requests(&[call("t1", "w", "{}")]);
        let events = mgr.handle_tool_error("t1", "boom");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "error");
        assert_eq!(events[0]["error"]["tool_call_id"], "t1");
        assert_eq!(events[1]["type"], "content_block_stop");
        assert_eq!(mgr.get_execution("t1").unwrap().status, ToolStatus::Error);
    }
}
