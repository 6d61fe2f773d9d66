// OpenAI ChatCompletions 协议模型与双向转换
//
// OpenAI 请求统一转换为内部 Anthropic 形态走同一条编排路径；
// 响应在边界层转换回 chat.completion / chat.completion.chunk。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::claude::{
    AnthropicRequest, ContentBlock, Message, MessageContent, OutputConfig, SystemBlock,
    SystemPrompt, ThinkingConfig, Tool, ToolChoice, THINKING_BUDGET_DEFAULT,
};
use crate::config;

pub const DEFAULT_MAX_TOKENS: u32 = 16_384;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String, // "system" | "user" | "assistant" | "tool"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub type_: String,
    pub function: OpenAiToolFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiToolFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type", default = "function_type")]
    pub type_: String,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// OpenAI content（字符串或分段数组）压平为纯文本。
fn flatten_openai_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let mut out = Vec::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    out.push(text.to_string());
                }
            }
            out.join("\n")
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// OpenAI 请求 → 内部 Anthropic 请求。
///
/// 工具配对在转换期校验：孤立的 tool 消息（找不到对应 tool_calls id）
/// 直接丢弃，连续 tool 消息合并为一个 user 消息里的多个 tool_result 块。
pub fn convert_openai_to_anthropic(req: OpenAiRequest) -> AnthropicRequest {
    // 第一遍：收集所有 assistant tool_calls 的 id
    let mut all_tool_use_ids = std::collections::HashSet::new();
    for msg in &req.messages {
        if msg.role == "assistant" {
            if let Some(calls) = &msg.tool_calls {
                for call in calls {
                    all_tool_use_ids.insert(call.id.clone());
                }
            }
        }
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    let mut iter = req.messages.into_iter().peekable();
    while let Some(msg) = iter.next() {
        match msg.role.as_str() {
            "system" => {
                let text = msg
                    .content
                    .as_ref()
                    .map(flatten_openai_content)
                    .unwrap_or_default();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "tool" => {
                // 合并连续 tool 消息
                let mut blocks: Vec<ContentBlock> = Vec::new();
                let mut push_result = |m: OpenAiMessage| {
                    let id = m.tool_call_id.unwrap_or_default();
                    if id.is_empty() || !all_tool_use_ids.contains(&id) {
                        tracing::warn!(tool_use_id = %id, "跳过孤立的 tool_result：找不到对应的 tool_use");
                        return;
                    }
                    let text = m.content.as_ref().map(flatten_openai_content).unwrap_or_default();
                    blocks.push(ContentBlock::ToolResult {
                        tool_use_id: id,
                        content: Value::String(text),
                        is_error: None,
                    });
                };
                push_result(msg);
                while iter.peek().map(|m| m.role == "tool").unwrap_or(false) {
                    push_result(iter.next().unwrap());
                }
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: "user".into(),
                        content: MessageContent::Array(blocks),
                    });
                }
            }
            "assistant" => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                let text = msg
                    .content
                    .as_ref()
                    .map(flatten_openai_content)
                    .unwrap_or_default();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                if let Some(calls) = msg.tool_calls {
                    // 仅有 tool_calls 时补占位文本，上游要求 assistant content 非空
                    if blocks.is_empty() && !calls.is_empty() {
                        blocks.push(ContentBlock::Text { text: " ".into() });
                    }
                    for call in calls {
                        let input = if call.function.arguments.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&call.function.arguments).unwrap_or(json!({}))
                        };
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id,
                            name: call.function.name,
                            input,
                            cache_control: None,
                        });
                    }
                }
                if blocks.is_empty() {
                    messages.push(Message {
                        role: "assistant".into(),
                        content: MessageContent::String(String::new()),
                    });
                } else {
                    messages.push(Message {
                        role: "assistant".into(),
                        content: MessageContent::Array(blocks),
                    });
                }
            }
            _ => {
                let text = msg
                    .content
                    .as_ref()
                    .map(flatten_openai_content)
                    .unwrap_or_default();
                messages.push(Message {
                    role: "user".into(),
                    content: MessageContent::String(text),
                });
            }
        }
    }

    let mut max_tokens = req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

    // -thinking 后缀自动开启思考模式
    let mut model = req.model;
    let mut thinking: Option<ThinkingConfig> = None;
    let mut output_config: Option<OutputConfig> = None;
    if config::has_thinking_suffix(&model) {
        let normalized = config::normalize_model_name(&model);
        model = normalized.clone();
        if normalized.contains("opus") && (normalized.contains("4-6") || normalized.contains("4.6")) {
            thinking = Some(ThinkingConfig {
                type_: "adaptive".into(),
                budget_tokens: None,
            });
            output_config = Some(OutputConfig {
                effort: Some("high".into()),
            });
        } else {
            thinking = Some(ThinkingConfig {
                type_: "enabled".into(),
                budget_tokens: Some(THINKING_BUDGET_DEFAULT),
            });
        }
        if max_tokens <= THINKING_BUDGET_DEFAULT {
            max_tokens = THINKING_BUDGET_DEFAULT + 4096;
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| Tool {
                name: t.function.name,
                description: t.function.description,
                input_schema: t.function.parameters,
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = req.tool_choice.and_then(|choice| match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" | "none" => Some(ToolChoice::Mode(mode)),
            "required" => Some(ToolChoice::Mode("any".into())),
            _ => None,
        },
        Value::Object(obj) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| ToolChoice::Typed {
                type_: "tool".into(),
                name: Some(name.to_string()),
            }),
        _ => None,
    });

    AnthropicRequest {
        model,
        messages,
        max_tokens,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(SystemPrompt::Array(
                system_parts
                    .into_iter()
                    .map(|text| SystemBlock {
                        block_type: "text".into(),
                        text,
                    })
                    .collect(),
            ))
        },
        tools,
        tool_choice,
        stream: req.stream.unwrap_or(false),
        temperature: req.temperature,
        thinking,
        metadata: None,
        output_config,
    }
}

/// Anthropic 响应 JSON → OpenAI chat.completion。
pub fn convert_anthropic_to_openai(
    anthropic_resp: &Value,
    model: &str,
    message_id: &str,
    created: i64,
) -> Value {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut finish_reason = "stop";

    if let Some(blocks) = anthropic_resp.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        text_parts.push(text.to_string());
                    }
                }
                Some("tool_use") => {
                    finish_reason = "tool_calls";
                    let args = block
                        .get("input")
                        .map(|i| serde_json::to_string(i).unwrap_or_else(|_| "{}".into()))
                        .unwrap_or_else(|| "{}".into());
                    tool_calls.push(json!({
                        "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                        "type": "function",
                        "function": {
                            "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                            "arguments": args,
                        }
                    }));
                }
                _ => {}
            }
        }
    }

    if anthropic_resp.get("stop_reason").and_then(|v| v.as_str()) == Some("max_tokens") {
        finish_reason = "length";
    }

    let content = text_parts.join("");
    let prompt_tokens = anthropic_resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let completion_tokens = anthropic_resp["usage"]["output_tokens"]
        .as_u64()
        .unwrap_or((content.len() / 4) as u64);

    let mut message = json!({
        "role": "assistant",
        "content": content,
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": message_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_request(messages: Vec<OpenAiMessage>) -> OpenAiRequest {
        OpenAiRequest {
            model: "claude-sonnet-4-5".into(),
            messages,
            max_tokens: None,
            temperature: None,
            stream: None,
            tools: None,
            tool_choice: None,
        }
    }

    fn user_msg(text: &str) -> OpenAiMessage {
        OpenAiMessage {
            role: "user".into(),
            content: Some(Value::String(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn system_message_becomes_system_prompt() {
        let req = basic_request(vec![
            OpenAiMessage {
                role: "system".into(),
                content: Some(Value::String("be brief".into())),
                tool_calls: None,
                tool_call_id: None,
            },
            user_msg("hello"),
        ]);
        let out = convert_openai_to_anthropic(req);
        assert_eq!(out.messages.len(), 1);
        match out.system.unwrap() {
            SystemPrompt::Array(blocks) => assert_eq!(blocks[0].text, "be brief"),
            _ => panic!("expected block system prompt"),
        }
        assert_eq!(out.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_messages_merge_into_tool_results() {
        let req = basic_request(vec![
            user_msg("check two cities"),
            OpenAiMessage {
                role: "assistant".into(),
                content: None,
                tool_calls: Some(vec![
                    OpenAiToolCall {
                        id: "t1".into(),
                        type_: "function".into(),
                        function: OpenAiToolFunction {
                            name: "get_weather".into(),
                            arguments: "{\"city\":\"SF\"}".into(),
                        },
                    },
                    OpenAiToolCall {
                        id: "t2".into(),
                        type_: "function".into(),
                        function: OpenAiToolFunction {
                            name: "get_weather".into(),
                            arguments: "{\"city\":\"LA\"}".into(),
                        },
                    },
                ]),
                tool_call_id: None,
            },
            OpenAiMessage {
                role: "tool".into(),
                content: Some(Value::String("sunny".into())),
                tool_calls: None,
                tool_call_id: Some("t1".into()),
            },
            OpenAiMessage {
                role: "tool".into(),
                content: Some(Value::String("foggy".into())),
                tool_calls: None,
                tool_call_id: Some("t2".into()),
            },
        ]);
        let out = convert_openai_to_anthropic(req);
        assert_eq!(out.messages.len(), 3);

        // assistant 消息：占位文本 + 两个 tool_use
        let MessageContent::Array(blocks) = &out.messages[1].content else {
            panic!("assistant content should be blocks");
        };
        assert!(matches!(blocks[0], ContentBlock::Text { .. }));
        assert_eq!(
            blocks
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .count(),
            2
        );

        // 连续 tool 消息合并为一个 user 消息
        let MessageContent::Array(results) = &out.messages[2].content else {
            panic!("tool results should be blocks");
        };
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn orphan_tool_message_is_dropped() {
        let req = basic_request(vec![
            user_msg("x"),
            OpenAiMessage {
                role: "tool".into(),
                content: Some(Value::String("lost".into())),
                tool_calls: None,
                tool_call_id: Some("nope".into()),
            },
        ]);
        let out = convert_openai_to_anthropic(req);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn thinking_suffix_adjusts_max_tokens() {
        let mut req = basic_request(vec![user_msg("x")]);
        req.model = "claude-sonnet-4-5-thinking".into();
        req.max_tokens = Some(1000);
        let out = convert_openai_to_anthropic(req);
        assert_eq!(out.model, "claude-sonnet-4-5");
        assert!(out.thinking.is_some());
        assert!(out.max_tokens > THINKING_BUDGET_DEFAULT);
    }

    #[test]
    fn required_tool_choice_maps_to_any() {
        let mut req = basic_request(vec![user_msg("x")]);
        req.tool_choice = Some(Value::String("required".into()));
        let out = convert_openai_to_anthropic(req);
        assert_eq!(out.tool_choice.unwrap().mode(), "any");
    }

    #[test]
    fn response_conversion_text_and_tools() {
        let anthropic = json!({
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "t1", "name": "get_weather", "input": {"city": "SF"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let out = convert_anthropic_to_openai(&anthropic, "claude-sonnet-4-5", "msg_1", 1000);
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(out["choices"][0]["message"]["content"], "Let me check.");
        assert_eq!(
            out["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "get_weather"
        );
        assert_eq!(out["usage"]["total_tokens"], 19);
    }

    #[test]
    fn response_conversion_max_tokens_maps_to_length() {
        let anthropic = json!({
            "content": [{"type": "text", "text": "partial"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let out = convert_anthropic_to_openai(&anthropic, "m", "id", 0);
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }
}
