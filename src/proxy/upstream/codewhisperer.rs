// Anthropic 请求 → CodeWhisperer envelope
//
// 上游对会话结构的要求很挑剔：history 必须 user/assistant 严格交替、
// assistant 消息 content 非空、tool_result 必须能配上前一轮的
// tool_use。这里负责所有整形，包括孤立工具对的双向清理。

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{self, model_resolver};
use crate::error::ApiError;
use crate::models::claude::{
    AnthropicRequest, ContentBlock, Message, MessageContent, SystemPrompt,
};
use crate::models::codewhisperer::{
    AssistantResponseMessage, CodeWhispererImage, CodeWhispererRequest, CodeWhispererThinking,
    CodeWhispererTool, ConversationState, CurrentMessage, HistoryMessage, ImageBytes,
    InferenceConfiguration, InputSchema, ToolResultEntry, ToolSpecification, ToolUseEntry,
    UserInputMessage, UserInputMessageContext,
};
use crate::utils::utf8::truncate_utf8_with_ellipsis;

/// thinking 模式下 max_tokens 至少比预算多出的余量
const THINKING_OUTPUT_HEADROOM: u32 = 4096;

/// 从稳定种子派生确定性 UUID（同一会话所有轮次拿到同一个 id）。
fn stable_uuid(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // 标成 v4/RFC4122 变体，上游只认 UUID 形状
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes).to_string()
}

fn is_uuid_like(s: &str) -> bool {
    Uuid::parse_str(s).is_ok()
}

/// metadata.user_id 里形如 `..._session_<uuid>` 的片段。
fn session_uuid_from_metadata(req: &AnthropicRequest) -> Option<String> {
    let user_id = req.metadata.as_ref()?.user_id.as_deref()?.trim();
    let pos = user_id.find("session_")?;
    let candidate = &user_id[pos + "session_".len()..];
    if candidate.len() < 36 {
        return None;
    }
    let candidate = &candidate[..36];
    is_uuid_like(candidate).then(|| candidate.to_string())
}

/// 消息内容压平：文本拼接 + 图片提取。
fn process_message_content(content: &MessageContent) -> (String, Vec<CodeWhispererImage>) {
    match content {
        MessageContent::String(s) => (s.clone(), Vec::new()),
        MessageContent::Array(blocks) => {
            let mut parts = Vec::new();
            let mut images = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(text.clone()),
                    ContentBlock::Thinking { thinking, .. } => {
                        if !thinking.is_empty() {
                            parts.push(thinking.clone());
                        }
                    }
                    ContentBlock::Image { source, .. } => {
                        images.push(convert_image(&source.media_type, &source.data));
                    }
                    _ => {}
                }
            }
            (parts.join("\n"), images)
        }
    }
}

/// base64 图片 → 上游格式；容忍 data URL 前缀。
fn convert_image(media_type: &str, data: &str) -> CodeWhispererImage {
    let mut media_type = media_type.to_string();
    let mut data = data.to_string();
    if data.starts_with("data:") {
        if let Some(comma) = data.find(',') {
            let header = &data[..comma];
            if let Some(extracted) = header.split(';').next().and_then(|p| p.strip_prefix("data:")) {
                if !extracted.is_empty() {
                    media_type = extracted.to_string();
                }
            }
            data = data[comma + 1..].to_string();
        }
    }
    let format = media_type
        .rsplit('/')
        .next()
        .unwrap_or(media_type.as_str())
        .to_string();
    CodeWhispererImage {
        format,
        source: ImageBytes { bytes: data },
    }
}

/// user 消息里的 tool_result 块。
fn extract_tool_results(content: &MessageContent) -> Vec<ToolResultEntry> {
    let MessageContent::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| {
            let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            else {
                return None;
            };
            let text = match content {
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let is_err = is_error.unwrap_or(false);
            Some(ToolResultEntry {
                tool_use_id: tool_use_id.clone(),
                content: vec![serde_json::json!({"text": text})],
                status: if is_err { "error" } else { "success" }.to_string(),
                is_error: is_err.then_some(true),
            })
        })
        .collect()
}

/// assistant 消息里的 tool_use 块。web_search 不送上游。
fn extract_tool_uses(content: &MessageContent) -> Vec<ToolUseEntry> {
    let MessageContent::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| {
            let ContentBlock::ToolUse { id, name, input, .. } = block else {
                return None;
            };
            if name == "web_search" || name == "websearch" {
                warn!(tool_name = %name, "过滤历史消息中不支持的工具调用");
                return None;
            }
            Some(ToolUseEntry {
                tool_use_id: id.clone(),
                name: name.clone(),
                input: if input.is_object() {
                    input.clone()
                } else {
                    serde_json::json!({})
                },
            })
        })
        .collect()
}

fn truncate_description(description: &str, tool_name: &str, max_len: usize) -> String {
    if max_len == 0 || description.len() <= max_len {
        return description.to_string();
    }
    let truncated = truncate_utf8_with_ellipsis(description, max_len);
    warn!(
        tool_name,
        original_length = description.len(),
        truncated_length = truncated.len(),
        max_allowed = max_len,
        "工具描述被截断"
    );
    truncated
}

/// thinking 启用时注入到系统消息最前面的标签。
fn thinking_prefix(req: &AnthropicRequest) -> Option<String> {
    let thinking = req.thinking.as_ref()?;
    if thinking.type_ != "enabled" && thinking.type_ != "adaptive" {
        return None;
    }
    let budget = thinking.normalize_budget_tokens();
    Some(format!(
        "<thinking_mode>enabled</thinking_mode><max_thinking_length>{}</max_thinking_length>",
        budget
    ))
}

fn has_thinking_tags(content: &str) -> bool {
    content.contains("<thinking_mode>") || content.contains("<max_thinking_length>")
}

fn placeholder_tool(tool_name: &str) -> CodeWhispererTool {
    CodeWhispererTool {
        tool_specification: ToolSpecification {
            name: tool_name.to_string(),
            description: "Tool used in conversation history".to_string(),
            input_schema: InputSchema {
                json: serde_json::json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {},
                    "required": [],
                    "additionalProperties": true,
                }),
            },
        },
    }
}

fn history_user(content: String, model_id: &str) -> UserInputMessage {
    UserInputMessage {
        content,
        images: Vec::new(),
        model_id: model_id.to_string(),
        origin: "AI_EDITOR".to_string(),
        user_input_message_context: None,
    }
}

/// 构建上游请求 envelope。
pub fn build_codewhisperer_request(
    req: &AnthropicRequest,
    session_id: &str,
    profile_arn: Option<&str>,
    max_tool_description_length: usize,
) -> Result<CodeWhispererRequest, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("消息列表为空".into()));
    }

    let agent_continuation_id = stable_uuid(&format!("{}:continuation", session_id));

    // 宽松模型归一化：别名 + 家族匹配
    let Some(resolved) = model_resolver::resolve_model_id(&req.model) else {
        warn!(requested_model = %req.model, "模型映射不存在");
        return Err(ApiError::ModelNotFound {
            model: req.model.clone(),
            request_id: agent_continuation_id,
        });
    };
    if resolved.canonical != config::normalize_model_name(&req.model) {
        info!(requested_model = %req.model, resolved_model = %resolved.canonical, "模型已归一化");
    }
    let model_id = resolved.model_id;

    // 会话 id：metadata 里的 session UUID 优先，否则由 session_id 确定性派生
    let conversation_id = session_uuid_from_metadata(req).unwrap_or_else(|| {
        if is_uuid_like(session_id) {
            session_id.to_string()
        } else {
            stable_uuid(session_id)
        }
    });

    // 当前消息与历史的划分：最后一条是 assistant 时整体进历史，
    // 当前消息用 "Continue" 占位
    let mut messages: Vec<&Message> = req.messages.iter().collect();
    let trailing_assistant = messages
        .last()
        .map(|m| m.role == "assistant")
        .unwrap_or(false);
    let continue_message = Message {
        role: "user".to_string(),
        content: MessageContent::String("Continue".to_string()),
    };
    if trailing_assistant {
        messages.push(&continue_message);
    }
    let (history_messages, last_message) = messages.split_at(messages.len() - 1);
    let last_message = last_message[0];

    // 当前消息内容
    let (current_text, current_images) = process_message_content(&last_message.content);
    let current_tool_results = if last_message.role == "user" {
        extract_tool_results(&last_message.content)
    } else {
        Vec::new()
    };

    // 工具定义（web_search 过滤 + 描述截断）
    let mut current_tools: Vec<CodeWhispererTool> = Vec::new();
    if let Some(tools) = &req.tools {
        for tool in tools {
            if tool.name.is_empty() {
                warn!("跳过无名称的工具");
                continue;
            }
            if tool.is_web_search() {
                warn!(tool_name = %tool.name, "过滤不支持的工具定义");
                continue;
            }
            current_tools.push(CodeWhispererTool {
                tool_specification: ToolSpecification {
                    name: tool.name.clone(),
                    description: truncate_description(
                        tool.description.as_deref().unwrap_or(""),
                        &tool.name,
                        max_tool_description_length,
                    ),
                    input_schema: InputSchema {
                        json: tool.input_schema.clone().unwrap_or(serde_json::json!({})),
                    },
                },
            });
        }
    }

    // ---- 历史构建 ----
    let mut history: Vec<HistoryMessage> = Vec::new();

    // 系统提示折叠成开头的 user/"OK" 对；thinking 标签注入到最前
    let system_text = req.system.as_ref().map(SystemPrompt::joined_text);
    let prefix = thinking_prefix(req);
    let mut system_content = system_text.unwrap_or_default().trim().to_string();
    if let Some(prefix) = &prefix {
        if system_content.is_empty() {
            system_content = prefix.clone();
        } else if !has_thinking_tags(&system_content) {
            system_content = format!("{}\n{}", prefix, system_content);
            debug!("已注入 thinking 标签到系统消息");
        }
    }
    if !system_content.is_empty() {
        history.push(HistoryMessage::User(history_user(system_content, &model_id)));
        history.push(HistoryMessage::Assistant(AssistantResponseMessage {
            content: "OK".to_string(),
            tool_uses: Vec::new(),
        }));
    }

    // 连续 user 消息合并，遇到 assistant 时配对落入历史
    let mut user_buffer: Vec<&Message> = Vec::new();
    let flush_users = |buffer: &mut Vec<&Message>,
                       history: &mut Vec<HistoryMessage>,
                       model_id: &str| {
        if buffer.is_empty() {
            return;
        }
        let mut parts = Vec::new();
        let mut images = Vec::new();
        let mut tool_results = Vec::new();
        for msg in buffer.iter() {
            let (text, msg_images) = process_message_content(&msg.content);
            if !text.is_empty() {
                parts.push(text);
            }
            images.extend(msg_images);
            tool_results.extend(extract_tool_results(&msg.content));
        }
        let context = if tool_results.is_empty() {
            None
        } else {
            Some(UserInputMessageContext {
                tools: Vec::new(),
                tool_results,
            })
        };
        history.push(HistoryMessage::User(UserInputMessage {
            content: parts.join("\n"),
            images,
            model_id: model_id.to_string(),
            origin: "AI_EDITOR".to_string(),
            user_input_message_context: context,
        }));
        buffer.clear();
    };

    for msg in history_messages {
        match msg.role.as_str() {
            "user" => user_buffer.push(msg),
            "assistant" => {
                if !user_buffer.is_empty() {
                    flush_users(&mut user_buffer, &mut history, &model_id);
                }
                let (text, _) = process_message_content(&msg.content);
                let tool_uses = extract_tool_uses(&msg.content);
                let content = if text.trim().is_empty() && !tool_uses.is_empty() {
                    // 仅含 tool_use 时上游要求 content 非空
                    " ".to_string()
                } else {
                    text
                };
                history.push(HistoryMessage::Assistant(AssistantResponseMessage {
                    content,
                    tool_uses,
                }));
            }
            other => {
                debug!(role = other, "历史中忽略未知角色消息");
            }
        }
    }
    // 结尾孤立的 user 消息补占位 assistant 保持配对
    if !user_buffer.is_empty() {
        let orphan_count = user_buffer.len();
        flush_users(&mut user_buffer, &mut history, &model_id);
        history.push(HistoryMessage::Assistant(AssistantResponseMessage {
            content: "OK".to_string(),
            tool_uses: Vec::new(),
        }));
        debug!(orphan_messages = orphan_count, "为孤立的 user 消息补齐占位回复");
    }

    // ---- 工具配对校验 ----
    let valid_tool_results = validate_tool_pairing(&mut history, current_tool_results);

    // 历史里用过但本轮未声明的工具补占位定义，避免上游 400
    ensure_history_tools_present(&mut current_tools, &history);

    // ---- 当前消息组装 ----
    let mut context = UserInputMessageContext {
        tools: current_tools,
        tool_results: valid_tool_results,
    };

    let mut content = current_text;
    let has_tools = !context.tools.is_empty();
    let has_tool_results = !context.tool_results.is_empty();
    if content.trim().is_empty() && current_images.is_empty() {
        if has_tool_results {
            // 工具执行后的反馈轮允许空文本
        } else if has_tools {
            // 单空格占位触发工具调用，避免污染上下文
            content = " ".to_string();
        } else {
            return Err(ApiError::BadRequest("用户消息内容和图片都为空".into()));
        }
    }

    let current_message = CurrentMessage {
        user_input_message: UserInputMessage {
            content,
            images: current_images,
            model_id: model_id.clone(),
            origin: "AI_EDITOR".to_string(),
            user_input_message_context: if context.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut context))
            },
        },
    };

    // ---- thinking 推理配置 ----
    let inference_configuration = if req.thinking_enabled() {
        let thinking = req.thinking.as_ref().unwrap();
        if let Some(choice) = &req.tool_choice {
            let mode = choice.mode();
            if mode != "auto" && mode != "none" && !mode.is_empty() {
                return Err(ApiError::BadRequest(format!(
                    "thinking 模式下 tool_choice 只能为 auto 或 none，当前为: {}",
                    mode
                )));
            }
        }
        let budget = thinking.normalize_budget_tokens();
        let mut effective_max_tokens = req.max_tokens;
        if effective_max_tokens <= budget {
            effective_max_tokens = budget + THINKING_OUTPUT_HEADROOM;
            warn!(
                original_max_tokens = req.max_tokens,
                budget_tokens = budget,
                adjusted_max_tokens = effective_max_tokens,
                "自动调整 max_tokens 以满足 thinking 模式要求"
            );
        }
        Some(InferenceConfiguration {
            max_tokens: effective_max_tokens,
            temperature: req.temperature,
            thinking: Some(CodeWhispererThinking {
                type_: "enabled".to_string(),
                budget_tokens: budget,
            }),
        })
    } else {
        None
    };

    Ok(CodeWhispererRequest {
        profile_arn: profile_arn.map(str::to_string),
        conversation_state: ConversationState {
            conversation_id,
            agent_continuation_id,
            agent_task_type: "vibe".to_string(),
            // 早期的 AUTO 触发方式会导致上游 400，统一 MANUAL
            chat_trigger_type: "MANUAL".to_string(),
            history,
            current_message,
        },
        inference_configuration,
    })
}

/// 校验当前消息的 tool_result 与历史 tool_use 的配对关系。
///
/// 只保留能配上"上一轮 assistant 的未应答 tool_use"的结果；配不上
/// 结果的 tool_use 从历史里剥掉，双向清理后上游才不会拒单。
fn validate_tool_pairing(
    history: &mut [HistoryMessage],
    tool_results: Vec<ToolResultEntry>,
) -> Vec<ToolResultEntry> {
    if tool_results.is_empty() {
        return tool_results;
    }

    let mut all_tool_use_ids = std::collections::HashSet::new();
    let mut history_result_ids = std::collections::HashSet::new();
    for msg in history.iter() {
        match msg {
            HistoryMessage::Assistant(assistant) => {
                for tool_use in &assistant.tool_uses {
                    if !tool_use.tool_use_id.is_empty() {
                        all_tool_use_ids.insert(tool_use.tool_use_id.clone());
                    }
                }
            }
            HistoryMessage::User(user) => {
                if let Some(context) = &user.user_input_message_context {
                    for result in &context.tool_results {
                        if !result.tool_use_id.is_empty() {
                            history_result_ids.insert(result.tool_use_id.clone());
                        }
                    }
                }
            }
        }
    }

    let mut unpaired: std::collections::HashSet<String> = all_tool_use_ids
        .iter()
        .filter(|id| !history_result_ids.contains(*id))
        .cloned()
        .collect();

    let mut valid = Vec::with_capacity(tool_results.len());
    for result in tool_results {
        if result.tool_use_id.is_empty() {
            continue;
        }
        if unpaired.remove(&result.tool_use_id) {
            valid.push(result);
        } else if all_tool_use_ids.contains(&result.tool_use_id) {
            warn!(tool_use_id = %result.tool_use_id, "跳过重复的 tool_result：该 tool_use 已在历史中配对");
        } else {
            warn!(tool_use_id = %result.tool_use_id, "跳过孤立的 tool_result：找不到对应 tool_use");
        }
    }

    // 还没配上结果的 tool_use 从历史剥掉
    if !unpaired.is_empty() {
        for msg in history.iter_mut() {
            if let HistoryMessage::Assistant(assistant) = msg {
                assistant
                    .tool_uses
                    .retain(|use_| !unpaired.contains(&use_.tool_use_id));
            }
        }
    }

    valid
}

/// 历史里出现过、但本轮未声明的工具补占位定义。
fn ensure_history_tools_present(current_tools: &mut Vec<CodeWhispererTool>, history: &[HistoryMessage]) {
    let mut known: std::collections::HashSet<String> = current_tools
        .iter()
        .map(|t| t.tool_specification.name.to_lowercase())
        .collect();

    for msg in history {
        let HistoryMessage::Assistant(assistant) = msg else {
            continue;
        };
        for tool_use in &assistant.tool_uses {
            if tool_use.name.is_empty() {
                continue;
            }
            let lower = tool_use.name.to_lowercase();
            if known.insert(lower) {
                current_tools.push(placeholder_tool(&tool_use.name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> AnthropicRequest {
        serde_json::from_value(value).unwrap()
    }

    fn basic_request() -> AnthropicRequest {
        request(json!({
            "model": "claude-sonnet-4-5-20250929",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        }))
    }

    #[test]
    fn builds_minimal_envelope() {
        let cw = build_codewhisperer_request(&basic_request(), "sess-1", None, 10_000).unwrap();
        assert_eq!(cw.conversation_state.chat_trigger_type, "MANUAL");
        assert_eq!(cw.conversation_state.agent_task_type, "vibe");
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            "hi"
        );
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.model_id,
            "claude-sonnet-4.5"
        );
        assert!(cw.conversation_state.history.is_empty());
        assert!(cw.inference_configuration.is_none());
    }

    #[test]
    fn conversation_id_is_stable_per_session() {
        let a = build_codewhisperer_request(&basic_request(), "sess-1", None, 10_000).unwrap();
        let b = build_codewhisperer_request(&basic_request(), "sess-1", None, 10_000).unwrap();
        let c = build_codewhisperer_request(&basic_request(), "sess-2", None, 10_000).unwrap();
        assert_eq!(
            a.conversation_state.conversation_id,
            b.conversation_state.conversation_id
        );
        assert_ne!(
            a.conversation_state.conversation_id,
            c.conversation_state.conversation_id
        );
        assert!(is_uuid_like(&a.conversation_state.conversation_id));
    }

    #[test]
    fn metadata_session_uuid_wins() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "metadata": {"user_id": "user_abc_session_550e8400-e29b-41d4-a716-446655440000"},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let cw = build_codewhisperer_request(&req, "other", None, 10_000).unwrap();
        assert_eq!(
            cw.conversation_state.conversation_id,
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn unknown_model_is_typed_error() {
        let req = request(json!({
            "model": "gpt-4o",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let err = build_codewhisperer_request(&req, "s", None, 10_000).unwrap_err();
        assert!(matches!(err, ApiError::ModelNotFound { .. }));
    }

    #[test]
    fn system_prompt_becomes_leading_history_pair() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "system": [{"type": "text", "text": "be brief"}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        assert_eq!(cw.conversation_state.history.len(), 2);
        match &cw.conversation_state.history[0] {
            HistoryMessage::User(u) => assert_eq!(u.content, "be brief"),
            _ => panic!("expected user first"),
        }
        match &cw.conversation_state.history[1] {
            HistoryMessage::Assistant(a) => assert_eq!(a.content, "OK"),
            _ => panic!("expected assistant second"),
        }
    }

    #[test]
    fn consecutive_user_messages_merge() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "user", "content": "two"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "three"}
            ]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        assert_eq!(cw.conversation_state.history.len(), 2);
        match &cw.conversation_state.history[0] {
            HistoryMessage::User(u) => assert_eq!(u.content, "one\ntwo"),
            _ => panic!(),
        }
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            "three"
        );
    }

    #[test]
    fn trailing_assistant_moves_to_history_with_continue() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "partial answer"}
            ]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            "Continue"
        );
        assert_eq!(cw.conversation_state.history.len(), 2);
    }

    #[test]
    fn tool_pairing_keeps_only_answered_uses() {
        // 对应场景：历史 assistant 有 t1，当前带 t1 + orphan 的结果
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": "check weather"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Let me check."},
                    {"type": "tool_use", "id": "t1", "name": "get_weather", "input": {"city": "SF"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "sunny"},
                    {"type": "tool_result", "tool_use_id": "orphan", "content": "lost"}
                ]}
            ]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        let context = cw
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .unwrap();
        assert_eq!(context.tool_results.len(), 1);
        assert_eq!(context.tool_results[0].tool_use_id, "t1");
    }

    #[test]
    fn unanswered_tool_use_stripped_from_history() {
        // t2 没有结果 → 从历史 assistant 中剥掉
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "a", "input": {}},
                    {"type": "tool_use", "id": "t2", "name": "b", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
                ]}
            ]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        let assistant = cw
            .conversation_state
            .history
            .iter()
            .find_map(|m| match m {
                HistoryMessage::Assistant(a) if !a.tool_uses.is_empty() => Some(a),
                _ => None,
            })
            .unwrap();
        assert_eq!(assistant.tool_uses.len(), 1);
        assert_eq!(assistant.tool_uses[0].tool_use_id, "t1");
    }

    #[test]
    fn history_tools_get_placeholder_definitions() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "legacy_tool", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
                ]}
            ]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        let context = cw
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .unwrap();
        assert_eq!(context.tools.len(), 1);
        assert_eq!(context.tools[0].tool_specification.name, "legacy_tool");
    }

    #[test]
    fn web_search_tools_filtered() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "tools": [
                {"name": "web_search", "description": "search", "input_schema": {}},
                {"name": "get_weather", "description": "w", "input_schema": {}}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        let context = cw
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .unwrap();
        assert_eq!(context.tools.len(), 1);
        assert_eq!(context.tools[0].tool_specification.name, "get_weather");
    }

    #[test]
    fn empty_content_with_tools_gets_space_placeholder() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "tools": [{"name": "t", "description": "d", "input_schema": {}}],
            "messages": [{"role": "user", "content": ""}]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            " "
        );
    }

    #[test]
    fn empty_content_without_tools_is_error() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": ""}]
        }));
        assert!(matches!(
            build_codewhisperer_request(&req, "s", None, 10_000),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn thinking_config_sets_inference_configuration() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        let inference = cw.inference_configuration.unwrap();
        assert_eq!(inference.thinking.as_ref().unwrap().budget_tokens, 2048);
        // max_tokens 不足时自动抬高
        assert_eq!(inference.max_tokens, 2048 + THINKING_OUTPUT_HEADROOM);

        // 系统消息注入 thinking 标签
        match &cw.conversation_state.history[0] {
            HistoryMessage::User(u) => assert!(u.content.contains("<thinking_mode>enabled</thinking_mode>")),
            _ => panic!(),
        }
    }

    #[test]
    fn thinking_rejects_forced_tool_choice() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 30000,
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "tool_choice": "any",
            "tools": [{"name": "t", "description": "", "input_schema": {}}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(matches!(
            build_codewhisperer_request(&req, "s", None, 10_000),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn tool_description_truncated_utf8_safe() {
        let long_desc = "中".repeat(200); // 600 字节
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "tools": [{"name": "t", "description": long_desc, "input_schema": {}}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 100).unwrap();
        let context = cw
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .unwrap();
        let desc = &context.tools[0].tool_specification.description;
        assert!(desc.len() <= 100);
        assert!(desc.ends_with("..."));
        assert!(std::str::from_utf8(desc.as_bytes()).is_ok());
    }

    #[test]
    fn images_converted_with_data_url_stripping() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image", "source": {
                    "type": "base64",
                    "media_type": "image/png",
                    "data": "data:image/jpeg;base64,QUJD"
                }}
            ]}]
        }));
        let cw = build_codewhisperer_request(&req, "s", None, 10_000).unwrap();
        let images = &cw.conversation_state.current_message.user_input_message.images;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].format, "jpeg"); // data URL 里的类型覆盖声明
        assert_eq!(images[0].source.bytes, "QUJD");
    }

    #[test]
    fn profile_arn_passthrough() {
        let cw =
            build_codewhisperer_request(&basic_request(), "s", Some("arn:aws:x"), 10_000).unwrap();
        assert_eq!(cw.profile_arn.as_deref(), Some("arn:aws:x"));
    }
}
