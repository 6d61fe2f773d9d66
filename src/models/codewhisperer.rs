// CodeWhisperer (Kiro) 上游 envelope 数据模型
//
// 字段名与上游 JSON 保持 camelCase；空集合一律跳过序列化，
// 上游对空数组字段（如 history）返回 400。

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeWhispererRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_configuration: Option<InferenceConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    pub agent_continuation_id: String,
    pub agent_task_type: String, // "vibe"
    pub chat_trigger_type: String, // always "MANUAL"
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub history: Vec<HistoryMessage>,
    pub current_message: CurrentMessage,
}

/// 历史消息：user / assistant 两种包装
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryMessage {
    #[serde(rename = "userInputMessage")]
    User(UserInputMessage),
    #[serde(rename = "assistantResponseMessage")]
    Assistant(AssistantResponseMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub images: Vec<CodeWhispererImage>,
    pub model_id: String,
    pub origin: String, // "AI_EDITOR"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<CodeWhispererTool>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_results: Vec<ToolResultEntry>,
}

impl UserInputMessageContext {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.tool_results.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_uses: Vec<ToolUseEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEntry {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEntry {
    pub tool_use_id: String,
    pub content: Vec<Value>, // [{"text": ...}]
    pub status: String, // "success" | "error"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeWhispererImage {
    pub format: String, // "png" | "jpeg" | ...
    pub source: ImageBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBytes {
    pub bytes: String, // base64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeWhispererTool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<CodeWhispererThinking>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeWhispererThinking {
    #[serde(rename = "type")]
    pub type_: String, // "enabled"
    pub budget_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serializes_camel_case() {
        let req = CodeWhispererRequest {
            profile_arn: None,
            conversation_state: ConversationState {
                conversation_id: "c1".into(),
                agent_continuation_id: "a1".into(),
                agent_task_type: "vibe".into(),
                chat_trigger_type: "MANUAL".into(),
                history: vec![],
                current_message: CurrentMessage {
                    user_input_message: UserInputMessage {
                        content: "hi".into(),
                        model_id: "claude-sonnet-4.5".into(),
                        origin: "AI_EDITOR".into(),
                        ..Default::default()
                    },
                },
            },
            inference_configuration: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["conversationState"]["chatTriggerType"], "MANUAL");
        assert_eq!(
            v["conversationState"]["currentMessage"]["userInputMessage"]["modelId"],
            "claude-sonnet-4.5"
        );
        // empty history / images are omitted entirely
        assert!(v["conversationState"].get("history").is_none());
        assert!(v["conversationState"]["currentMessage"]["userInputMessage"]
            .get("images")
            .is_none());
        assert!(v.get("profileArn").is_none());
    }

    #[test]
    fn history_messages_use_wrapper_keys() {
        let user = HistoryMessage::User(UserInputMessage {
            content: "q".into(),
            model_id: "m".into(),
            origin: "AI_EDITOR".into(),
            ..Default::default()
        });
        let v = serde_json::to_value(&user).unwrap();
        assert!(v.get("userInputMessage").is_some());

        let assistant = HistoryMessage::Assistant(AssistantResponseMessage {
            content: "a".into(),
            tool_uses: vec![ToolUseEntry {
                tool_use_id: "t1".into(),
                name: "get_weather".into(),
                input: json!({"city": "SF"}),
            }],
        });
        let v = serde_json::to_value(&assistant).unwrap();
        assert_eq!(v["assistantResponseMessage"]["toolUses"][0]["toolUseId"], "t1");
    }

    #[test]
    fn tool_result_entry_shape() {
        let entry = ToolResultEntry {
            tool_use_id: "t1".into(),
            content: vec![json!({"text": "42"})],
            status: "success".into(),
            is_error: None,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["toolUseId"], "t1");
        assert_eq!(v["status"], "success");
        assert!(v.get("isError").is_none());
    }
}
