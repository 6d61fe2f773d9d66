// Anthropic Messages 协议数据模型

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config;

/// thinking 预算上限（超出自动截断）
pub const THINKING_BUDGET_MAX: u32 = 51_200;
/// thinking 预算下限
pub const THINKING_BUDGET_MIN: u32 = 1_024;
/// `-thinking` 模型别名的默认预算
pub const THINKING_BUDGET_DEFAULT: u32 = 20_000;

/// Anthropic `/v1/messages` 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_config: Option<OutputConfig>,
}

impl AnthropicRequest {
    /// `-thinking` 模型别名自动开启思考模式。
    ///
    /// Opus 4.6 走 adaptive + effort=high，其余模型 enabled + 默认预算。
    pub fn apply_thinking_alias(&mut self) {
        if !config::has_thinking_suffix(&self.model) || self.thinking.is_some() {
            return;
        }
        let normalized = config::normalize_model_name(&self.model);
        if normalized.contains("opus") && (normalized.contains("4-6") || normalized.contains("4.6")) {
            self.thinking = Some(ThinkingConfig {
                type_: "adaptive".to_string(),
                budget_tokens: None,
            });
            let cfg = self.output_config.get_or_insert(OutputConfig { effort: None });
            if cfg.effort.is_none() {
                cfg.effort = Some("high".to_string());
            }
        } else {
            self.thinking = Some(ThinkingConfig {
                type_: "enabled".to_string(),
                budget_tokens: Some(THINKING_BUDGET_DEFAULT),
            });
        }
    }

    pub fn thinking_enabled(&self) -> bool {
        self.thinking
            .as_ref()
            .map(|t| t.type_ == "enabled" || t.type_ == "adaptive")
            .unwrap_or(false)
    }
}

/// thinking 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub type_: String, // "enabled" | "adaptive"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

impl ThinkingConfig {
    /// 截断到合法区间，未指定时取默认值。
    pub fn normalize_budget_tokens(&self) -> u32 {
        self.budget_tokens
            .unwrap_or(THINKING_BUDGET_DEFAULT)
            .clamp(THINKING_BUDGET_MIN, THINKING_BUDGET_MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// 拼接全部文本段。
    pub fn joined_text(&self) -> String {
        match self {
            SystemPrompt::String(s) => s.clone(),
            SystemPrompt::Array(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

/// Anthropic 内容块
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    #[serde(rename = "image")]
    Image {
        source: ImageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String, // "base64"
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl Tool {
    /// web_search 不被上游支持，构造 envelope 时过滤。
    pub fn is_web_search(&self) -> bool {
        self.name == "web_search" || self.name == "websearch"
    }
}

/// tool_choice: "auto" | "any" | "none" | {type:"tool", name}
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Typed {
        #[serde(rename = "type")]
        type_: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ToolChoice {
    pub fn mode(&self) -> &str {
        match self {
            ToolChoice::Mode(m) => m,
            ToolChoice::Typed { type_, .. } => type_,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
