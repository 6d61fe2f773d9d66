// OAuth token 存储
//
// 授权流程（外部协作者）落盘的 JSON 文件；这里只读写条目并把它们
// 转成池可用的 AuthConfig。

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::{AuthConfig, AuthKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenEntry {
    pub id: String,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub auth_method: String, // "social" | "enterprise"
    #[serde(default)]
    pub provider: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OAuthTokenData {
    #[serde(default)]
    tokens: Vec<OAuthTokenEntry>,
}

pub struct OAuthTokenStore {
    inner: Mutex<OAuthTokenData>,
    file_path: Option<PathBuf>,
}

impl OAuthTokenStore {
    pub fn load(file_path: Option<PathBuf>) -> Self {
        let data = match &file_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<OAuthTokenData>(&content) {
                    Ok(data) => {
                        info!(count = data.tokens.len(), "加载 OAuth token 存储成功");
                        data
                    }
                    Err(e) => {
                        warn!(error = %e, "OAuth token 存储解析失败，使用空存储");
                        OAuthTokenData::default()
                    }
                },
                Err(_) => OAuthTokenData::default(),
            },
            None => OAuthTokenData::default(),
        };
        Self {
            inner: Mutex::new(data),
            file_path,
        }
    }

    pub fn in_memory() -> Self {
        Self::load(None)
    }

    pub fn add_token(&self, entry: OAuthTokenEntry) -> Result<(), String> {
        let mut data = self.inner.lock().unwrap();
        if let Some(existing) = data.tokens.iter_mut().find(|t| t.id == entry.id) {
            *existing = entry;
        } else {
            data.tokens.push(entry);
        }
        self.save_locked(&data)
    }

    pub fn remove_token(&self, id: &str) -> Result<(), String> {
        let mut data = self.inner.lock().unwrap();
        data.tokens.retain(|t| t.id != id);
        self.save_locked(&data)
    }

    pub fn token_count(&self) -> usize {
        self.inner.lock().unwrap().tokens.len()
    }

    /// 有效条目 → 池配置。禁用和缺 refresh_token 的条目跳过。
    pub fn to_auth_configs(&self) -> Vec<AuthConfig> {
        let data = self.inner.lock().unwrap();
        data.tokens
            .iter()
            .filter(|t| !t.disabled && !t.refresh_token.trim().is_empty())
            .map(|t| AuthConfig {
                auth_kind: if t.auth_method.eq_ignore_ascii_case("enterprise") {
                    AuthKind::Enterprise
                } else {
                    AuthKind::Social
                },
                refresh_token: t.refresh_token.clone(),
                client_id: t.client_id.clone(),
                client_secret: t.client_secret.clone(),
                region: t.region.clone(),
                disabled: false,
                oauth_id: Some(t.id.clone()),
            })
            .collect()
    }

    fn save_locked(&self, data: &OAuthTokenData) -> Result<(), String> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| format!("序列化 OAuth 存储失败: {}", e))?;
        std::fs::write(path, content).map_err(|e| format!("写入 OAuth 存储失败: {}", e))
    }
}
