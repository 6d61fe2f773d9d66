// 凭据与 access token 基础类型

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// 社交登录（桌面端 refreshToken 接口）
    Social,
    /// 企业 SSO（AWS IdC / OIDC refresh_token grant）
    Enterprise,
}

impl Default for AuthKind {
    fn default() -> Self {
        Self::Social
    }
}

/// 单个上游凭据的静态配置。
///
/// 池内身份是它在有序配置表中的下标；稳定绑定键见 [`AuthConfig::binding_key`]。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub auth_kind: AuthKind,
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub disabled: bool,
    /// OAuth 存储里的条目 id（来自 oauth_store 的凭据才有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_id: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl AuthConfig {
    /// 稳定绑定键：`oauth:<id>` 或 `refresh:<sha256(refresh_token)>`。
    /// 用于机器码与指纹查找。
    pub fn binding_key(&self) -> String {
        if let Some(id) = &self.oauth_id {
            if !id.is_empty() {
                return format!("oauth:{}", id);
            }
        }
        if !self.refresh_token.is_empty() {
            let mut hasher = Sha256::new();
            hasher.update(self.refresh_token.as_bytes());
            return format!("refresh:{}", hex::encode(hasher.finalize()));
        }
        String::new()
    }
}

/// 刷新得到的短期访问令牌。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

impl TokenInfo {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// 距过期不足 `threshold_secs` 秒时应提前刷新。
    pub fn needs_refresh(&self, threshold_secs: i64) -> bool {
        Utc::now() + ChronoDuration::seconds(threshold_secs) >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_refresh(token: &str) -> AuthConfig {
        AuthConfig {
            auth_kind: AuthKind::Social,
            refresh_token: token.into(),
            client_id: None,
            client_secret: None,
            region: "us-east-1".into(),
            disabled: false,
            oauth_id: None,
        }
    }

    #[test]
    fn binding_key_prefers_oauth_id() {
        let mut cfg = config_with_refresh("rt-1");
        cfg.oauth_id = Some("abc".into());
        assert_eq!(cfg.binding_key(), "oauth:abc");
    }

    #[test]
    fn binding_key_hashes_refresh_token() {
        let cfg = config_with_refresh("rt-1");
        let key = cfg.binding_key();
        assert!(key.starts_with("refresh:"));
        assert_eq!(key.len(), "refresh:".len() + 64);
        // 稳定性
        assert_eq!(key, config_with_refresh("rt-1").binding_key());
        assert_ne!(key, config_with_refresh("rt-2").binding_key());
    }

    #[test]
    fn binding_key_empty_when_nothing_set() {
        let cfg = config_with_refresh("");
        assert_eq!(cfg.binding_key(), "");
    }

    #[test]
    fn token_expiry_checks() {
        let live = TokenInfo {
            access_token: "a".into(),
            expires_at: Utc::now() + ChronoDuration::seconds(3600),
            profile_arn: None,
        };
        assert!(!live.is_expired());
        assert!(!live.needs_refresh(300));
        assert!(live.needs_refresh(7200));

        let dead = TokenInfo {
            access_token: "a".into(),
            expires_at: Utc::now() - ChronoDuration::seconds(1),
            profile_arn: None,
        };
        assert!(dead.is_expired());
    }

    #[test]
    fn auth_kind_deserializes_lowercase() {
        let cfg: AuthConfig = serde_json::from_str(
            r#"{"auth_kind": "enterprise", "refresh_token": "rt", "region": "eu-west-1"}"#,
        )
        .unwrap();
        assert_eq!(cfg.auth_kind, AuthKind::Enterprise);
        assert_eq!(cfg.region, "eu-west-1");
        assert!(!cfg.disabled);
    }
}
