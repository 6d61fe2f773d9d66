// 会话绑定：session_id -> (token_key, token, fingerprint)
//
// 只保存亲和关系，带 TTL；不保存任何会话内容。

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::fingerprint::Fingerprint;
use super::types::TokenInfo;

#[derive(Debug, Clone)]
struct SessionBinding {
    token_key: String,
    token: TokenInfo,
    fingerprint: Fingerprint,
    bound_at: Instant,
}

pub struct SessionBindingManager {
    bindings: DashMap<String, SessionBinding>,
    ttl: Duration,
}

impl SessionBindingManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
        }
    }

    pub fn bind(&self, session_id: &str, token_key: &str, token: TokenInfo, fingerprint: Fingerprint) {
        if session_id.is_empty() {
            return;
        }
        self.bindings.insert(
            session_id.to_string(),
            SessionBinding {
                token_key: token_key.to_string(),
                token,
                fingerprint,
                bound_at: Instant::now(),
            },
        );
        debug!(session_id, token_key, "会话已绑定 token");
    }

    /// 取会话绑定；过期条目当场移除。
    pub fn get(&self, session_id: &str) -> Option<(TokenInfo, Fingerprint, String)> {
        let expired = {
            let binding = self.bindings.get(session_id)?;
            binding.bound_at.elapsed() > self.ttl
        };
        if expired {
            self.bindings.remove(session_id);
            return None;
        }
        let binding = self.bindings.get(session_id)?;
        Some((
            binding.token.clone(),
            binding.fingerprint.clone(),
            binding.token_key.clone(),
        ))
    }

    pub fn unbind(&self, session_id: &str) {
        if self.bindings.remove(session_id).is_some() {
            debug!(session_id, "会话绑定已解除");
        }
    }

    /// 解除所有指向该 token 的绑定（凭据下线时调用）。
    pub fn unbind_token(&self, token_key: &str) {
        self.bindings.retain(|_, b| b.token_key != token_key);
    }

    pub fn cleanup_expired(&self) -> usize {
        let before = self.bindings.len();
        let ttl = self.ttl;
        self.bindings.retain(|_, b| b.bound_at.elapsed() <= ttl);
        before - self.bindings.len()
    }

    /// 周期清理任务，每 TTL/2 跑一轮。
    pub fn spawn_janitor(self: &std::sync::Arc<Self>, cancel: CancellationToken) {
        let manager = self.clone();
        let interval = (self.ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cleaned = manager.cleanup_expired();
                        if cleaned > 0 {
                            info!(cleaned, "会话绑定清理完成");
                        }
                    }
                }
            }
        });
    }
}

/// 从请求头提取会话 id：`X-Session-ID` 优先，退回 `X-Request-ID`，
/// 都没有时按请求生成（匿名请求之间不共享亲和）。
pub fn extract_session_id(session_header: Option<&str>, request_header: Option<&str>) -> String {
    for candidate in [session_header, request_header] {
        if let Some(value) = candidate {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    format!("req-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn token() -> TokenInfo {
        TokenInfo {
            access_token: "at".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            profile_arn: None,
        }
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            os_type: "darwin".into(),
            os_version: "24.6.0".into(),
            locale: "en-US,en;q=0.9".into(),
            sdk_version: "0.9.2".into(),
            machine_id: "m".repeat(64),
        }
    }

    #[test]
    fn bind_and_get() {
        let m = SessionBindingManager::new(Duration::from_secs(60));
        m.bind("s1", "token_0", token(), fingerprint());
        let (_, _, key) = m.get("s1").unwrap();
        assert_eq!(key, "token_0");
        assert!(m.get("s2").is_none());
    }

    #[test]
    fn expired_binding_is_dropped_on_get() {
        let m = SessionBindingManager::new(Duration::from_millis(0));
        m.bind("s1", "token_0", token(), fingerprint());
        std::thread::sleep(Duration::from_millis(5));
        assert!(m.get("s1").is_none());
        assert_eq!(m.bindings.len(), 0);
    }

    #[test]
    fn unbind_token_clears_all_sessions() {
        let m = SessionBindingManager::new(Duration::from_secs(60));
        m.bind("s1", "token_0", token(), fingerprint());
        m.bind("s2", "token_0", token(), fingerprint());
        m.bind("s3", "token_1", token(), fingerprint());
        m.unbind_token("token_0");
        assert!(m.get("s1").is_none());
        assert!(m.get("s2").is_none());
        assert!(m.get("s3").is_some());
    }

    #[test]
    fn cleanup_counts_removed() {
        let m = SessionBindingManager::new(Duration::from_millis(0));
        m.bind("s1", "k", token(), fingerprint());
        m.bind("s2", "k", token(), fingerprint());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(m.cleanup_expired(), 2);
    }

    #[test]
    fn session_id_extraction_priority() {
        assert_eq!(
            extract_session_id(Some("sess-1"), Some("req-9")),
            "sess-1".to_string()
        );
        assert_eq!(
            extract_session_id(None, Some("req-9")),
            "req-9".to_string()
        );
        assert_eq!(extract_session_id(Some("  "), None).len(), "req-".len() + 36);

        // 匿名请求各自独立
        let a = extract_session_id(None, None);
        let b = extract_session_id(None, None);
        assert_ne!(a, b);
    }
}
