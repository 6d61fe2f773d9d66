// 会话级 Token 池
//
// 每个会话一个主账号加有限个备用账号：主账号提供粘性，备用账号在
// 429 failover 时顶上。池成员状态独立于全局池（available / cooldown /
// exhausted），全局池的门控（等级、每日上限）依旧生效。
//
// 池由全局凭据池分配成员；全局池不知道会话池的存在，依赖保持单向。

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fingerprint::Fingerprint;
use super::token_manager::TokenManager;
use super::types::TokenInfo;
use crate::config::Tuning;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PooledTokenStatus {
    Available,
    Cooldown,
    /// 池内终态，不再参与 failover
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct PooledToken {
    pub token_key: String,
    pub token: TokenInfo,
    pub fingerprint: Fingerprint,
    pub status: PooledTokenStatus,
    pub cooldown_until: Option<Instant>,
    pub last_used_at: Instant,
    pub fail_count: u32,
    pub success_count: u32,
}

impl PooledToken {
    fn new(token_key: String, token: TokenInfo, fingerprint: Fingerprint) -> Self {
        Self {
            token_key,
            token,
            fingerprint,
            status: PooledTokenStatus::Available,
            cooldown_until: None,
            last_used_at: Instant::now(),
            fail_count: 0,
            success_count: 0,
        }
    }

    /// 冷却期结束自动回到可用态。
    fn effective_status(&self) -> PooledTokenStatus {
        match self.status {
            PooledTokenStatus::Cooldown => {
                let awake = self
                    .cooldown_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if awake {
                    PooledTokenStatus::Available
                } else {
                    PooledTokenStatus::Cooldown
                }
            }
            other => other,
        }
    }
}

struct SessionPool {
    session_id: String,
    primary: Option<PooledToken>,
    backups: Vec<PooledToken>,
    #[allow(dead_code)]
    created_at: Instant,
    last_accessed_at: Instant,
    total_requests: u64,
}

pub struct SessionPoolManager {
    pools: DashMap<String, Arc<Mutex<SessionPool>>>,
    token_manager: Arc<TokenManager>,
    ttl: Duration,
    max_pool_size: usize,
    default_cooldown: Duration,
    cancel: CancellationToken,
}

impl SessionPoolManager {
    pub fn new(
        token_manager: Arc<TokenManager>,
        tuning: &Tuning,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        info!(
            max_pool_size = tuning.session_pool_max_size,
            ttl_secs = tuning.session_pool_ttl.as_secs(),
            "会话级 Token 池管理器已初始化"
        );
        Arc::new(Self {
            pools: DashMap::new(),
            token_manager,
            ttl: tuning.session_pool_ttl,
            max_pool_size: tuning.session_pool_max_size.max(1),
            default_cooldown: tuning.session_pool_cooldown,
            cancel,
        })
    }

    async fn get_or_create_pool(
        &self,
        session_id: &str,
        requested_model: &str,
    ) -> Result<Arc<Mutex<SessionPool>>, ApiError> {
        let existing = self.pools.get(session_id).map(|p| Arc::clone(p.value()));
        if let Some(pool) = existing {
            pool.lock().await.last_accessed_at = Instant::now();
            return Ok(pool);
        }

        // 先从全局池分配主账号，成功才落池
        let (token, fingerprint, token_key) = self
            .token_manager
            .acquire_for_session_and_model(session_id, requested_model)
            .await?;

        let pool = Arc::new(Mutex::new(SessionPool {
            session_id: session_id.to_string(),
            primary: Some(PooledToken::new(token_key.clone(), token, fingerprint)),
            backups: Vec::new(),
            created_at: Instant::now(),
            last_accessed_at: Instant::now(),
            total_requests: 0,
        }));
        // 并发创建时保留先到者
        let entry = self
            .pools
            .entry(session_id.to_string())
            .or_insert_with(|| pool.clone())
            .value()
            .clone();
        debug!(session_id, primary_token = %token_key, "创建新会话池");
        Ok(entry)
    }

    /// 获取会话内可用于该模型的 token（主账号优先）。
    pub async fn get_available_token_for_model(
        &self,
        session_id: &str,
        requested_model: &str,
    ) -> Result<(TokenInfo, Fingerprint, String), ApiError> {
        self.next_token_inner(session_id, requested_model, None).await
    }

    /// 429 重试路径：排除当前失败的 token，找下一个。
    pub async fn get_next_available_token_for_model(
        &self,
        session_id: &str,
        current_token_key: &str,
        requested_model: &str,
    ) -> Result<(TokenInfo, Fingerprint, String), ApiError> {
        self.next_token_inner(session_id, requested_model, Some(current_token_key))
            .await
    }

    async fn next_token_inner(
        &self,
        session_id: &str,
        requested_model: &str,
        exclude_key: Option<&str>,
    ) -> Result<(TokenInfo, Fingerprint, String), ApiError> {
        let pool = self.get_or_create_pool(session_id, requested_model).await?;

        // 候选键在池锁内收集，模型门控/禁用检查在锁外做（需要全局池的锁）
        let candidates: Vec<(TokenInfo, Fingerprint, String)> = {
            let mut guard = pool.lock().await;
            guard.total_requests += 1;
            guard.last_accessed_at = Instant::now();

            let mut list = Vec::new();
            if let Some(primary) = &guard.primary {
                list.push(primary.clone());
            }
            list.extend(guard.backups.iter().cloned());
            list.into_iter()
                .filter(|t| Some(t.token_key.as_str()) != exclude_key)
                .filter(|t| t.effective_status() == PooledTokenStatus::Available)
                .filter(|t| !t.token.is_expired())
                .map(|t| (t.token, t.fingerprint, t.token_key))
                .collect()
        };

        for (token, fingerprint, token_key) in candidates {
            if !self
                .token_manager
                .is_token_allowed_for_model(&token_key, requested_model)
                .await
            {
                continue;
            }
            if self.token_manager.is_token_disabled(&token_key).await {
                continue;
            }
            let mut guard = pool.lock().await;
            touch_member(&mut guard, &token_key);
            return Ok((token, fingerprint, token_key));
        }

        // 没有现成成员可用 → 尝试分配备用
        self.try_allocate_backup_for_model(session_id, requested_model)
            .await
    }

    /// 为会话分配新的备用 token。
    pub async fn try_allocate_backup_for_model(
        &self,
        session_id: &str,
        requested_model: &str,
    ) -> Result<(TokenInfo, Fingerprint, String), ApiError> {
        let pool = self
            .pools
            .get(session_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| ApiError::Api("会话池不存在".into()))?;

        {
            let guard = pool.lock().await;
            let current_size = guard.primary.is_some() as usize + guard.backups.len();
            if current_size >= self.max_pool_size {
                return Err(ApiError::NoAvailableToken);
            }
        }

        // 用独立的会话键申请，避免复用主账号的绑定
        let backup_session = format!("{}_backup", session_id);
        let (token, fingerprint, token_key) = self
            .token_manager
            .acquire_for_session_and_model(&backup_session, requested_model)
            .await?;

        let mut guard = pool.lock().await;
        let duplicate = guard
            .primary
            .as_ref()
            .map(|p| p.token_key == token_key)
            .unwrap_or(false)
            || guard.backups.iter().any(|b| b.token_key == token_key);
        if duplicate {
            return Err(ApiError::NoAvailableToken);
        }

        guard
            .backups
            .push(PooledToken::new(token_key.clone(), token.clone(), fingerprint.clone()));
        info!(
            session_id,
            token_key = %token_key,
            pool_size = guard.primary.is_some() as usize + guard.backups.len(),
            "分配备用 token"
        );
        Ok((token, fingerprint, token_key))
    }

    /// 标记池成员进入冷却；`duration` 为零时用默认冷却时长。
    pub async fn mark_token_cooldown(&self, session_id: &str, token_key: &str, duration: Duration) {
        let Some(pool) = self.pools.get(session_id).map(|p| Arc::clone(p.value())) else {
            return;
        };
        let duration = if duration.is_zero() {
            self.default_cooldown
        } else {
            duration
        };
        let until = Instant::now() + duration;

        let mut guard = pool.lock().await;
        let session_id = guard.session_id.clone();
        if let Some(member) = find_member(&mut guard, token_key) {
            member.status = PooledTokenStatus::Cooldown;
            member.cooldown_until = Some(until);
            member.fail_count += 1;
            info!(
                session_id = %session_id,
                token_key,
                cooldown_secs = duration.as_secs(),
                "池内 token 进入冷却"
            );
        }
    }

    /// 标记池成员耗尽（月度配额类失败，池内终态）。
    pub async fn mark_token_exhausted(&self, session_id: &str, token_key: &str) {
        let Some(pool) = self.pools.get(session_id).map(|p| Arc::clone(p.value())) else {
            return;
        };
        let mut guard = pool.lock().await;
        if let Some(member) = find_member(&mut guard, token_key) {
            member.status = PooledTokenStatus::Exhausted;
            member.fail_count += 1;
            warn!(token_key, "池内 token 已耗尽");
        }
    }

    pub async fn mark_token_success(&self, session_id: &str, token_key: &str) {
        let Some(pool) = self.pools.get(session_id).map(|p| Arc::clone(p.value())) else {
            return;
        };
        let mut guard = pool.lock().await;
        if let Some(member) = find_member(&mut guard, token_key) {
            member.success_count += 1;
            member.fail_count = 0;
        }
    }

    pub fn unbind_session(&self, session_id: &str) {
        if self.pools.remove(session_id).is_some() {
            debug!(session_id, "会话池已解绑");
        }
    }

    /// 会话池统计（监控接口用）。
    pub async fn pool_stats(&self, session_id: &str) -> Option<Value> {
        let pool = self.pools.get(session_id)?.clone();
        let guard = pool.lock().await;
        Some(serde_json::json!({
            "session_id": guard.session_id,
            "total_requests": guard.total_requests,
            "primary_token": guard.primary.as_ref().map(|p| p.token_key.clone()),
            "backup_count": guard.backups.len(),
            "max_pool_size": self.max_pool_size,
        }))
    }

    pub async fn cleanup_expired(&self) -> usize {
        let snapshot: Vec<(String, Arc<Mutex<SessionPool>>)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut expired_keys = Vec::new();
        for (key, pool) in snapshot {
            let guard = pool.lock().await;
            if guard.last_accessed_at.elapsed() > self.ttl {
                expired_keys.push(key);
            }
        }
        for key in &expired_keys {
            self.pools.remove(key);
        }
        expired_keys.len()
    }

    /// 周期清理过期会话池，每 TTL/2 一轮。
    pub fn spawn_janitor(self: &Arc<Self>) {
        let manager = self.clone();
        let cancel = self.cancel.child_token();
        let interval = (self.ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = manager.cleanup_expired().await;
                        if expired > 0 {
                            info!(
                                expired_count = expired,
                                remaining_count = manager.pools.len(),
                                "会话池清理完成"
                            );
                        }
                    }
                }
            }
        });
    }
}

fn find_member<'a>(pool: &'a mut SessionPool, token_key: &str) -> Option<&'a mut PooledToken> {
    if let Some(primary) = pool.primary.as_mut() {
        if primary.token_key == token_key {
            return Some(primary);
        }
    }
    pool.backups.iter_mut().find(|b| b.token_key == token_key)
}

fn touch_member(pool: &mut SessionPool, token_key: &str) {
    if let Some(member) = find_member(pool, token_key) {
        member.last_used_at = Instant::now();
        // 冷却期已过的成员顺手唤醒
        if member.effective_status() == PooledTokenStatus::Available {
            member.status = PooledTokenStatus::Available;
            member.cooldown_until = None;
        }
    }
}

/// 从 429/402 响应体解析冷却时长。
///
/// `quota_reset_timestamp`（unix 秒）距现在的时长，夹在 (0, 24h) 内有效，
/// 否则用默认值。
pub fn calculate_cooldown_duration(body: &[u8], default: Duration) -> Duration {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return default;
    };
    let Some(reset_ts) = value.get("quota_reset_timestamp").and_then(|v| v.as_i64()) else {
        return default;
    };
    if reset_ts <= 0 {
        return default;
    }
    let now = chrono::Utc::now().timestamp();
    let delta = reset_ts - now;
    if delta > 0 && delta < 24 * 3600 {
        Duration::from_secs(delta as u64)
    } else {
        default
    }
}
