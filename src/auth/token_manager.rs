// 凭据池
//
// 有序凭据表上的严格轮询选择，叠加模型门控、冷却、每日上限与
// TTL 缓存。锁只保护内存状态；网络操作（刷新、配额探测、限流等待）
// 一律在锁外执行，之后短暂重新上锁提交。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fingerprint::{Fingerprint, FingerprintManager};
use super::machine_id::MachineIdStore;
use super::model_access::{self, AccountLevel};
use super::rate_limit::RateLimiter;
use super::refresh;
use super::session_binding::SessionBindingManager;
use super::types::{AuthConfig, TokenInfo};
use super::usage;
use crate::config::Tuning;
use crate::error::ApiError;
use crate::models::usage::UsageLimits;

/// 缓存的可用凭据。
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: TokenInfo,
    pub usage: Option<UsageLimits>,
    pub account_level: AccountLevel,
    pub cached_at: Instant,
    pub last_used: Option<Instant>,
    /// 预约计数：发放一次减一
    pub available: f64,
}

impl CachedToken {
    pub fn is_usable(&self) -> bool {
        !self.token.is_expired() && self.available > 0.0
    }
}

struct PoolState {
    configs: Vec<AuthConfig>,
    cache: HashMap<String, CachedToken>,
    cursor: usize,
    last_refresh: Option<Instant>,
}

/// 一次选择的结果，锁外使用。
struct SelectionPlan {
    token_key: String,
    token: TokenInfo,
    binding_key: String,
}

pub struct TokenManager {
    state: Mutex<PoolState>,
    rate_limiter: Arc<RateLimiter>,
    fingerprints: Arc<FingerprintManager>,
    session_bindings: Arc<SessionBindingManager>,
    machine_ids: Arc<MachineIdStore>,
    tuning: Tuning,
    cancel: CancellationToken,
}

pub fn token_key_for_index(index: usize) -> String {
    format!("token_{}", index)
}

fn index_from_token_key(key: &str) -> Option<usize> {
    key.strip_prefix("token_")?.parse().ok()
}

impl TokenManager {
    pub fn new(
        configs: Vec<AuthConfig>,
        rate_limiter: Arc<RateLimiter>,
        fingerprints: Arc<FingerprintManager>,
        session_bindings: Arc<SessionBindingManager>,
        machine_ids: Arc<MachineIdStore>,
        tuning: Tuning,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        info!(config_count = configs.len(), "凭据池初始化（严格轮询策略）");
        Arc::new(Self {
            state: Mutex::new(PoolState {
                configs,
                cache: HashMap::new(),
                cursor: 0,
                last_refresh: None,
            }),
            rate_limiter,
            fingerprints,
            session_bindings,
            machine_ids,
            tuning,
            cancel,
        })
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// 为会话获取指定模型可用的 (token, fingerprint, token_key)。
    ///
    /// 已有会话绑定且仍有效（未过期、满足模型门控）时直接复用；
    /// 否则轮询分配新凭据并重新绑定。
    pub async fn acquire_for_session_and_model(
        &self,
        session_id: &str,
        requested_model: &str,
    ) -> Result<(TokenInfo, Fingerprint, String), ApiError> {
        if let Some((token, fingerprint, token_key)) = self.session_bindings.get(session_id) {
            let model_allowed = self
                .is_token_allowed_for_model(&token_key, requested_model)
                .await;
            if !token.is_expired() && model_allowed && !self.is_token_disabled(&token_key).await {
                debug!(session_id, token_key, "复用会话绑定的 token");
                return Ok((token, fingerprint, token_key));
            }
            self.session_bindings.unbind(session_id);
            debug!(session_id, model_allowed, "会话绑定的 token 不可用，重新分配");
        }

        self.refresh_cache_if_stale().await;

        // 阶段一：锁内选择候选
        let plan = {
            let mut state = self.state.lock().await;
            match self.select_next_available_locked(&mut state, requested_model) {
                (Some(plan), _) => plan,
                (None, model_supported) => {
                    if !requested_model.trim().is_empty() && !model_supported {
                        return Err(ApiError::ModelNotFound {
                            model: requested_model.to_string(),
                            request_id: format!("model-gate-{}", uuid::Uuid::new_v4()),
                        });
                    }
                    return Err(ApiError::NoAvailableToken);
                }
            }
        };

        // 阶段二：锁外限流等待与轮换判定
        self.rate_limiter.wait_for_token(&plan.token_key).await;
        self.rate_limiter.record_request(&plan.token_key).await;
        if self.rate_limiter.should_rotate(&plan.token_key) {
            self.rate_limiter.reset_consecutive(&plan.token_key);
            let mut state = self.state.lock().await;
            advance_cursor(&mut state);
            info!(
                from_token = %plan.token_key,
                next_index = state.cursor,
                "连续使用达上限，轮询切换"
            );
        }

        let fingerprint = self.fingerprints.fingerprint_for_binding_key(&plan.binding_key);

        // 阶段三：重新上锁提交预约
        {
            let mut state = self.state.lock().await;
            if let Some(cached) = state.cache.get_mut(&plan.token_key) {
                cached.last_used = Some(Instant::now());
                if cached.available > 0.0 {
                    cached.available -= 1.0;
                }
            }
        }

        self.session_bindings
            .bind(session_id, &plan.token_key, plan.token.clone(), fingerprint.clone());
        debug!(session_id, token_key = %plan.token_key, "为会话分配新 token");

        Ok((plan.token, fingerprint, plan.token_key))
    }

    /// 锁内严格轮询。返回 (候选, 是否存在支持该模型的凭据)。
    fn select_next_available_locked(
        &self,
        state: &mut PoolState,
        requested_model: &str,
    ) -> (Option<SelectionPlan>, bool) {
        let requested_model = requested_model.trim();
        let total = state.configs.len();
        if total == 0 {
            return (None, requested_model.is_empty());
        }

        let mut model_supported = requested_model.is_empty();
        let mut tried = 0;

        while tried < total {
            let index = state.cursor;
            let key = token_key_for_index(index);
            let config_disabled = state.configs[index].disabled;

            let verdict = state.cache.get(&key).map(|cached| {
                let fresh = cached.cached_at.elapsed() <= self.tuning.token_cache_ttl;
                let model_ok = model_access::is_model_allowed_for_level(
                    cached.account_level,
                    requested_model,
                    self.tuning.model_access_control_enabled,
                    self.tuning.model_access_unknown_allowed,
                );
                (fresh, model_ok, cached.is_usable())
            });

            match verdict {
                Some((true, model_ok, usable)) if !config_disabled => {
                    if model_ok {
                        model_supported = true;
                        if !self.rate_limiter.is_cooldown(&key)
                            && !self.rate_limiter.is_daily_limit_exceeded(&key)
                            && usable
                        {
                            let cached = state.cache.get(&key).unwrap();
                            let binding_key = self.binding_key_locked(state, index, cached);
                            debug!(
                                selected_key = %key,
                                available = cached.available,
                                cursor = state.cursor,
                                "轮询选中 token"
                            );
                            return (
                                Some(SelectionPlan {
                                    token_key: key,
                                    token: cached.token.clone(),
                                    binding_key,
                                }),
                                true,
                            );
                        }
                    } else {
                        debug!(token_key = %key, requested_model, "账号等级不支持该模型，跳过");
                    }
                }
                _ => {}
            }

            advance_cursor(state);
            tried += 1;
        }

        warn!(total_count = total, "轮询一圈后没有可用 token");
        (None, model_supported)
    }

    fn binding_key_locked(&self, state: &PoolState, index: usize, cached: &CachedToken) -> String {
        let from_config = state
            .configs
            .get(index)
            .map(|c| c.binding_key())
            .unwrap_or_default();
        if !from_config.is_empty() {
            return from_config;
        }
        // 配置没有稳定标识时退回到账号邮箱
        cached
            .usage
            .as_ref()
            .map(|u| u.user_info.email.trim().to_string())
            .filter(|e| !e.is_empty())
            .map(|e| format!("email:{}", e))
            .unwrap_or_default()
    }

    /// token 是否允许请求该模型。缓存未命中时放行，避免误拦截。
    pub async fn is_token_allowed_for_model(&self, token_key: &str, requested_model: &str) -> bool {
        let requested_model = requested_model.trim();
        if requested_model.is_empty() || !self.tuning.model_access_control_enabled {
            return true;
        }
        let state = self.state.lock().await;
        match state.cache.get(token_key) {
            Some(cached) => model_access::is_model_allowed_for_level(
                cached.account_level,
                requested_model,
                self.tuning.model_access_control_enabled,
                self.tuning.model_access_unknown_allowed,
            ),
            None => true,
        }
    }

    pub async fn is_token_disabled(&self, token_key: &str) -> bool {
        let Some(index) = index_from_token_key(token_key) else {
            return false;
        };
        let state = self.state.lock().await;
        state.configs.get(index).map(|c| c.disabled).unwrap_or(true)
    }

    /// 池内可用模型（按账号等级聚合取并集）。
    pub async fn list_available_models(&self) -> Vec<String> {
        let base = crate::config::list_request_models();
        if !self.tuning.model_access_control_enabled {
            return base;
        }

        let state = self.state.lock().await;
        if state.cache.is_empty() {
            return base;
        }

        let mut allowed = std::collections::HashSet::new();
        for cached in state.cache.values() {
            for model in model_access::allowed_models_for_level(cached.account_level) {
                allowed.insert(model);
            }
        }
        if allowed.is_empty() {
            return base;
        }

        let models: Vec<String> = base
            .iter()
            .filter(|m| allowed.contains(*m))
            .cloned()
            .collect();
        if models.is_empty() {
            base
        } else {
            models
        }
    }

    /// 请求失败：冷却 + 前进游标，并解除指向它的会话绑定。
    pub async fn mark_token_failed(&self, token_key: &str) {
        self.rate_limiter.mark_cooldown(token_key);
        self.session_bindings.unbind_token(token_key);
        let mut state = self.state.lock().await;
        advance_cursor(&mut state);
        warn!(failed_token = token_key, next_index = state.cursor, "token 请求失败，切换到下一个");
    }

    pub fn mark_token_success(&self, token_key: &str) {
        self.rate_limiter.record_success(token_key);
    }

    /// 重载凭据表（配置文件或 OAuth 存储变更后调用）。
    /// 同时清掉新旧下标键上的限流记录，重载后的凭据从干净状态起步。
    pub async fn reload(&self, configs: Vec<AuthConfig>) {
        let mut state = self.state.lock().await;
        for index in 0..state.configs.len().max(configs.len()) {
            self.rate_limiter.clear(&token_key_for_index(index));
        }
        info!(count = configs.len(), "凭据池已重载");
        state.configs = configs;
        state.cache.clear();
        state.cursor = 0;
        state.last_refresh = None;
    }

    async fn refresh_cache_if_stale(&self) {
        let stale = {
            let state = self.state.lock().await;
            state
                .last_refresh
                .map(|t| t.elapsed() > self.tuning.token_cache_ttl)
                .unwrap_or(true)
        };
        if stale {
            self.refresh_cache(false).await;
        }
    }

    /// 刷新缓存。`proactive` 模式只处理缺失/将过期的条目。
    ///
    /// 网络全部在锁外：先快照需要刷新的配置，逐个刷新，再上锁提交。
    pub async fn refresh_cache(&self, proactive: bool) {
        let threshold = self.tuning.proactive_refresh_threshold.as_secs() as i64;
        let work: Vec<(usize, AuthConfig)> = {
            let state = self.state.lock().await;
            state
                .configs
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.disabled)
                .filter(|(i, _)| {
                    if !proactive {
                        return true;
                    }
                    let key = token_key_for_index(*i);
                    match state.cache.get(&key) {
                        Some(cached) => {
                            cached.token.is_expired() || cached.token.needs_refresh(threshold)
                        }
                        None => true,
                    }
                })
                .map(|(i, c)| (i, c.clone()))
                .collect()
        };

        if work.is_empty() {
            return;
        }

        let mut refreshed = 0usize;
        for (index, config) in work {
            let token = match refresh::refresh_token(&config).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(config_index = index, error = %e, "刷新单个 token 失败");
                    continue;
                }
            };

            let binding_key = config.binding_key();
            if !binding_key.is_empty() {
                self.machine_ids.ensure_auto_binding(
                    &binding_key,
                    token.profile_arn.as_deref(),
                    &config.refresh_token,
                );
            }

            let (usage_info, available, account_level) =
                match usage::check_usage_limits(&token, &config.region).await {
                    Ok(usage_limits) => {
                        let available = usage_limits.available_count();
                        let level = model_access::detect_account_level(&usage_limits);
                        (Some(usage_limits), available, level)
                    }
                    Err(e) => {
                        warn!(config_index = index, error = %e, "检查使用限制失败");
                        (None, 0.0, AccountLevel::Unknown)
                    }
                };

            let key = token_key_for_index(index);
            let mut state = self.state.lock().await;
            state.cache.insert(
                key.clone(),
                CachedToken {
                    token,
                    usage: usage_info,
                    account_level,
                    cached_at: Instant::now(),
                    last_used: None,
                    available,
                },
            );
            refreshed += 1;
            debug!(cache_key = %key, available, "token 缓存更新");
        }

        let mut state = self.state.lock().await;
        state.last_refresh = Some(Instant::now());
        if refreshed > 0 {
            info!(refreshed_count = refreshed, proactive, "token 缓存刷新完成");
        }
    }

    /// 后台主动刷新任务。
    pub fn spawn_proactive_refresh(self: &Arc<Self>) {
        if !self.tuning.proactive_refresh_enabled {
            return;
        }
        let manager = self.clone();
        let interval = self.tuning.proactive_refresh_interval;
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                threshold_secs = manager.tuning.proactive_refresh_threshold.as_secs(),
                "主动刷新任务已启动"
            );
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("主动刷新任务已停止");
                        break;
                    }
                    _ = ticker.tick() => manager.refresh_cache(true).await,
                }
            }
        });
    }

    /// 池状态快照（监控接口用）。access token 只露尾部。
    pub async fn pool_snapshot(&self) -> Vec<serde_json::Value> {
        let state = self.state.lock().await;
        state
            .configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                let key = token_key_for_index(index);
                let cached = state.cache.get(&key);

                let status = if config.disabled {
                    "disabled"
                } else if self.rate_limiter.is_cooldown(&key) {
                    "cooldown"
                } else if self.rate_limiter.is_daily_limit_exceeded(&key) {
                    "daily_limit"
                } else {
                    match cached {
                        Some(c) if c.is_usable() => "active",
                        Some(_) => "exhausted",
                        None => "pending",
                    }
                };

                let email = cached
                    .and_then(|c| c.usage.as_ref())
                    .map(|u| u.user_info.email.clone())
                    .filter(|e| !e.is_empty());

                serde_json::json!({
                    "index": index,
                    "token_key": key,
                    "auth_kind": config.auth_kind,
                    "region": config.region,
                    "status": status,
                    "user_email": email,
                    "account_level": cached.map(|c| c.account_level),
                    "remaining_usage": cached.map(|c| c.available),
                    "token_preview": cached.map(|c| token_preview(&c.token.access_token)),
                    "expires_at": cached.map(|c| c.token.expires_at.to_rfc3339()),
                    "daily_remaining": self.rate_limiter.daily_remaining(&key),
                })
            })
            .collect()
    }

    /// 测试注入：直接塞缓存条目。
    #[cfg(test)]
    pub async fn inject_cached(&self, index: usize, cached: CachedToken) {
        let mut state = self.state.lock().await;
        state.cache.insert(token_key_for_index(index), cached);
        state.last_refresh = Some(Instant::now());
    }

    #[cfg(test)]
    pub async fn cursor(&self) -> usize {
        self.state.lock().await.cursor
    }
}

fn advance_cursor(state: &mut PoolState) {
    if !state.configs.is_empty() {
        state.cursor = (state.cursor + 1) % state.configs.len();
    }
}

/// token 预览格式：***+后 10 位。
fn token_preview(token: &str) -> String {
    if token.len() <= 10 {
        return "*".repeat(token.len());
    }
    format!("***{}", &token[token.len() - 10..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::AuthKind;
    use chrono::Utc;
    use std::time::Duration;

    fn test_tuning() -> Tuning {
        let mut t = Tuning::from_env();
        t.rate_limit_min_interval = Duration::from_millis(0);
        t.rate_limit_max_interval = Duration::from_millis(0);
        t.rate_limit_global_min_interval = Duration::from_millis(0);
        t.rate_limit_jitter_percent = 0;
        t.rate_limit_daily_max = 0;
        t.token_cache_ttl = Duration::from_secs(300);
        t
    }

    fn config(i: usize) -> AuthConfig {
        AuthConfig {
            auth_kind: AuthKind::Social,
            refresh_token: format!("rt-{}", i),
            client_id: None,
            client_secret: None,
            region: "us-east-1".into(),
            disabled: false,
            oauth_id: None,
        }
    }

    fn cached(level: AccountLevel, available: f64) -> CachedToken {
        CachedToken {
            token: TokenInfo {
                access_token: "at".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                profile_arn: None,
            },
            usage: None,
            account_level: level,
            cached_at: Instant::now(),
            last_used: None,
            available,
        }
    }

    fn build_manager(configs: Vec<AuthConfig>, tuning: Tuning) -> Arc<TokenManager> {
        let machine_ids = Arc::new(MachineIdStore::in_memory());
        TokenManager::new(
            configs,
            Arc::new(RateLimiter::new(&tuning)),
            Arc::new(FingerprintManager::new(machine_ids.clone())),
            Arc::new(SessionBindingManager::new(tuning.session_pool_ttl)),
            machine_ids,
            tuning,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn round_robin_selection_and_session_stickiness() {
        let manager = build_manager(vec![config(0), config(1)], test_tuning());
        manager.inject_cached(0, cached(AccountLevel::Pro, 10.0)).await;
        manager.inject_cached(1, cached(AccountLevel::Pro, 10.0)).await;

        let (_, _, key1) = manager
            .acquire_for_session_and_model("s1", "claude-sonnet-4-5")
            .await
            .unwrap();
        // 同会话第二次命中绑定，不换 token
        let (_, _, key2) = manager
            .acquire_for_session_and_model("s1", "claude-sonnet-4-5")
            .await
            .unwrap();
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn model_gate_produces_model_not_found() {
        let manager = build_manager(vec![config(0)], test_tuning());
        manager.inject_cached(0, cached(AccountLevel::Free, 10.0)).await;

        // Free 不支持 opus-4-6，且池中无人支持 → ModelNotFound
        let err = manager
            .acquire_for_session_and_model("s1", "claude-opus-4-6")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn cooldown_token_is_skipped() {
        let manager = build_manager(vec![config(0), config(1)], test_tuning());
        manager.inject_cached(0, cached(AccountLevel::Pro, 10.0)).await;
        manager.inject_cached(1, cached(AccountLevel::Pro, 10.0)).await;

        manager.rate_limiter().mark_cooldown("token_0");
        let (_, _, key) = manager
            .acquire_for_session_and_model("s1", "claude-sonnet-4-5")
            .await
            .unwrap();
        assert_eq!(key, "token_1");
    }

    #[tokio::test]
    async fn exhausted_pool_yields_no_available() {
        let manager = build_manager(vec![config(0)], test_tuning());
        manager.inject_cached(0, cached(AccountLevel::Pro, 0.0)).await;
        let err = manager
            .acquire_for_session_and_model("s1", "claude-sonnet-4-5")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NoAvailableToken));
    }

    #[tokio::test]
    async fn mark_failed_advances_cursor_and_unbinds() {
        let manager = build_manager(vec![config(0), config(1)], test_tuning());
        manager.inject_cached(0, cached(AccountLevel::Pro, 10.0)).await;
        manager.inject_cached(1, cached(AccountLevel::Pro, 10.0)).await;

        let (_, _, key) = manager
            .acquire_for_session_and_model("s1", "claude-sonnet-4-5")
            .await
            .unwrap();
        manager.mark_token_failed(&key).await;

        // 冷却中的 token 不再被选中
        let (_, _, next) = manager
            .acquire_for_session_and_model("s2", "claude-sonnet-4-5")
            .await
            .unwrap();
        assert_ne!(next, key);

        // 旧会话绑定已解除，重新分配也避开冷却 token
        let (_, _, rebound) = manager
            .acquire_for_session_and_model("s1", "claude-sonnet-4-5")
            .await
            .unwrap();
        assert_ne!(rebound, key);
    }

    #[tokio::test]
    async fn list_available_models_unions_levels() {
        let manager = build_manager(vec![config(0), config(1)], test_tuning());
        manager.inject_cached(0, cached(AccountLevel::Free, 10.0)).await;
        manager.inject_cached(1, cached(AccountLevel::Enterprise, 10.0)).await;

        let models = manager.list_available_models().await;
        // enterprise 在池中 → 全量
        assert_eq!(models.len(), 4);
    }

    #[tokio::test]
    async fn disabled_config_never_selected() {
        let mut disabled = config(0);
        disabled.disabled = true;
        let manager = build_manager(vec![disabled, config(1)], test_tuning());
        manager.inject_cached(0, cached(AccountLevel::Pro, 10.0)).await;
        manager.inject_cached(1, cached(AccountLevel::Pro, 10.0)).await;

        for session in ["a", "b", "c"] {
            let (_, _, key) = manager
                .acquire_for_session_and_model(session, "claude-sonnet-4-5")
                .await
                .unwrap();
            assert_eq!(key, "token_1");
        }
    }
}
