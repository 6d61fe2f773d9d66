// 进程核心句柄
//
// 所有有状态组件在启动时装配完毕，通过这一个句柄线程化传递；
// 没有进程级单例，测试可以注入任意替身。

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{
    AuthConfig, FingerprintManager, MachineIdStore, OAuthTokenStore, RateLimiter,
    SessionBindingManager, SessionPoolManager, TokenManager,
};
use crate::config::Tuning;

pub struct Core {
    pub tuning: Tuning,
    pub token_manager: Arc<TokenManager>,
    pub session_pool: Arc<SessionPoolManager>,
    pub session_bindings: Arc<SessionBindingManager>,
    pub oauth_store: Arc<OAuthTokenStore>,
    pub machine_ids: Arc<MachineIdStore>,
    /// 客户端侧 API key（为空则不鉴权）
    pub api_key: Option<String>,
    pub cancel: CancellationToken,
}

impl Core {
    /// 装配全部组件。`configs` 为启动时的凭据表（文件/环境 + OAuth 存储）。
    pub fn new(
        configs: Vec<AuthConfig>,
        tuning: Tuning,
        oauth_store: Arc<OAuthTokenStore>,
        machine_ids: Arc<MachineIdStore>,
        api_key: Option<String>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();

        let rate_limiter = Arc::new(RateLimiter::new(&tuning));
        let fingerprints = Arc::new(FingerprintManager::new(machine_ids.clone()));
        let session_bindings = Arc::new(SessionBindingManager::new(tuning.session_pool_ttl));

        let token_manager = TokenManager::new(
            configs,
            rate_limiter,
            fingerprints,
            session_bindings.clone(),
            machine_ids.clone(),
            tuning.clone(),
            cancel.child_token(),
        );

        let session_pool = SessionPoolManager::new(token_manager.clone(), &tuning, cancel.child_token());

        Arc::new(Self {
            tuning,
            token_manager,
            session_pool,
            session_bindings,
            oauth_store,
            machine_ids,
            api_key,
            cancel,
        })
    }

    /// 启动后台任务：主动刷新、会话池与会话绑定清理。
    /// 会话池关闭时不起对应的清理任务。
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.token_manager.spawn_proactive_refresh();
        if self.tuning.session_pool_enabled {
            self.session_pool.spawn_janitor();
        }
        self.session_bindings.spawn_janitor(self.cancel.child_token());
    }

    /// OAuth 存储变化后重载凭据表。
    pub async fn reload_tokens(&self) {
        let mut configs = load_file_configs();
        configs.extend(self.oauth_store.to_auth_configs());
        self.token_manager.reload(configs).await;
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// 启动装配：读环境里的凭据配置与持久化存储，组出 Core。
pub fn bootstrap(tuning: Tuning) -> Arc<Core> {
    let oauth_store = Arc::new(OAuthTokenStore::load(env_path("OAUTH_TOKEN_FILE")));
    let machine_ids = Arc::new(MachineIdStore::load(env_path("MACHINE_ID_BINDING_FILE")));

    let mut configs = load_file_configs();
    let oauth_configs = oauth_store.to_auth_configs();
    if !oauth_configs.is_empty() {
        info!(count = oauth_configs.len(), "从 OAuth 存储加载凭据");
        configs.extend(oauth_configs);
    }

    if configs.is_empty() {
        warn!("未找到任何上游凭据，所有请求都会拿不到 token");
    }

    let api_key = std::env::var("KIRO_API_KEY")
        .or_else(|_| std::env::var("API_KEY"))
        .ok()
        .filter(|k| !k.trim().is_empty());

    Core::new(configs, tuning, oauth_store, machine_ids, api_key)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// 凭据配置：`KIRO_AUTH_CONFIG`（JSON 数组字面量）优先，
/// 其次 `KIRO_CONFIG_FILE` 指向的 JSON 文件。
fn load_file_configs() -> Vec<AuthConfig> {
    if let Ok(raw) = std::env::var("KIRO_AUTH_CONFIG") {
        if !raw.trim().is_empty() {
            match serde_json::from_str::<Vec<AuthConfig>>(&raw) {
                Ok(configs) => {
                    info!(count = configs.len(), "从环境变量加载凭据配置");
                    return configs;
                }
                Err(e) => warn!(error = %e, "KIRO_AUTH_CONFIG 解析失败"),
            }
        }
    }

    if let Some(path) = env_path("KIRO_CONFIG_FILE") {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<AuthConfig>>(&content) {
                Ok(configs) => {
                    info!(count = configs.len(), path = %path.display(), "从配置文件加载凭据");
                    return configs;
                }
                Err(e) => warn!(error = %e, "凭据配置文件解析失败"),
            },
            Err(e) => warn!(error = %e, path = %path.display(), "凭据配置文件读取失败"),
        }
    }

    Vec::new()
}
