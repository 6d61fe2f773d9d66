use std::time::Duration;

/// 性能与防封号调优参数。
///
/// 所有值可由环境变量覆盖；在启动时读取一次，之后通过 `Core` 句柄传递，
/// 不使用进程级全局变量。
#[derive(Debug, Clone)]
pub struct Tuning {
    // ---- token 缓存 ----
    pub token_cache_ttl: Duration,

    // ---- 主动刷新 ----
    pub proactive_refresh_enabled: bool,
    pub proactive_refresh_interval: Duration,
    pub proactive_refresh_threshold: Duration,

    // ---- 频率限制（多 token 快速轮换会触发上游安全检测） ----
    pub rate_limit_min_interval: Duration,
    pub rate_limit_max_interval: Duration,
    pub rate_limit_global_min_interval: Duration,
    pub rate_limit_max_consecutive: u32,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_backoff_base: Duration,
    pub rate_limit_backoff_max: Duration,
    pub rate_limit_backoff_multiplier: f64,
    pub rate_limit_jitter_percent: u32,
    pub rate_limit_daily_max: u32,
    pub suspended_token_cooldown: Duration,

    // ---- 会话级账号池 ----
    pub session_pool_enabled: bool,
    pub session_pool_max_size: usize,
    pub session_pool_max_retries: u32,
    pub session_pool_ttl: Duration,
    pub session_pool_cooldown: Duration,
    pub session_pool_retry_interval: Duration,

    // ---- 模型访问控制 ----
    pub model_access_control_enabled: bool,
    pub model_access_unknown_allowed: bool,

    // ---- 工具与解析器 ----
    pub max_tool_description_length: usize,
    pub parser_max_errors: u32,
    pub non_stream_parse_timeout: Duration,

    // ---- 上游区域 ----
    pub region: String,
}

impl Default for Tuning {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Tuning {
    pub fn from_env() -> Self {
        Self {
            token_cache_ttl: env_duration("TOKEN_CACHE_TTL", Duration::from_secs(300)),

            proactive_refresh_enabled: env_bool("PROACTIVE_REFRESH_ENABLED", true),
            proactive_refresh_interval: env_duration(
                "PROACTIVE_REFRESH_INTERVAL",
                Duration::from_secs(60),
            ),
            proactive_refresh_threshold: env_duration(
                "PROACTIVE_REFRESH_THRESHOLD",
                Duration::from_secs(300),
            ),

            rate_limit_min_interval: env_duration("RATE_LIMIT_MIN_INTERVAL", Duration::from_secs(10)),
            rate_limit_max_interval: env_duration("RATE_LIMIT_MAX_INTERVAL", Duration::from_secs(30)),
            rate_limit_global_min_interval: env_duration(
                "RATE_LIMIT_GLOBAL_MIN_INTERVAL",
                Duration::from_secs(5),
            ),
            rate_limit_max_consecutive: env_u32("RATE_LIMIT_MAX_CONSECUTIVE", 10),
            rate_limit_cooldown: env_duration("RATE_LIMIT_COOLDOWN", Duration::from_secs(300)),
            rate_limit_backoff_base: env_duration("RATE_LIMIT_BACKOFF_BASE", Duration::from_secs(120)),
            rate_limit_backoff_max: env_duration("RATE_LIMIT_BACKOFF_MAX", Duration::from_secs(3600)),
            rate_limit_backoff_multiplier: env_f64("RATE_LIMIT_BACKOFF_MULTIPLIER", 2.0),
            rate_limit_jitter_percent: env_u32("RATE_LIMIT_JITTER_PERCENT", 30),
            rate_limit_daily_max: env_u32("RATE_LIMIT_DAILY_MAX", 500),
            suspended_token_cooldown: env_duration(
                "SUSPENDED_TOKEN_COOLDOWN",
                Duration::from_secs(24 * 3600),
            ),

            session_pool_enabled: env_bool("SESSION_POOL_ENABLED", true),
            session_pool_max_size: env_u32("SESSION_POOL_MAX_SIZE", 3) as usize,
            session_pool_max_retries: env_u32("SESSION_POOL_MAX_RETRIES", 5),
            session_pool_ttl: env_duration("SESSION_POOL_TTL", Duration::from_secs(30 * 60)),
            session_pool_cooldown: env_duration("SESSION_POOL_COOLDOWN", Duration::from_secs(60)),
            session_pool_retry_interval: env_duration(
                "SESSION_POOL_RETRY_INTERVAL",
                Duration::from_millis(100),
            ),

            model_access_control_enabled: env_bool("MODEL_ACCESS_CONTROL_ENABLED", true),
            model_access_unknown_allowed: env_bool("MODEL_ACCESS_UNKNOWN_ALLOWED", true),

            max_tool_description_length: env_u32("MAX_TOOL_DESCRIPTION_LENGTH", 10_000) as usize,
            parser_max_errors: env_u32("PARSER_MAX_ERRORS", 10),
            non_stream_parse_timeout: env_duration(
                "NON_STREAM_PARSE_TIMEOUT",
                Duration::from_secs(10),
            ),

            region: std::env::var("KIRO_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        }
    }
}

/// 解析形如 `5s` / `1m` / `2h` / 纯秒数的时长。
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if !raw.is_char_boundary(raw.len() - 1) {
        return None;
    }
    let (num, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = num.trim().parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => {
            // 毫秒形式 "100ms"
            if let Some(ms) = raw.strip_suffix("ms") {
                ms.trim().parse::<u64>().ok().map(Duration::from_millis)
            } else {
                None
            }
        }
    }
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
