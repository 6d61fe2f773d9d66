// 频率限制器
//
// 目标不是公平排队，而是让每个凭据的请求节奏像一台真实 IDE：
// 单 token 最小间隔带随机抖动、全局最小间隔、连续使用轮换信号、
// 每日上限，以及失败后的指数冷却。

use std::time::{Duration, Instant};

use chrono::{Datelike, Utc};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Tuning;

#[derive(Debug, Clone)]
struct TokenState {
    last_request_at: Option<Instant>,
    consecutive_count: u32,
    daily_count: u32,
    /// 日计数所属的 ordinal day，跨天自动清零
    daily_day: i32,
    cooldown_until: Option<Instant>,
    fail_streak: u32,
}

impl TokenState {
    fn new() -> Self {
        Self {
            last_request_at: None,
            consecutive_count: 0,
            daily_count: 0,
            daily_day: current_day(),
            cooldown_until: None,
            fail_streak: 0,
        }
    }

    fn roll_day_if_needed(&mut self) {
        let today = current_day();
        if self.daily_day != today {
            self.daily_day = today;
            self.daily_count = 0;
        }
    }
}

fn current_day() -> i32 {
    Utc::now().num_days_from_ce()
}

pub struct RateLimiter {
    states: DashMap<String, TokenState>,
    /// 全局最小间隔门（所有 token 共享）
    global_last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
    max_interval: Duration,
    global_min_interval: Duration,
    max_consecutive: u32,
    cooldown: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    backoff_multiplier: f64,
    jitter_percent: u32,
    daily_max: u32,
}

impl RateLimiter {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            states: DashMap::new(),
            global_last_request: Mutex::new(None),
            min_interval: tuning.rate_limit_min_interval,
            max_interval: tuning.rate_limit_max_interval,
            global_min_interval: tuning.rate_limit_global_min_interval,
            max_consecutive: tuning.rate_limit_max_consecutive,
            cooldown: tuning.rate_limit_cooldown,
            backoff_base: tuning.rate_limit_backoff_base,
            backoff_max: tuning.rate_limit_backoff_max,
            backoff_multiplier: tuning.rate_limit_backoff_multiplier,
            jitter_percent: tuning.rate_limit_jitter_percent,
            daily_max: tuning.rate_limit_daily_max,
        }
    }

    /// 阻塞到该 token 和全局门都允许发起下一个请求。
    pub async fn wait_for_token(&self, key: &str) {
        // per-token 间隔
        let wait = {
            let state = self.states.get(key);
            match state.and_then(|s| s.last_request_at) {
                Some(last) => {
                    let interval = self.random_interval();
                    let elapsed = last.elapsed();
                    interval.checked_sub(elapsed)
                }
                None => None,
            }
        };
        if let Some(wait) = wait {
            debug!(key, wait_ms = wait.as_millis() as u64, "等待 token 间隔");
            tokio::time::sleep(wait).await;
        }

        // 全局最小间隔门，锁内只计算，等待在锁外
        loop {
            let wait = {
                let guard = self.global_last_request.lock().await;
                match *guard {
                    Some(last) => self.global_min_interval.checked_sub(last.elapsed()),
                    None => None,
                }
            };
            match wait {
                Some(wait) if !wait.is_zero() => tokio::time::sleep(wait).await,
                _ => break,
            }
        }
    }

    /// 单 token 间隔：random(min, max) · (1 + rand·jitter%)。
    fn random_interval(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let min = self.min_interval.as_millis() as u64;
        let max = self.max_interval.as_millis().max(self.min_interval.as_millis()) as u64;
        let base = if max > min {
            rng.gen_range(min..=max)
        } else {
            min
        };
        let jitter = base as f64 * (self.jitter_percent as f64 / 100.0) * rng.gen::<f64>();
        Duration::from_millis(base + jitter as u64)
    }

    /// 记录一次请求发出。
    pub async fn record_request(&self, key: &str) {
        let now = Instant::now();
        {
            let mut state = self.states.entry(key.to_string()).or_insert_with(TokenState::new);
            state.roll_day_if_needed();
            state.last_request_at = Some(now);
            state.consecutive_count += 1;
            state.daily_count += 1;
        }
        let mut guard = self.global_last_request.lock().await;
        *guard = Some(now);
    }

    /// 连续使用次数达到上限，该换下一个 token 了。
    pub fn should_rotate(&self, key: &str) -> bool {
        self.states
            .get(key)
            .map(|s| s.consecutive_count >= self.max_consecutive)
            .unwrap_or(false)
    }

    pub fn reset_consecutive(&self, key: &str) {
        if let Some(mut state) = self.states.get_mut(key) {
            state.consecutive_count = 0;
        }
    }

    pub fn is_cooldown(&self, key: &str) -> bool {
        self.states
            .get(key)
            .and_then(|s| s.cooldown_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn is_daily_limit_exceeded(&self, key: &str) -> bool {
        if self.daily_max == 0 {
            return false;
        }
        self.states
            .get(key)
            .map(|s| {
                if s.daily_day != current_day() {
                    return false;
                }
                s.daily_count >= self.daily_max
            })
            .unwrap_or(false)
    }

    pub fn daily_remaining(&self, key: &str) -> u32 {
        if self.daily_max == 0 {
            return u32::MAX;
        }
        self.states
            .get(key)
            .map(|s| {
                if s.daily_day != current_day() {
                    self.daily_max
                } else {
                    self.daily_max.saturating_sub(s.daily_count)
                }
            })
            .unwrap_or(self.daily_max)
    }

    /// 指数冷却：base · multiplier^fail_streak，封顶 backoff_max。
    pub fn mark_cooldown(&self, key: &str) {
        let mut state = self.states.entry(key.to_string()).or_insert_with(TokenState::new);
        let backoff_ms = (self.backoff_base.as_millis() as f64
            * self.backoff_multiplier.powi(state.fail_streak as i32))
        .min(self.backoff_max.as_millis() as f64);
        let backoff = Duration::from_millis(backoff_ms as u64).max(self.cooldown);
        state.cooldown_until = Some(Instant::now() + backoff);
        state.fail_streak += 1;
        info!(
            key,
            fail_streak = state.fail_streak,
            cooldown_secs = backoff.as_secs(),
            "token 进入冷却"
        );
    }

    /// 指定时长冷却（例如 TEMPORARILY_SUSPENDED 的 24h 惩罚）。
    pub fn mark_cooldown_for(&self, key: &str, duration: Duration) {
        let mut state = self.states.entry(key.to_string()).or_insert_with(TokenState::new);
        state.cooldown_until = Some(Instant::now() + duration);
        state.fail_streak += 1;
    }

    pub fn record_success(&self, key: &str) {
        if let Some(mut state) = self.states.get_mut(key) {
            state.fail_streak = 0;
        }
    }

    pub fn clear(&self, key: &str) {
        self.states.remove(key);
    }

    /// 清理已过冷却期且今日无计数的记录，返回移除条数。
    pub fn cleanup_expired(&self) -> usize {
        let before = self.states.len();
        let now = Instant::now();
        let today = current_day();
        self.states.retain(|_, s| {
            let cooling = s.cooldown_until.map(|u| now < u).unwrap_or(false);
            let counted_today = s.daily_day == today && s.daily_count > 0;
            cooling || counted_today || s.consecutive_count > 0
        });
        before - self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_tuning() -> Tuning {
        let mut t = Tuning::from_env();
        t.rate_limit_min_interval = Duration::from_millis(0);
        t.rate_limit_max_interval = Duration::from_millis(0);
        t.rate_limit_global_min_interval = Duration::from_millis(0);
        t.rate_limit_max_consecutive = 3;
        t.rate_limit_cooldown = Duration::from_millis(50);
        t.rate_limit_backoff_base = Duration::from_millis(50);
        t.rate_limit_backoff_max = Duration::from_millis(400);
        t.rate_limit_backoff_multiplier = 2.0;
        t.rate_limit_jitter_percent = 0;
        t.rate_limit_daily_max = 5;
        t
    }

    #[tokio::test]
    async fn rotation_signal_after_max_consecutive() {
        let rl = RateLimiter::new(&fast_tuning());
        assert!(!rl.should_rotate("k"));
        for _ in 0..3 {
            rl.wait_for_token("k").await;
            rl.record_request("k").await;
        }
        assert!(rl.should_rotate("k"));
        rl.reset_consecutive("k");
        assert!(!rl.should_rotate("k"));
    }

    #[tokio::test]
    async fn daily_limit_enforced() {
        let rl = RateLimiter::new(&fast_tuning());
        for _ in 0..5 {
            rl.record_request("k").await;
        }
        assert!(rl.is_daily_limit_exceeded("k"));
        assert_eq!(rl.daily_remaining("k"), 0);
        assert!(!rl.is_daily_limit_exceeded("other"));
    }

    #[tokio::test]
    async fn cooldown_is_exponential_and_capped() {
        let rl = RateLimiter::new(&fast_tuning());
        rl.mark_cooldown("k");
        assert!(rl.is_cooldown("k"));

        // fail_streak 增长
        rl.mark_cooldown("k");
        rl.mark_cooldown("k");
        let state = rl.states.get("k").unwrap();
        assert_eq!(state.fail_streak, 3);
        drop(state);

        rl.record_success("k");
        assert_eq!(rl.states.get("k").unwrap().fail_streak, 0);
    }

    #[tokio::test]
    async fn cooldown_expires() {
        let rl = RateLimiter::new(&fast_tuning());
        rl.mark_cooldown_for("k", Duration::from_millis(20));
        assert!(rl.is_cooldown("k"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!rl.is_cooldown("k"));
    }

    #[tokio::test]
    async fn cleanup_drops_idle_entries() {
        let rl = RateLimiter::new(&fast_tuning());
        rl.mark_cooldown_for("idle", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cleaned = rl.cleanup_expired();
        assert_eq!(cleaned, 1);
        assert!(rl.states.get("idle").is_none());
    }

    #[tokio::test]
    async fn wait_respects_global_gate() {
        let mut tuning = fast_tuning();
        tuning.rate_limit_global_min_interval = Duration::from_millis(30);
        let rl = RateLimiter::new(&tuning);

        rl.record_request("a").await;
        let start = Instant::now();
        rl.wait_for_token("b").await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
