// 限流识别与退避
//
// 同一个上下文里的所有上传共享一个 RateGovernor：
// 服务端限流是按应用/主页维度计算的，任意一次成功都会把退避重置回初始值

use crate::config::RateLimitConfig;
use crate::graph::{GraphErrorBody, RATE_LIMIT_ERROR_CODES};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 限流消息匹配模式（不区分大小写）
const RATE_LIMIT_PATTERNS: [&str; 6] = [
    r"rate.?limit",
    r"too.?many.?requests?",
    r"throttl",
    r"quota.?exceeded",
    r"request.?limit",
    r"(#4|#17|#32|#613)",
];

#[derive(Debug)]
struct RateState {
    /// 下一次没有服务端建议值时使用的等待时间
    current_wait: Duration,
    last_rate_limit: Option<Instant>,
}

/// 限流识别与指数退避
#[derive(Debug)]
pub struct RateGovernor {
    initial_wait: Duration,
    max_wait: Duration,
    backoff_factor: f64,
    patterns: Vec<Regex>,
    state: Mutex<RateState>,
}

impl RateGovernor {
    pub fn new(config: &RateLimitConfig) -> Self {
        let initial_wait = Duration::from_secs(config.initial_wait_secs);
        let patterns = RATE_LIMIT_PATTERNS
            .iter()
            .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
            .collect();

        Self {
            initial_wait,
            max_wait: Duration::from_secs(config.max_wait_secs.max(config.initial_wait_secs)),
            backoff_factor: if config.backoff_factor.is_finite() {
                config.backoff_factor.max(1.0)
            } else {
                1.0
            },
            patterns,
            state: Mutex::new(RateState {
                current_wait: initial_wait,
                last_rate_limit: None,
            }),
        }
    }

    /// 判断一次失败响应是否为限流
    ///
    /// # 参数
    /// * `status` - HTTP 状态码（429 直接视为限流）
    /// * `error` - 响应中的 error 对象
    pub fn is_rate_limited(&self, status: u16, error: Option<&GraphErrorBody>) -> bool {
        if status == 429 {
            return true;
        }
        match error {
            Some(error) => self.matches(error.code, &error.message),
            None => false,
        }
    }

    /// 按错误码和消息判断
    pub fn matches(&self, code: i64, message: &str) -> bool {
        if RATE_LIMIT_ERROR_CODES.contains(&code) {
            return true;
        }
        self.patterns.iter().any(|p| p.is_match(message))
    }

    /// 记录一次限流，返回本次应等待的时间
    ///
    /// 服务端给出 retry_after 时直接使用（不超过上限），
    /// 否则使用当前退避值并把退避值翻倍
    pub fn record_rate_limit(&self, retry_after: Option<u64>) -> Duration {
        let mut state = self.state.lock();
        state.last_rate_limit = Some(Instant::now());

        let wait = match retry_after {
            Some(secs) if secs > 0 => Duration::from_secs(secs).min(self.max_wait),
            _ => {
                let wait = state.current_wait;
                let next = (state.current_wait.as_secs_f64() * self.backoff_factor)
                    .min(self.max_wait.as_secs_f64());
                state.current_wait = Duration::from_secs_f64(next);
                wait
            }
        };
        drop(state);

        warn!("⚠️ 触发限流，等待 {} 秒", wait.as_secs());
        wait
    }

    /// 上传成功后重置退避
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.current_wait != self.initial_wait || state.last_rate_limit.is_some() {
            info!("限流状态已重置");
        }
        state.current_wait = self.initial_wait;
        state.last_rate_limit = None;
    }

    /// 距上次限流的时间
    pub fn time_since_last_rate_limit(&self) -> Option<Duration> {
        self.state.lock().last_rate_limit.map(|t| t.elapsed())
    }

    /// 当前退避值
    pub fn current_wait(&self) -> Duration {
        self.state.lock().current_wait
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}
