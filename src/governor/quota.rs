// API 配额跟踪
//
// 按小时/按天滚动计数，快拍任务在每一批和每一条之前检查；
// 使用率跨过 70/85/95/100% 时各提醒一次（每个窗口内）

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86400);

/// 提醒级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum WarningLevel {
    /// 70%
    Info,
    /// 85%
    Warning,
    /// 95%
    Critical,
    /// 100%，停止
    Stop,
}

impl WarningLevel {
    const ALL: [WarningLevel; 4] = [
        WarningLevel::Info,
        WarningLevel::Warning,
        WarningLevel::Critical,
        WarningLevel::Stop,
    ];

    pub fn threshold(&self) -> f64 {
        match self {
            WarningLevel::Info => 70.0,
            WarningLevel::Warning => 85.0,
            WarningLevel::Critical => 95.0,
            WarningLevel::Stop => 100.0,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            WarningLevel::Info => "⚠️ 已使用 70% 的调用配额",
            WarningLevel::Warning => "🔶 已使用 85% 的调用配额",
            WarningLevel::Critical => "🔴 已使用 95% 的调用配额！",
            WarningLevel::Stop => "⛔ 调用配额已用尽，暂停上传",
        }
    }

    /// 使用率对应的最高级别
    fn for_percent(percent: f64) -> Option<Self> {
        Self::ALL
            .iter()
            .rev()
            .find(|level| percent >= level.threshold())
            .copied()
    }
}

/// 配额使用情况
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuotaUsage {
    pub hourly_calls: u32,
    pub hourly_limit: u32,
    pub hourly_percent: f64,
    pub hourly_remaining: u32,
    pub daily_calls: u32,
    pub daily_limit: u32,
    pub daily_percent: f64,
    pub daily_remaining: u32,
    /// 距小时窗口重置（秒）
    pub secs_to_hourly_reset: u64,
    /// 距日窗口重置（秒）
    pub secs_to_daily_reset: u64,
}

/// 配额检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCheck {
    pub can_continue: bool,
    /// 本次新产生的提醒
    pub message: Option<String>,
    pub level: Option<WarningLevel>,
}

#[derive(Debug)]
struct QuotaState {
    hourly_limit: u32,
    daily_limit: u32,
    hourly_calls: u32,
    daily_calls: u32,
    hour_start: Instant,
    day_start: Instant,
    /// 当前窗口内已提醒过的最高级别
    warned_hourly: Option<WarningLevel>,
    warned_daily: Option<WarningLevel>,
}

impl QuotaState {
    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.hour_start) >= HOUR {
            self.hourly_calls = 0;
            self.hour_start = now;
            self.warned_hourly = None;
        }
        if now.saturating_duration_since(self.day_start) >= DAY {
            self.daily_calls = 0;
            self.day_start = now;
            self.warned_daily = None;
        }
    }

    fn usage(&self, now: Instant) -> QuotaUsage {
        QuotaUsage {
            hourly_calls: self.hourly_calls,
            hourly_limit: self.hourly_limit,
            hourly_percent: percent(self.hourly_calls, self.hourly_limit),
            hourly_remaining: self.hourly_limit.saturating_sub(self.hourly_calls),
            daily_calls: self.daily_calls,
            daily_limit: self.daily_limit,
            daily_percent: percent(self.daily_calls, self.daily_limit),
            daily_remaining: self.daily_limit.saturating_sub(self.daily_calls),
            secs_to_hourly_reset: HOUR
                .saturating_sub(now.saturating_duration_since(self.hour_start))
                .as_secs(),
            secs_to_daily_reset: DAY
                .saturating_sub(now.saturating_duration_since(self.day_start))
                .as_secs(),
        }
    }
}

fn percent(calls: u32, limit: u32) -> f64 {
    if limit == 0 {
        0.0
    } else {
        calls as f64 / limit as f64 * 100.0
    }
}

/// 单个任务的调用配额跟踪器
#[derive(Debug)]
pub struct QuotaTracker {
    state: Mutex<QuotaState>,
}

impl QuotaTracker {
    pub fn new(hourly_limit: u32, daily_limit: u32) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(QuotaState {
                hourly_limit,
                daily_limit,
                hourly_calls: 0,
                daily_calls: 0,
                hour_start: now,
                day_start: now,
                warned_hourly: None,
                warned_daily: None,
            }),
        }
    }

    /// 记录调用次数
    pub fn record_call(&self, count: u32) {
        self.record_call_at(count, Instant::now());
    }

    pub fn record_call_at(&self, count: u32, now: Instant) {
        let mut state = self.state.lock();
        state.roll(now);
        state.hourly_calls = state.hourly_calls.saturating_add(count);
        state.daily_calls = state.daily_calls.saturating_add(count);
    }

    /// 再发起 `count` 次调用是否会超出配额
    ///
    /// # 返回
    /// `Err` 中是可读的等待提示
    pub fn can_make_request(&self, count: u32) -> Result<(), String> {
        self.can_make_request_at(count, Instant::now())
    }

    pub fn can_make_request_at(&self, count: u32, now: Instant) -> Result<(), String> {
        let mut state = self.state.lock();
        state.roll(now);
        let usage = state.usage(now);

        if state.daily_calls.saturating_add(count) > state.daily_limit {
            let secs = usage.secs_to_daily_reset;
            return Err(format!(
                "已达到每日调用上限，请等待 {} 小时 {} 分钟",
                secs / 3600,
                (secs % 3600) / 60
            ));
        }
        if state.hourly_calls.saturating_add(count) > state.hourly_limit {
            return Err(format!(
                "已达到每小时调用上限，请等待 {} 分钟",
                usage.secs_to_hourly_reset / 60
            ));
        }
        Ok(())
    }

    /// 当前使用情况
    pub fn usage(&self) -> QuotaUsage {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.roll(now);
        state.usage(now)
    }

    /// 更新上限（任务配置修改后）
    pub fn set_limits(&self, hourly_limit: Option<u32>, daily_limit: Option<u32>) {
        let mut state = self.state.lock();
        if let Some(limit) = hourly_limit {
            state.hourly_limit = limit;
        }
        if let Some(limit) = daily_limit {
            state.daily_limit = limit;
        }
    }

    pub fn limits(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.hourly_limit, state.daily_limit)
    }

    /// 清空计数
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.hourly_calls = 0;
        state.daily_calls = 0;
        state.hour_start = now;
        state.day_start = now;
        state.warned_hourly = None;
        state.warned_daily = None;
    }

    /// 检查使用率并产生分级提醒
    ///
    /// 每个级别在每个窗口内只提醒一次；达到 100% 时无论是否提醒过都返回不可继续
    pub fn check_and_warn(&self) -> QuotaCheck {
        self.check_and_warn_at(Instant::now())
    }

    pub fn check_and_warn_at(&self, now: Instant) -> QuotaCheck {
        let mut state = self.state.lock();
        state.roll(now);
        let usage = state.usage(now);

        let hourly = escalate(&mut state.warned_hourly, usage.hourly_percent);
        let daily = escalate(&mut state.warned_daily, usage.daily_percent);
        drop(state);

        let can_continue = usage.hourly_percent < 100.0 && usage.daily_percent < 100.0;

        // 取更严重的一个
        let fired = match (hourly, daily) {
            (Some(h), Some(d)) if d > h => Some((d, "每日", usage.daily_percent)),
            (Some(h), _) => Some((h, "每小时", usage.hourly_percent)),
            (None, Some(d)) => Some((d, "每日", usage.daily_percent)),
            (None, None) => None,
        };

        match fired {
            Some((level, window, pct)) => {
                let message = format!("{} ({}: {:.0}%)", level.message(), window, pct);
                match level {
                    WarningLevel::Info => info!("{}", message),
                    _ => warn!("{}", message),
                }
                QuotaCheck {
                    can_continue,
                    message: Some(message),
                    level: Some(level),
                }
            }
            None => QuotaCheck {
                can_continue,
                message: None,
                level: None,
            },
        }
    }

    /// 清除提醒记录
    pub fn reset_warnings(&self) {
        let mut state = self.state.lock();
        state.warned_hourly = None;
        state.warned_daily = None;
    }

    /// 简短状态描述
    pub fn status_message(&self) -> &'static str {
        let usage = self.usage();
        let max = usage.hourly_percent.max(usage.daily_percent);
        match WarningLevel::for_percent(max) {
            Some(WarningLevel::Stop) => "⛔ 已达上限",
            Some(WarningLevel::Critical) => "🔴 危险",
            Some(WarningLevel::Warning) => "🔶 警告",
            Some(WarningLevel::Info) => "⚠️ 偏高",
            None => "✅ 正常",
        }
    }
}

/// 使用率达到新的更高级别时返回该级别并记下
fn escalate(warned: &mut Option<WarningLevel>, percent: f64) -> Option<WarningLevel> {
    let level = WarningLevel::for_percent(percent)?;
    if warned.map_or(true, |w| level > w) {
        *warned = Some(level);
        Some(level)
    } else {
        None
    }
}

/// 按任务划分的配额跟踪器集合
#[derive(Debug, Clone, Default)]
pub struct QuotaBook {
    trackers: Arc<DashMap<String, Arc<QuotaTracker>>>,
}

impl QuotaBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取任务的跟踪器，不存在则创建；上限变化时同步更新
    pub fn tracker_for(&self, key: &str, hourly_limit: u32, daily_limit: u32) -> Arc<QuotaTracker> {
        let tracker = self
            .trackers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(QuotaTracker::new(hourly_limit, daily_limit)))
            .clone();

        if tracker.limits() != (hourly_limit, daily_limit) {
            tracker.set_limits(Some(hourly_limit), Some(daily_limit));
        }
        tracker
    }

    pub fn get(&self, key: &str) -> Option<Arc<QuotaTracker>> {
        self.trackers.get(key).map(|t| t.clone())
    }

    /// 任务删除时移除
    pub fn remove(&self, key: &str) {
        self.trackers.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_make_request_respects_both_caps() {
        let tracker = QuotaTracker::new(4, 6);
        assert!(tracker.can_make_request(4).is_ok());
        assert!(tracker.can_make_request(5).is_err());

        tracker.record_call(2);
        tracker.record_call(2);
        let err = tracker.can_make_request(1).unwrap_err();
        assert!(err.contains("每小时"), "{}", err);

        let usage = tracker.usage();
        assert_eq!(usage.hourly_calls, 4);
        assert_eq!(usage.hourly_remaining, 0);
        assert_eq!(usage.daily_remaining, 2);
    }

    #[test]
    fn test_daily_cap_checked_first() {
        let tracker = QuotaTracker::new(100, 2);
        tracker.record_call(2);
        let err = tracker.can_make_request(1).unwrap_err();
        assert!(err.contains("每日"), "{}", err);
    }

    #[test]
    fn test_windows_roll_over() {
        let tracker = QuotaTracker::new(2, 100);
        let start = Instant::now();
        tracker.record_call_at(2, start);
        assert!(tracker.can_make_request_at(1, start).is_err());

        let later = start + HOUR + Duration::from_secs(1);
        assert!(tracker.can_make_request_at(1, later).is_ok());
        // 日计数不受小时窗口影响
        assert_eq!(tracker.usage().daily_calls, 2);
    }

    #[test]
    fn test_graduated_warnings_fire_once() {
        let tracker = QuotaTracker::new(20, 1000);
        let now = Instant::now();

        tracker.record_call_at(14, now);
        let check = tracker.check_and_warn_at(now);
        assert!(check.can_continue);
        assert_eq!(check.level, Some(WarningLevel::Info));

        // 同级别不重复提醒
        let check = tracker.check_and_warn_at(now);
        assert_eq!(check.level, None);
        assert!(check.message.is_none());

        tracker.record_call_at(3, now); // 85%
        assert_eq!(tracker.check_and_warn_at(now).level, Some(WarningLevel::Warning));

        tracker.record_call_at(2, now); // 95%
        assert_eq!(tracker.check_and_warn_at(now).level, Some(WarningLevel::Critical));

        tracker.record_call_at(1, now); // 100%
        let check = tracker.check_and_warn_at(now);
        assert!(!check.can_continue);
        assert_eq!(check.level, Some(WarningLevel::Stop));

        // 已提醒过，但仍然不可继续
        let check = tracker.check_and_warn_at(now);
        assert!(!check.can_continue);
        assert!(check.message.is_none());
    }

    #[test]
    fn test_jump_straight_to_stop() {
        let tracker = QuotaTracker::new(2, 1000);
        tracker.record_call(2);
        let check = tracker.check_and_warn();
        assert!(!check.can_continue);
        assert_eq!(check.level, Some(WarningLevel::Stop));
        assert_eq!(tracker.status_message(), "⛔ 已达上限");

        tracker.reset_warnings();
        assert_eq!(tracker.check_and_warn().level, Some(WarningLevel::Stop));

        tracker.reset();
        assert_eq!(tracker.status_message(), "✅ 正常");
    }

    #[test]
    fn test_quota_book_reuses_and_updates_trackers() {
        let book = QuotaBook::new();
        let a = book.tracker_for("page:::app", 20, 200);
        a.record_call(3);

        let b = book.tracker_for("page:::app", 10, 100);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.limits(), (10, 100));
        assert_eq!(b.usage().hourly_calls, 3);

        book.remove("page:::app");
        assert!(book.get("page:::app").is_none());
    }
}
