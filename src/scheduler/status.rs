//! 状态事件与调度统计
//!
//! - `StatusEvent`：面向界面的可读状态行，经由可选的 mpsc 通道发出
//! - `ProgressThrottler`：进度事件节流
//! - `SchedulerStats`：每个调度循环一份的计数器

use crate::job::{Job, JobType};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 状态级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// 状态类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Started,
    Progress,
    Uploaded,
    Failed,
    Deferred,
    Cancelled,
    Skipped,
    Rejected,
    Quota,
    Hint,
    Summary,
    Error,
}

/// 一条状态事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_key: String,
    pub page_name: String,
    pub job_type: JobType,
    pub kind: StatusKind,
    pub level: StatusLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// 毫秒时间戳
    pub at: i64,
}

/// 状态事件出口
///
/// 每条事件同时写入 tracing 日志；配置了通道时再推送给界面
#[derive(Debug, Clone, Default)]
pub struct StatusSink {
    tx: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl StatusSink {
    pub fn new(tx: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, job: &Job, kind: StatusKind, level: StatusLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            StatusLevel::Info | StatusLevel::Success => {
                info!("[{}] {}", job.display_name(), message)
            }
            StatusLevel::Warning => warn!("[{}] {}", job.display_name(), message),
            StatusLevel::Error => error!("[{}] {}", job.display_name(), message),
        }
        self.send(job, kind, level, message, None);
    }

    /// 进度事件只写 debug 日志
    pub fn progress(&self, job: &Job, percent: f64) {
        debug!("[{}] 上传进度 {:.1}%", job.display_name(), percent);
        self.send(
            job,
            StatusKind::Progress,
            StatusLevel::Info,
            format!("{:.0}%", percent),
            Some(percent),
        );
    }

    fn send(
        &self,
        job: &Job,
        kind: StatusKind,
        level: StatusLevel,
        message: String,
        progress: Option<f64>,
    ) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = StatusEvent {
            job_key: job.key().to_string(),
            page_name: job.display_name().to_string(),
            job_type: job.job_type(),
            kind,
            level,
            message,
            progress,
            at: chrono::Utc::now().timestamp_millis(),
        };
        // 接收端关闭不影响上传
        let _ = tx.send(event);
    }
}

/// 默认进度节流间隔（毫秒）
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;

/// 进度事件节流器
///
/// 距上次放行超过间隔才放行；100% 总是放行
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn should_emit(&self, percent: f64) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);
        if percent < 100.0 && last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS))
    }
}

/// 调度循环统计
#[derive(Debug, Default)]
pub struct SchedulerStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    cancelled: AtomicU64,
    skipped_busy: AtomicU64,
    validation_rejected: AtomicU64,
    errors: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub cancelled: u64,
    pub skipped_busy: u64,
    pub validation_rejected: u64,
    pub errors: u64,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_succeeded(&self, count: u64) {
        self.succeeded.fetch_add(count, Ordering::SeqCst);
    }

    pub fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::SeqCst);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_skipped_busy(&self) {
        self.skipped_busy.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rejected(&self, count: u64) {
        self.validation_rejected.fetch_add(count, Ordering::SeqCst);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            rate_limited: self.rate_limited.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            skipped_busy: self.skipped_busy.load(Ordering::SeqCst),
            validation_rejected: self.validation_rejected.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }
}
