// 工作单元：一次任务运行的公共部分
//
// 上传锁、取消令牌由调度循环准备好后交给这里；
// 这里按任务类型分派到视频 / 快拍处理流程

use super::context::EngineContext;
use super::status::{ProgressThrottler, SchedulerStats, StatusKind, StatusLevel};
use super::{story, video};
use crate::job::{Job, JobKind, UploadPermit};
use crate::uploader::{ProgressReporter, TransferResult};
use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 一次运行的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunReport {
    pub uploaded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub rate_limited: bool,
    pub cancelled: bool,
    /// 缺少令牌等原因整次跳过
    pub skipped: bool,
    /// 文件夹中没有可上传的文件
    pub idle: bool,
}

impl JobRunReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub(crate) fn idle() -> Self {
        Self {
            idle: true,
            ..Default::default()
        }
    }

    /// 计入调度统计；限流不计入失败
    pub fn apply_to(&self, stats: &SchedulerStats) {
        stats.record_succeeded(self.uploaded);
        stats.record_failed(self.failed);
        stats.record_rejected(self.rejected);
        if self.rate_limited {
            stats.record_rate_limited();
        }
        if self.cancelled {
            stats.record_cancelled();
        }
    }
}

/// 执行一次任务运行
pub async fn run_job(
    ctx: &EngineContext,
    job: &Arc<Job>,
    permit: &UploadPermit,
    cancel: &CancellationToken,
) -> Result<JobRunReport> {
    if job.access_token().is_none() {
        ctx.status.emit(
            job,
            StatusKind::Error,
            StatusLevel::Error,
            "缺少主页访问令牌，跳过本次上传",
        );
        return Ok(JobRunReport::skipped());
    }

    match job.kind() {
        JobKind::Video(settings) | JobKind::Reels(settings) => {
            video::process(ctx, job, settings, permit, cancel).await
        }
        JobKind::Story(settings) => {
            let settings = settings.clone().normalized();
            story::process(ctx, job, &settings, permit, cancel).await
        }
    }
}

/// 进度回调：节流后推送到状态通道
pub(crate) fn progress_reporter(ctx: &EngineContext, job: &Arc<Job>) -> ProgressReporter {
    let status = ctx.status.clone();
    let job = job.clone();
    let throttler = ProgressThrottler::default();
    ProgressReporter::new(Arc::new(move |percent| {
        if throttler.should_emit(percent) {
            status.progress(&job, percent);
        }
    }))
}

/// 失败时附加的权限提示
pub fn permission_hint(result: &TransferResult) -> Option<&'static str> {
    let code = result.error_code();
    let message = result
        .error
        .as_ref()
        .map(|e| e.message.to_lowercase())
        .unwrap_or_default();

    if code == Some(190) {
        return Some("💡 访问令牌已过期或无效，请重新授权该主页");
    }
    if matches!(code, Some(10) | Some(200)) || message.contains("permission") {
        return Some("💡 令牌缺少发布权限，请确认已授予 pages_manage_posts 和 publish_video");
    }
    match result.status {
        Some(400) | Some(403) => Some("💡 请求被拒绝，请检查令牌是否有效以及主页权限"),
        _ => None,
    }
}

/// 失败状态行 + 可选提示
pub(crate) fn emit_failure(ctx: &EngineContext, job: &Job, file_name: &str, result: &TransferResult) {
    ctx.status.emit(
        job,
        StatusKind::Failed,
        StatusLevel::Error,
        format!("❌ 上传失败: {} - {}", file_name, result.describe()),
    );
    if let Some(hint) = permission_hint(result) {
        ctx.status.emit(job, StatusKind::Hint, StatusLevel::Warning, hint);
    }
}

/// 限流推迟并发出状态行
pub(crate) fn defer_job(ctx: &EngineContext, job: &Job, reason: &str) -> DateTime<Utc> {
    let scheduler = &ctx.config.scheduler;
    let at = job.defer_after_rate_limit(
        Utc::now(),
        scheduler.rate_limit_defer_min_secs,
        scheduler.rate_limit_defer_max_secs,
    );
    ctx.status.emit(
        job,
        StatusKind::Deferred,
        StatusLevel::Warning,
        format!(
            "⏳ {}，推迟到 {}",
            reason,
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
    );
    at
}
