// 快拍处理流程
//
// 每次运行从游标处取一批文件依次上传：
// - 批次前、每一项前检查调用配额，配额不足按限流推迟
// - 两项之间插入随机防封延迟（可中断）

use super::context::EngineContext;
use super::status::{StatusKind, StatusLevel};
use super::validate::{validate_media, Validation};
use super::worker::{defer_job, emit_failure, progress_reporter, JobRunReport};
use crate::governor::WarningLevel;
use crate::job::{is_image, story_batch, Job, MediaScanner, StorySettings, UploadPermit};
use crate::uploader::{sleep_cancellable, ContentEndpoint, TransferOutcome, UploadRequest};
use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn quota_level(level: Option<WarningLevel>) -> StatusLevel {
    match level {
        Some(WarningLevel::Info) | None => StatusLevel::Info,
        Some(WarningLevel::Warning) => StatusLevel::Warning,
        Some(WarningLevel::Critical) | Some(WarningLevel::Stop) => StatusLevel::Error,
    }
}

/// 批次结束后的游标
///
/// 被移走的文件不再占位，后面的文件顺移上来；
/// `archived_before` 是回绕后移走的、原下标小于 `start` 的项数
fn cursor_after_batch(
    len: usize,
    start: usize,
    attempted: usize,
    archived: usize,
    archived_before: usize,
) -> usize {
    let remaining = len - archived;
    if remaining == 0 {
        return 0;
    }
    (start + attempted - archived_before - archived) % remaining
}

pub(crate) async fn process(
    ctx: &EngineContext,
    job: &Arc<Job>,
    settings: &StorySettings,
    permit: &UploadPermit,
    cancel: &CancellationToken,
) -> Result<JobRunReport> {
    let Some(token) = job.access_token() else {
        return Ok(JobRunReport::skipped());
    };

    let files = MediaScanner::new(job.folder(), job.job_type(), job.sort_by())
        .scan_async()
        .await?;
    if files.is_empty() {
        ctx.status.emit(
            job,
            StatusKind::Skipped,
            StatusLevel::Info,
            format!("文件夹中没有可上传的快拍: {}", job.folder().display()),
        );
        return Ok(JobRunReport::idle());
    }

    let tracker = ctx.quotas.tracker_for(
        job.key().as_str(),
        settings.hourly_limit,
        settings.daily_limit,
    );
    let check = tracker.check_and_warn();
    if let Some(message) = &check.message {
        ctx.status
            .emit(job, StatusKind::Quota, quota_level(check.level), message.clone());
    }
    if !check.can_continue {
        defer_job(ctx, job, "API 调用配额已用尽");
        return Ok(JobRunReport {
            rate_limited: true,
            ..Default::default()
        });
    }

    let start = job.next_index() % files.len();
    let batch = story_batch(&files, start, settings.stories_per_schedule as usize);
    let calls_per_story = ctx.config.quota.calls_per_story;
    let slice = Duration::from_millis(ctx.config.retry.sleep_slice_ms.max(1));
    let driver = ctx.retry_driver();

    ctx.status.emit(
        job,
        StatusKind::Started,
        StatusLevel::Info,
        format!("📸 开始上传快拍批次: {} 个文件", batch.len()),
    );

    let mut run = JobRunReport::default();
    // 实际处理过的项数与其中被移走的项数，决定游标位置
    let mut attempted = 0usize;
    let mut archived = 0usize;
    // 回绕到列表开头后被移走的项，它们排在 start 之前
    let mut archived_before = 0usize;

    for (position, file) in batch.iter().enumerate() {
        if cancel.is_cancelled() {
            run.cancelled = true;
            break;
        }
        if let Err(reason) = tracker.can_make_request(calls_per_story) {
            ctx.status
                .emit(job, StatusKind::Quota, StatusLevel::Warning, reason);
            defer_job(ctx, job, "API 调用配额不足");
            run.rate_limited = true;
            break;
        }

        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        match validate_media(
            job.job_type(),
            file,
            ctx.media_probe.as_ref(),
            ctx.config.scheduler.validate_before_upload,
        )
        .await
        {
            Validation::Rejected(reason) => {
                ctx.status.emit(
                    job,
                    StatusKind::Rejected,
                    StatusLevel::Warning,
                    format!("⚠️ 跳过文件 {}: {}", file_name, reason),
                );
                run.rejected += 1;
                attempted += 1;
                continue;
            }
            Validation::Accepted {
                warning: Some(warning),
            } => ctx
                .status
                .emit(job, StatusKind::Hint, StatusLevel::Warning, warning),
            Validation::Accepted { warning: None } => {}
        }

        let endpoint = if is_image(file) {
            ContentEndpoint::StoryPhoto
        } else {
            ContentEndpoint::StoryVideo
        };
        let request = UploadRequest::new(endpoint, job.page_id(), file.clone(), token);
        ctx.status.emit(
            job,
            StatusKind::Started,
            StatusLevel::Info,
            format!("⬆️ [{}/{}] 上传快拍: {}", position + 1, batch.len(), file_name),
        );

        let progress = progress_reporter(ctx, job);
        let report = driver.run(&request, &progress, cancel).await;
        if report.calls > 0 {
            tracker.record_call(calls_per_story);
        }

        match report.result.outcome {
            TransferOutcome::Success => {
                run.uploaded += 1;
                attempted += 1;
                ctx.status.emit(
                    job,
                    StatusKind::Uploaded,
                    StatusLevel::Success,
                    format!("✅ 快拍上传成功: {}", file_name),
                );
                if ctx.config.scheduler.auto_move_uploaded {
                    match ctx.archiver.archive(file).await {
                        Ok(_) => {
                            archived += 1;
                            if start + position >= files.len() {
                                archived_before += 1;
                            }
                        }
                        Err(e) => ctx.status.emit(
                            job,
                            StatusKind::Error,
                            StatusLevel::Warning,
                            format!("移动已上传文件失败: {:#}", e),
                        ),
                    }
                }
            }
            TransferOutcome::RateLimited => {
                defer_job(ctx, job, "触发平台限流");
                run.rate_limited = true;
                break;
            }
            TransferOutcome::Cancelled => {
                run.cancelled = true;
                break;
            }
            TransferOutcome::TransientFailure | TransferOutcome::PermanentFailure => {
                run.failed += 1;
                attempted += 1;
                emit_failure(ctx, job, &file_name, &report.result);
            }
        }

        let has_more = position + 1 < batch.len();
        if has_more && settings.anti_ban_enabled {
            let delay = rand::thread_rng()
                .gen_range(settings.random_delay_min..=settings.random_delay_max);
            ctx.status.emit(
                job,
                StatusKind::Progress,
                StatusLevel::Info,
                format!("⏱️ 防封延迟 {} 秒", delay),
            );
            if !sleep_cancellable(Duration::from_secs(delay), slice, cancel).await {
                run.cancelled = true;
                break;
            }
        }
    }

    let next = cursor_after_batch(files.len(), start, attempted, archived, archived_before);
    job.set_next_index(permit, next);
    debug!("[{}] 快拍游标: {} -> {}", job.key(), start, next);

    if run.cancelled {
        ctx.status.emit(
            job,
            StatusKind::Cancelled,
            StatusLevel::Info,
            "快拍批次已取消",
        );
    }
    ctx.status.emit(
        job,
        StatusKind::Summary,
        StatusLevel::Info,
        format!(
            "快拍批次结束: 成功 {}, 失败 {}, 跳过 {}",
            run.uploaded, run.failed, run.rejected
        ),
    );
    Ok(run)
}
