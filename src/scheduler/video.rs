// 视频 / Reels 处理流程
//
// 每次运行上传游标处的一个文件

use super::context::EngineContext;
use super::status::{StatusKind, StatusLevel};
use super::validate::{validate_media, Validation};
use super::worker::{defer_job, emit_failure, progress_reporter, JobRunReport};
use crate::job::{pick_next, render_metadata, Job, JobType, MediaScanner, UploadPermit, VideoSettings};
use crate::uploader::{ContentEndpoint, TransferOutcome, UploadRequest};
use anyhow::Result;
use chrono::Local;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn process(
    ctx: &EngineContext,
    job: &Arc<Job>,
    settings: &VideoSettings,
    permit: &UploadPermit,
    cancel: &CancellationToken,
) -> Result<JobRunReport> {
    let Some(token) = job.access_token() else {
        return Ok(JobRunReport::skipped());
    };

    let files = MediaScanner::new(job.folder(), job.job_type(), job.sort_by())
        .scan_async()
        .await?;
    let Some((index, file)) = pick_next(&files, job.next_index()) else {
        ctx.status.emit(
            job,
            StatusKind::Skipped,
            StatusLevel::Info,
            format!("文件夹中没有可上传的{}: {}", job.job_type().label(), job.folder().display()),
        );
        return Ok(JobRunReport::idle());
    };
    let file = file.clone();
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let next_cursor = (index + 1) % files.len();
    debug!("[{}] 选中第 {}/{} 个文件: {}", job.key(), index + 1, files.len(), file_name);

    match validate_media(
        job.job_type(),
        &file,
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
            job.set_next_index(permit, next_cursor);
            return Ok(JobRunReport {
                rejected: 1,
                ..Default::default()
            });
        }
        Validation::Accepted {
            warning: Some(warning),
        } => ctx
            .status
            .emit(job, StatusKind::Hint, StatusLevel::Warning, warning),
        Validation::Accepted { warning: None } => {}
    }

    let endpoint = match job.job_type() {
        JobType::Reels => ContentEndpoint::Reels,
        _ => ContentEndpoint::Video,
    };
    let (title, description) = render_metadata(settings, &file, Local::now());
    let request = UploadRequest::new(endpoint, job.page_id(), file.clone(), token)
        .with_title(title)
        .with_description(description)
        .with_chunk_size(Some(settings.chunk_size));

    ctx.status.emit(
        job,
        StatusKind::Started,
        StatusLevel::Info,
        format!("⬆️ 开始上传{}: {}", job.job_type().label(), file_name),
    );

    let progress = progress_reporter(ctx, job);
    let report = ctx.retry_driver().run(&request, &progress, cancel).await;
    let result = report.result;

    let mut run = JobRunReport::default();
    match result.outcome {
        TransferOutcome::Success => {
            run.uploaded = 1;
            let id = result.content_id.as_deref().unwrap_or("-");
            ctx.status.emit(
                job,
                StatusKind::Uploaded,
                StatusLevel::Success,
                format!("✅ 上传成功: {} (ID: {})", file_name, id),
            );

            // 归档成功后后面的文件顺移到当前下标，游标不动
            if ctx.config.scheduler.auto_move_uploaded {
                match ctx.archiver.archive(&file).await {
                    Ok(_) => job.set_next_index(permit, index),
                    Err(e) => {
                        ctx.status.emit(
                            job,
                            StatusKind::Error,
                            StatusLevel::Warning,
                            format!("移动已上传文件失败: {:#}", e),
                        );
                        job.set_next_index(permit, next_cursor);
                    }
                }
            } else {
                job.set_next_index(permit, next_cursor);
            }
        }
        TransferOutcome::RateLimited => {
            run.rate_limited = true;
            defer_job(ctx, job, "触发平台限流");
        }
        TransferOutcome::Cancelled => {
            run.cancelled = true;
            ctx.status.emit(
                job,
                StatusKind::Cancelled,
                StatusLevel::Info,
                format!("上传已取消: {}", file_name),
            );
        }
        TransferOutcome::TransientFailure | TransferOutcome::PermanentFailure => {
            run.failed = 1;
            emit_failure(ctx, job, &file_name, &result);
            job.set_next_index(permit, next_cursor);
        }
    }

    debug!(
        "[{}] 本次运行结束: 尝试 {} 次, 调用 {} 次, 退避 {} 次",
        job.key(),
        report.attempts,
        report.calls,
        report.backoff_sleeps
    );
    Ok(run)
}
