// 调度循环
//
// 每种内容类型一个实例。每个周期：
// 1. 取注册表快照
// 2. 到期任务先推进 next_run_at 再派发，保证同一到期时刻只派发一次
// 3. 工作单元受信号量限制并发；上传锁被占用时直接跳过

use super::context::EngineContext;
use super::status::{SchedulerStats, StatsSnapshot, StatusKind, StatusLevel};
use super::worker::run_job;
use crate::job::{Job, JobType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 调度循环共享状态
struct LoopShared {
    job_type: JobType,
    ctx: EngineContext,
    /// 工作单元并发限制
    slots: Arc<Semaphore>,
    stats: Arc<SchedulerStats>,
    /// 停止信号，也是所有运行令牌的父令牌
    shutdown: CancellationToken,
}

impl LoopShared {
    fn tick(self: &Arc<Self>, workers: &mut JoinSet<()>, now: DateTime<Utc>) -> usize {
        let mut dispatched = 0;
        for job in self.ctx.registry.snapshot(self.job_type) {
            if !job.advance_schedule(self.ctx.templates.as_ref(), now) {
                continue;
            }
            debug!(
                "[{}] 任务到期，派发工作单元，下次运行 {}",
                job.key(),
                job.next_run_at()
            );
            self.stats.record_dispatched();
            dispatched += 1;

            let shared = self.clone();
            workers.spawn(async move { shared.run_worker(job).await });
        }
        dispatched
    }

    async fn run_worker(&self, job: Arc<Job>) {
        let _slot = tokio::select! {
            slot = self.slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => return,
            },
            _ = self.shutdown.cancelled() => return,
        };

        let Some(permit) = job.try_acquire_upload() else {
            self.stats.record_skipped_busy();
            self.ctx.status.emit(
                &job,
                StatusKind::Skipped,
                StatusLevel::Warning,
                "上一次上传仍在进行，跳过本次调度",
            );
            return;
        };

        let run_id = Uuid::new_v4();
        debug!("[{}] 开始运行 run_id={}", job.key(), run_id);
        let run = job.begin_run(&permit, &self.shutdown);

        match run_job(&self.ctx, &job, &permit, run.token()).await {
            Ok(report) => {
                debug!("[{}] 运行结束 run_id={}: {:?}", job.key(), run_id, report);
                report.apply_to(&self.stats);
            }
            Err(e) => {
                self.stats.record_error();
                error!(
                    "任务运行异常: job={}, folder={:?}, run_id={}, 错误: {:#}",
                    job.key(),
                    job.folder(),
                    run_id,
                    e
                );
                self.ctx.status.emit(
                    &job,
                    StatusKind::Error,
                    StatusLevel::Error,
                    format!("运行出错: {}", e),
                );
            }
        }
    }

    fn reap(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            self.stats.record_error();
            if e.is_panic() {
                error!("{}调度工作单元 panic: {}", self.job_type.label(), e);
            } else {
                debug!("{}调度工作单元被取消: {}", self.job_type.label(), e);
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let period = self.ctx.config.scheduler.tick_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut workers = JoinSet::new();

        info!("🚀 {}调度循环已启动 (周期 {:?})", self.job_type.label(), period);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let count = self.tick(&mut workers, Utc::now());
                    if count > 0 {
                        debug!("{}调度: 本轮派发 {} 个任务", self.job_type.label(), count);
                    }
                }
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    self.reap(result);
                }
            }
        }

        // 运行令牌都是 shutdown 的子令牌，进行中的上传会尽快退出
        while let Some(result) = workers.join_next().await {
            self.reap(result);
        }
        info!("{}调度循环已停止", self.job_type.label());
    }
}

/// 单一内容类型的调度循环
pub struct SchedulerLoop {
    shared: Arc<LoopShared>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerLoop {
    pub fn new(job_type: JobType, ctx: EngineContext) -> Self {
        let scheduler = &ctx.config.scheduler;
        let max_concurrent = match job_type {
            JobType::Video => scheduler.max_concurrent_video,
            JobType::Story => scheduler.max_concurrent_story,
            JobType::Reels => scheduler.max_concurrent_reels,
        }
        .max(1);

        Self {
            shared: Arc::new(LoopShared {
                job_type,
                slots: Arc::new(Semaphore::new(max_concurrent)),
                stats: Arc::new(SchedulerStats::new()),
                shutdown: CancellationToken::new(),
                ctx,
            }),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.shared.job_type
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// 执行一轮调度（不等待工作单元结束）
    ///
    /// # 返回
    /// 本轮派发的任务数
    pub fn tick(&self, workers: &mut JoinSet<()>, now: DateTime<Utc>) -> usize {
        self.shared.tick(workers, now)
    }

    /// 启动后台循环；重复调用无效
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("{}调度循环已在运行", self.shared.job_type.label());
            return;
        }
        let shared = self.shared.clone();
        *self.handle.lock() = Some(tokio::spawn(shared.run()));
    }

    /// 停止循环并等待进行中的工作单元退出
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("{}调度循环异常退出: {}", self.shared.job_type.label(), e);
            }
        }
    }
}

impl Drop for SchedulerLoop {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::graph::mock::ScriptedTransport;
    use crate::graph::{GraphRequest, GraphResponse, TransportError};
    use crate::job::{JobKind, JobRegistry, StorySettings, VideoSettings, MAX_INTERVAL_SECS};
    use crate::scheduler::collaborators::NoMediaProbe;
    use crate::uploader::AlwaysOnline;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    const MB: u64 = 1024 * 1024;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.scheduler.tick_interval_ms = 10;
        config.scheduler.check_connectivity = false;
        config.retry.backoff_step_secs = 0;
        config.retry.sleep_slice_ms = 1;
        config
    }

    fn sized_file(dir: &Path, name: &str, size: u64) -> PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().set_len(size).unwrap();
        path
    }

    fn ok_response(request: &GraphRequest) -> GraphResponse {
        match request.field_value("upload_phase") {
            Some("start") => GraphResponse::new(
                200,
                json!({
                    "upload_session_id": "s1",
                    "video_id": "v1",
                    "upload_url": "https://rupload.example/v1",
                    "start_offset": "0",
                    "end_offset": (32 * MB).to_string(),
                }),
            ),
            Some("transfer") => GraphResponse::new(
                200,
                json!({"start_offset": (32 * MB).to_string(), "end_offset": (64 * MB).to_string()}),
            ),
            _ => GraphResponse::new(200, json!({"id": "c1", "success": true})),
        }
    }

    fn ok_transport() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::from_fn(|req, _| Ok(ok_response(req))))
    }

    fn engine(config: AppConfig, transport: Arc<ScriptedTransport>) -> EngineContext {
        EngineContext::new(Arc::new(config), Arc::new(JobRegistry::new()), transport)
            .with_connectivity(Arc::new(AlwaysOnline))
            .with_media_probe(Arc::new(NoMediaProbe))
    }

    fn due_job(kind: JobKind, folder: &Path) -> Job {
        Job::builder(kind, "page-1", folder)
            .page_name("Test Page")
            .access_token(Some("tok".into()))
            .scheduled(true)
            .next_run_at(Utc::now() - ChronoDuration::seconds(1))
            .build()
    }

    async fn drain(workers: &mut JoinSet<()>) {
        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }
    }

    #[tokio::test]
    async fn test_tick_dispatches_once_and_advances() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);
        sized_file(dir.path(), "b.mp4", 1024);

        let transport = ok_transport();
        let ctx = engine(test_config(), transport.clone());
        let job = ctx
            .registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let now = Utc::now();
        let mut workers = JoinSet::new();
        assert_eq!(scheduler.tick(&mut workers, now), 1);
        assert!(job.next_run_at() > now);
        assert_eq!(scheduler.tick(&mut workers, now), 0);
        drain(&mut workers).await;

        let stats = scheduler.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(job.next_index(), 1);
        assert_eq!(transport.requests().len(), 1);
        assert!(!job.is_running());
    }

    #[tokio::test]
    async fn test_disable_mid_transfer_cancels_within_bound() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "big.mp4", 80 * MB);

        let transport = Arc::new(
            ScriptedTransport::from_fn(|req, _| Ok(ok_response(req)))
                .with_delay(Duration::from_millis(300)),
        );
        let ctx = engine(test_config(), transport.clone());
        let job = ctx
            .registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let mut workers = JoinSet::new();
        assert_eq!(scheduler.tick(&mut workers, Utc::now()), 1);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(job.is_running());

        let requested_at = Instant::now();
        job.disable();
        drain(&mut workers).await;
        assert!(requested_at.elapsed() < Duration::from_secs(2));

        let stats = scheduler.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(job.next_index(), 0);
        assert!(!job.is_running());
        assert!(job.try_acquire_upload().is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_defers_without_failure() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);

        let transport = Arc::new(ScriptedTransport::from_fn(|_, _| {
            Ok(GraphResponse::new(
                400,
                json!({"error": {"message": "Application request limit reached", "code": 4}}),
            ))
        }));
        let mut config = test_config();
        config.retry.max_rate_limit_waits = 0;
        let ctx = engine(config, transport.clone());
        let job = ctx
            .registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let now = Utc::now();
        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, now);
        drain(&mut workers).await;

        let next = job.next_run_at();
        assert!(next >= now + ChronoDuration::minutes(30));
        assert!(next <= Utc::now() + ChronoDuration::minutes(60));
        let stats = scheduler.stats();
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(job.next_index(), 0);
        assert_eq!(transport.requests().len(), 1);
        assert!(job.is_scheduled());
    }

    #[tokio::test]
    async fn test_rejected_file_advances_cursor_without_network() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a_empty.mp4", 0);
        sized_file(dir.path(), "b.mp4", 1024);

        let transport = ok_transport();
        let ctx = engine(test_config(), transport.clone());
        let job = ctx
            .registry
            .insert(due_job(JobKind::Reels(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Reels, ctx);

        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, Utc::now());
        drain(&mut workers).await;

        assert_eq!(scheduler.stats().validation_rejected, 1);
        assert_eq!(job.next_index(), 1);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_job_scheduled() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);
        sized_file(dir.path(), "b.mp4", 1024);

        let transport = Arc::new(ScriptedTransport::from_fn(|_, _| {
            Ok(GraphResponse::new(
                400,
                json!({"error": {"message": "Error validating access token", "code": 190}}),
            ))
        }));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = engine(test_config(), transport.clone())
            .with_status(crate::scheduler::status::StatusSink::new(tx));
        let job = ctx
            .registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, Utc::now());
        drain(&mut workers).await;

        assert_eq!(scheduler.stats().failed, 1);
        assert_eq!(transport.requests().len(), 1);
        assert!(job.is_scheduled());
        assert_eq!(job.next_index(), 1);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&StatusKind::Failed));
        assert!(kinds.contains(&StatusKind::Hint));
    }

    #[tokio::test]
    async fn test_auto_move_keeps_cursor() {
        let dir = tempdir().unwrap();
        let first = sized_file(dir.path(), "a.mp4", 1024);
        sized_file(dir.path(), "b.mp4", 1024);

        let mut config = test_config();
        config.scheduler.auto_move_uploaded = true;
        let ctx = engine(config, ok_transport());
        let job = ctx
            .registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, Utc::now());
        drain(&mut workers).await;

        assert!(!first.exists());
        assert!(dir.path().join("Uploaded").join("a.mp4").exists());
        assert_eq!(job.next_index(), 0);
    }

    #[tokio::test]
    async fn test_missing_token_skips() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);

        let transport = ok_transport();
        let ctx = engine(test_config(), transport.clone());
        let job = ctx.registry.insert(
            Job::builder(JobKind::Video(VideoSettings::default()), "page-1", dir.path())
                .scheduled(true)
                .next_run_at(Utc::now() - ChronoDuration::seconds(1))
                .build(),
        );
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, Utc::now());
        drain(&mut workers).await;

        assert!(transport.requests().is_empty());
        assert_eq!(job.next_index(), 0);
        assert_eq!(scheduler.stats().succeeded, 0);
    }

    #[tokio::test]
    async fn test_busy_job_is_skipped() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);

        let transport = ok_transport();
        let ctx = engine(test_config(), transport.clone());
        let job = ctx
            .registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let held = job.try_acquire_upload().unwrap();
        let mut workers = JoinSet::new();
        assert_eq!(scheduler.tick(&mut workers, Utc::now()), 1);
        drain(&mut workers).await;
        drop(held);

        assert_eq!(scheduler.stats().skipped_busy, 1);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_story_batch_stops_at_quota() {
        let dir = tempdir().unwrap();
        for name in ["1.jpg", "2.jpg", "3.jpg"] {
            sized_file(dir.path(), name, 1024);
        }

        let transport = ok_transport();
        let ctx = engine(test_config(), transport.clone());
        let settings = StorySettings {
            stories_per_schedule: 3,
            anti_ban_enabled: false,
            hourly_limit: 4,
            ..Default::default()
        };
        let job = ctx.registry.insert(due_job(JobKind::Story(settings), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Story, ctx);

        let now = Utc::now();
        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, now);
        drain(&mut workers).await;

        let stats = scheduler.stats();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(job.next_index(), 2);
        assert!(job.next_run_at() >= now + ChronoDuration::minutes(30));
        // 图片快拍：/photos + /photo_stories
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_story_wrapped_batch_with_auto_move_keeps_next_file() {
        let dir = tempdir().unwrap();
        for name in ["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"] {
            sized_file(dir.path(), name, 1024);
        }

        let mut config = test_config();
        config.scheduler.auto_move_uploaded = true;
        let ctx = engine(config, ok_transport());
        let settings = StorySettings {
            stories_per_schedule: 3,
            anti_ban_enabled: false,
            ..Default::default()
        };
        let job = ctx.registry.insert(
            Job::builder(JobKind::Story(settings), "page-1", dir.path())
                .access_token(Some("tok".into()))
                .scheduled(true)
                .next_run_at(Utc::now() - ChronoDuration::seconds(1))
                .next_index(3)
                .build(),
        );
        let scheduler = SchedulerLoop::new(JobType::Story, ctx);

        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, Utc::now());
        drain(&mut workers).await;

        assert_eq!(scheduler.stats().succeeded, 3);
        for moved in ["4.jpg", "5.jpg", "1.jpg"] {
            assert!(dir.path().join("Uploaded").join(moved).exists(), "{}", moved);
        }
        // 剩下 [2.jpg, 3.jpg]，下一次应从 2.jpg 开始
        assert!(dir.path().join("2.jpg").exists());
        assert!(dir.path().join("3.jpg").exists());
        assert_eq!(job.next_index(), 0);
    }

    #[tokio::test]
    async fn test_huge_interval_does_not_break_tick() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);

        let ctx = engine(test_config(), ok_transport());
        let job = ctx.registry.insert(
            Job::builder(JobKind::Video(VideoSettings::default()), "page-1", dir.path())
                .access_token(Some("tok".into()))
                .interval_seconds(10_000_000_000_000)
                .scheduled(true)
                .next_run_at(Utc::now() - ChronoDuration::seconds(1))
                .build(),
        );
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let now = Utc::now();
        let mut workers = JoinSet::new();
        assert_eq!(scheduler.tick(&mut workers, now), 1);
        drain(&mut workers).await;

        assert_eq!(scheduler.stats().succeeded, 1);
        assert!(job.next_run_at() > now);
        assert!(job.next_run_at() <= now + ChronoDuration::seconds(MAX_INTERVAL_SECS as i64 + 60));
    }

    #[tokio::test]
    async fn test_story_cancel_during_anti_ban_delay() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "1.jpg", 1024);
        sized_file(dir.path(), "2.jpg", 1024);

        let transport = ok_transport();
        let ctx = engine(test_config(), transport.clone());
        let settings = StorySettings {
            stories_per_schedule: 2,
            anti_ban_enabled: true,
            random_delay_min: 5,
            random_delay_max: 15,
            ..Default::default()
        };
        let job = ctx.registry.insert(due_job(JobKind::Story(settings), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Story, ctx);

        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, Utc::now());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let requested_at = Instant::now();
        job.unschedule();
        drain(&mut workers).await;
        assert!(requested_at.elapsed() < Duration::from_secs(2));

        let stats = scheduler.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(job.next_index(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_loop() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);

        let ctx = engine(test_config(), ok_transport());
        ctx.registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);
        scheduler.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.stats().succeeded == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;

        assert_eq!(scheduler.stats().succeeded, 1);
        assert_eq!(scheduler.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried_then_fail() {
        let dir = tempdir().unwrap();
        sized_file(dir.path(), "a.mp4", 1024);

        let transport = Arc::new(ScriptedTransport::from_fn(|_, _| {
            Err(TransportError::Connect("refused".into()))
        }));
        let ctx = engine(test_config(), transport.clone());
        ctx.registry
            .insert(due_job(JobKind::Video(VideoSettings::default()), dir.path()));
        let scheduler = SchedulerLoop::new(JobType::Video, ctx);

        let mut workers = JoinSet::new();
        scheduler.tick(&mut workers, Utc::now());
        drain(&mut workers).await;

        assert_eq!(transport.requests().len(), 3);
        assert_eq!(scheduler.stats().failed, 1);
    }
}
