// 任务核心
//
// 状态：Disabled / Idle(已启用未调度) / Waiting(已调度等待) / Running(已调度运行中)
//
// 锁约定：
// - state：轻量状态锁，只在单个访问函数内部短暂持有，绝不跨 await
// - upload_lock：上传锁，整个上传过程持有，只用 try_lock 获取，从不阻塞等待
// - 游标 next_index 只允许持有上传许可的一方写入

use super::model::{clamp_interval, JobKey, JobKind, JobType, ScheduleSettings, SortPolicy};
use super::schedule::{after_secs, compute_next_run, ScheduleTemplates};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 状态迁移错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("任务未启用，无法调度: {0}")]
    NotEnabled(String),
}

/// 对外可见的任务阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Disabled,
    Idle,
    Waiting,
    Running,
}

#[derive(Debug)]
struct JobState {
    enabled: bool,
    is_scheduled: bool,
    cancel_requested: bool,
    next_run_at: DateTime<Utc>,
    /// 当前运行的取消令牌
    active_run: Option<CancellationToken>,
}

/// 可调度的上传任务
#[derive(Debug)]
pub struct Job {
    key: JobKey,
    page_id: String,
    page_name: String,
    app_name: String,
    folder: PathBuf,
    access_token: Option<String>,
    sort_by: SortPolicy,
    schedule: ScheduleSettings,
    kind: JobKind,

    next_index: AtomicUsize,
    running: Arc<AtomicBool>,
    state: Mutex<JobState>,
    upload_lock: Arc<tokio::sync::Mutex<()>>,
}

/// 任务构建器
#[derive(Debug, Clone)]
pub struct JobBuilder {
    kind: JobKind,
    page_id: String,
    page_name: String,
    app_name: String,
    folder: PathBuf,
    access_token: Option<String>,
    sort_by: SortPolicy,
    schedule: ScheduleSettings,
    enabled: bool,
    is_scheduled: bool,
    next_run_at: Option<DateTime<Utc>>,
    next_index: usize,
}

impl JobBuilder {
    pub fn new(kind: JobKind, page_id: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        let interval = kind.job_type().default_interval_secs();
        Self {
            kind,
            page_id: page_id.into(),
            page_name: String::new(),
            app_name: String::new(),
            folder: folder.into(),
            access_token: None,
            sort_by: SortPolicy::Name,
            schedule: ScheduleSettings::with_interval(interval),
            enabled: true,
            is_scheduled: false,
            next_run_at: None,
            next_index: 0,
        }
    }

    pub fn page_name(mut self, name: impl Into<String>) -> Self {
        self.page_name = name.into();
        self
    }

    pub fn app_name(mut self, app: impl Into<String>) -> Self {
        self.app_name = app.into();
        self
    }

    pub fn access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn sort_by(mut self, sort_by: SortPolicy) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn schedule(mut self, schedule: ScheduleSettings) -> Self {
        self.schedule = schedule;
        self.schedule.interval_seconds = clamp_interval(self.schedule.interval_seconds);
        self
    }

    pub fn interval_seconds(mut self, secs: u64) -> Self {
        self.schedule.interval_seconds = clamp_interval(secs);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn scheduled(mut self, scheduled: bool) -> Self {
        self.is_scheduled = scheduled;
        self
    }

    pub fn next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn next_index(mut self, index: usize) -> Self {
        self.next_index = index;
        self
    }

    pub fn build(self) -> Job {
        let key = JobKey::new(&self.page_id, &self.app_name);
        let next_run_at = self.next_run_at.unwrap_or_else(|| {
            after_secs(Utc::now(), self.schedule.interval_seconds)
        });

        Job {
            key,
            page_id: self.page_id,
            page_name: self.page_name,
            app_name: self.app_name,
            folder: self.folder,
            access_token: self.access_token,
            sort_by: self.sort_by,
            schedule: self.schedule,
            kind: self.kind,
            next_index: AtomicUsize::new(self.next_index),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(JobState {
                enabled: self.enabled,
                // 未启用的任务不可能处于调度中
                is_scheduled: self.is_scheduled && self.enabled,
                cancel_requested: false,
                next_run_at,
                active_run: None,
            }),
            upload_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl Job {
    pub fn builder(kind: JobKind, page_id: impl Into<String>, folder: impl Into<PathBuf>) -> JobBuilder {
        JobBuilder::new(kind, page_id, folder)
    }

    // =====================================================
    // 只读配置
    // =====================================================

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub fn page_name(&self) -> &str {
        &self.page_name
    }

    /// 日志里显示的名字，没有页面名时用 page_id
    pub fn display_name(&self) -> &str {
        if self.page_name.is_empty() {
            &self.page_id
        } else {
            &self.page_name
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn sort_by(&self) -> SortPolicy {
        self.sort_by
    }

    pub fn schedule_settings(&self) -> &ScheduleSettings {
        &self.schedule
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    // =====================================================
    // 状态读取
    // =====================================================

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.lock().is_scheduled
    }

    pub fn cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    pub fn next_run_at(&self) -> DateTime<Utc> {
        self.state.lock().next_run_at
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> JobPhase {
        let (enabled, scheduled) = {
            let state = self.state.lock();
            (state.enabled, state.is_scheduled)
        };
        match (enabled, scheduled) {
            (false, _) => JobPhase::Disabled,
            (true, false) => JobPhase::Idle,
            (true, true) if self.is_running() => JobPhase::Running,
            (true, true) => JobPhase::Waiting,
        }
    }

    /// enabled && is_scheduled && now >= next_run_at
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        state.enabled && state.is_scheduled && now >= state.next_run_at
    }

    pub fn next_index(&self) -> usize {
        self.next_index.load(Ordering::SeqCst)
    }

    // =====================================================
    // 状态迁移
    // =====================================================

    /// Disabled -> Idle
    pub fn enable(&self) {
        let mut state = self.state.lock();
        if !state.enabled {
            state.enabled = true;
            info!("任务已启用: {}", self.key);
        }
    }

    /// 任意状态 -> Disabled，同时请求取消正在进行的上传
    pub fn disable(&self) {
        let active = {
            let mut state = self.state.lock();
            state.enabled = false;
            state.is_scheduled = false;
            state.cancel_requested = true;
            state.active_run.clone()
        };
        if let Some(token) = active {
            token.cancel();
        }
        info!("任务已禁用: {}", self.key);
    }

    /// Idle -> Waiting，重新计算 next_run_at 并清除取消请求
    pub fn schedule(
        &self,
        templates: &dyn ScheduleTemplates,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, TransitionError> {
        let next = compute_next_run(&self.schedule, templates, now);

        let mut state = self.state.lock();
        if !state.enabled {
            return Err(TransitionError::NotEnabled(self.key.to_string()));
        }
        state.is_scheduled = true;
        state.cancel_requested = false;
        state.next_run_at = next;
        drop(state);

        info!("任务已调度: {}, 下次运行 {}", self.key, next);
        Ok(next)
    }

    /// Waiting/Running -> Idle，请求取消正在进行的上传
    pub fn unschedule(&self) {
        let active = {
            let mut state = self.state.lock();
            if !state.is_scheduled {
                return;
            }
            state.is_scheduled = false;
            state.cancel_requested = true;
            state.active_run.clone()
        };
        if let Some(token) = active {
            token.cancel();
        }
        info!("任务已取消调度: {}", self.key);
    }

    /// 调度循环专用：到期则把 next_run_at 推进到 `next` 并返回 true
    ///
    /// 检查和推进在同一临界区内完成，同一到期时刻只会成功一次
    pub fn claim_due(&self, now: DateTime<Utc>, next: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.enabled && state.is_scheduled && now >= state.next_run_at {
            state.next_run_at = next.max(now + ChronoDuration::milliseconds(1));
            true
        } else {
            false
        }
    }

    /// 计算下一次运行并在到期时认领
    pub fn advance_schedule(&self, templates: &dyn ScheduleTemplates, now: DateTime<Utc>) -> bool {
        if !self.is_due(now) {
            return false;
        }
        let next = compute_next_run(&self.schedule, templates, now);
        self.claim_due(now, next)
    }

    /// 直接设定下一次运行时间
    pub fn set_next_run_at(&self, at: DateTime<Utc>) {
        self.state.lock().next_run_at = at;
    }

    /// 限流后推迟：now + [min, max] 秒内随机
    pub fn defer_after_rate_limit(
        &self,
        now: DateTime<Utc>,
        min_secs: u64,
        max_secs: u64,
    ) -> DateTime<Utc> {
        let (lo, hi) = if min_secs <= max_secs {
            (min_secs, max_secs)
        } else {
            (max_secs, min_secs)
        };
        let secs = rand::thread_rng().gen_range(lo..=hi).max(1);
        let at = after_secs(now, secs);
        self.set_next_run_at(at);
        at
    }

    // =====================================================
    // 上传锁与运行令牌
    // =====================================================

    /// 与被替换的旧任务共用上传锁和运行标记
    ///
    /// 旧任务的上传退出前，新任务拿不到上传锁
    pub(crate) fn inherit_upload_lock(&mut self, previous: &Job) {
        self.upload_lock = previous.upload_lock.clone();
        self.running = previous.running.clone();
    }

    /// 非阻塞获取上传锁，已被占用时返回 None
    pub fn try_acquire_upload(&self) -> Option<UploadPermit> {
        let guard = self.upload_lock.clone().try_lock_owned().ok()?;
        self.running.store(true, Ordering::SeqCst);
        Some(UploadPermit {
            key: self.key.clone(),
            running: self.running.clone(),
            _guard: guard,
        })
    }

    /// 开始一次运行，返回绑定到本任务的取消令牌
    ///
    /// 若此前已有未消费的取消请求，令牌立即处于取消状态，请求随之被消费
    pub fn begin_run<'a>(
        &'a self,
        permit: &UploadPermit,
        parent: &CancellationToken,
    ) -> RunGuard<'a> {
        debug_assert_eq!(permit.key, self.key);
        let token = parent.child_token();
        let pending_cancel = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.cancel_requested);
            state.active_run = Some(token.clone());
            pending
        };
        if pending_cancel {
            debug!("任务 {} 存在未处理的取消请求", self.key);
            token.cancel();
        }
        RunGuard { job: self, token }
    }

    /// 消费取消请求
    pub fn take_cancel_request(&self) -> bool {
        std::mem::take(&mut self.state.lock().cancel_requested)
    }

    /// 写游标，需要上传许可
    pub fn set_next_index(&self, permit: &UploadPermit, index: usize) {
        debug_assert_eq!(permit.key, self.key);
        self.next_index.store(index, Ordering::SeqCst);
    }

    /// 游标前进 `by` 项（对 `len` 取模），需要上传许可
    pub fn advance_cursor(&self, permit: &UploadPermit, by: usize, len: usize) -> usize {
        let next = if len == 0 {
            0
        } else {
            (self.next_index() % len + by) % len
        };
        self.set_next_index(permit, next);
        next
    }
}

/// 上传许可：持有期间任务处于 Running
#[derive(Debug)]
pub struct UploadPermit {
    key: JobKey,
    running: Arc<AtomicBool>,
    _guard: OwnedMutexGuard<()>,
}

impl UploadPermit {
    pub fn key(&self) -> &JobKey {
        &self.key
    }
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// 单次运行的取消令牌，析构时从任务上摘除
#[derive(Debug)]
pub struct RunGuard<'a> {
    job: &'a Job,
    token: CancellationToken,
}

impl RunGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.job.state.lock();
        state.active_run = None;
        // 运行期间发出的取消已经作用于本次运行
        if self.token.is_cancelled() {
            state.cancel_requested = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::VideoSettings;
    use crate::job::schedule::InMemoryTemplates;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn video_job() -> Job {
        Job::builder(JobKind::Video(VideoSettings::default()), "page-1", "/tmp/media")
            .page_name("测试页面")
            .interval_seconds(60)
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let job = video_job();
        assert_eq!(job.key().as_str(), "page-1");
        assert_eq!(job.job_type(), JobType::Video);
        assert!(job.is_enabled());
        assert!(!job.is_scheduled());
        assert_eq!(job.phase(), JobPhase::Idle);

        let disabled = Job::builder(JobKind::Video(VideoSettings::default()), "p", "/tmp")
            .enabled(false)
            .scheduled(true)
            .build();
        assert!(!disabled.is_scheduled());
    }

    #[test]
    fn test_state_transitions() {
        let templates = InMemoryTemplates::new();
        let job = video_job();
        let now = Utc::now();

        let next = job.schedule(&templates, now).unwrap();
        assert_eq!(next, now + ChronoDuration::seconds(60));
        assert_eq!(job.phase(), JobPhase::Waiting);

        job.unschedule();
        assert_eq!(job.phase(), JobPhase::Idle);
        assert!(job.cancel_requested());

        job.schedule(&templates, now).unwrap();
        assert!(!job.cancel_requested());

        job.disable();
        assert_eq!(job.phase(), JobPhase::Disabled);
        assert!(!job.is_scheduled());
        assert!(job.cancel_requested());

        assert_eq!(
            job.schedule(&templates, now),
            Err(TransitionError::NotEnabled("page-1".to_string()))
        );

        job.enable();
        assert_eq!(job.phase(), JobPhase::Idle);
    }

    #[test]
    fn test_unschedule_when_idle_keeps_cancel_clear() {
        let job = video_job();
        job.unschedule();
        assert!(!job.cancel_requested());
    }

    #[test]
    fn test_claim_due_only_once() {
        let templates = InMemoryTemplates::new();
        let job = video_job();
        let now = Utc::now();
        job.schedule(&templates, now).unwrap();
        job.set_next_run_at(now);

        assert!(job.is_due(now));
        assert!(job.advance_schedule(&templates, now));
        assert!(job.next_run_at() > now);
        assert!(!job.advance_schedule(&templates, now));
    }

    #[test]
    fn test_defer_after_rate_limit_range() {
        let job = video_job();
        let now = Utc::now();
        for _ in 0..50 {
            let at = job.defer_after_rate_limit(now, 1800, 3600);
            let secs = (at - now).num_seconds();
            assert!((1800..=3600).contains(&secs));
            assert_eq!(job.next_run_at(), at);
        }
    }

    #[tokio::test]
    async fn test_upload_permit_exclusive() {
        let job = video_job();
        let permit = job.try_acquire_upload().expect("first acquire");
        assert!(job.is_running());
        assert!(job.try_acquire_upload().is_none());
        drop(permit);
        assert!(!job.is_running());
        assert!(job.try_acquire_upload().is_some());
    }

    #[tokio::test]
    async fn test_disable_cancels_active_run() {
        let templates = InMemoryTemplates::new();
        let job = video_job();
        job.schedule(&templates, Utc::now()).unwrap();

        let permit = job.try_acquire_upload().unwrap();
        let root = CancellationToken::new();
        let run = job.begin_run(&permit, &root);
        assert!(!run.is_cancelled());
        assert_eq!(job.phase(), JobPhase::Running);

        job.disable();
        assert!(run.is_cancelled());
        drop(run);
        assert!(!job.cancel_requested());
    }

    #[tokio::test]
    async fn test_pending_cancel_consumed_by_next_run() {
        let templates = InMemoryTemplates::new();
        let job = video_job();
        job.schedule(&templates, Utc::now()).unwrap();
        job.unschedule();
        job.schedule(&templates, Utc::now()).unwrap();
        assert!(!job.cancel_requested());

        // 未运行时的取消请求在下次运行开始时生效并被消费
        job.unschedule();
        let permit = job.try_acquire_upload().unwrap();
        let root = CancellationToken::new();
        let run = job.begin_run(&permit, &root);
        assert!(run.is_cancelled());
        assert!(!job.cancel_requested());
    }

    #[test]
    fn test_cursor_advance_wraps() {
        let job = video_job();
        let permit = job.try_acquire_upload().unwrap();
        job.set_next_index(&permit, 4);
        assert_eq!(job.advance_cursor(&permit, 1, 5), 0);
        assert_eq!(job.advance_cursor(&permit, 3, 5), 3);
        assert_eq!(job.advance_cursor(&permit, 3, 0), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enable,
        Disable,
        Schedule,
        Unschedule,
        Claim,
        Defer,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Enable),
            Just(Op::Disable),
            Just(Op::Schedule),
            Just(Op::Unschedule),
            Just(Op::Claim),
            Just(Op::Defer),
        ]
    }

    proptest! {
        #[test]
        fn prop_scheduled_implies_enabled(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let templates = InMemoryTemplates::new();
            let job = video_job();
            let now = Utc::now();
            for op in ops {
                match op {
                    Op::Enable => job.enable(),
                    Op::Disable => job.disable(),
                    Op::Schedule => { let _ = job.schedule(&templates, now); }
                    Op::Unschedule => job.unschedule(),
                    Op::Claim => { job.claim_due(now + ChronoDuration::hours(1), now + ChronoDuration::hours(2)); }
                    Op::Defer => { job.defer_after_rate_limit(now, 1800, 3600); }
                }
                prop_assert!(!job.is_scheduled() || job.is_enabled());
            }
        }

        #[test]
        fn prop_upload_lock_exclusive(workers in 2usize..16) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let job = Arc::new(video_job());
                let holders = Arc::new(AtomicUsize::new(0));
                let max_seen = Arc::new(AtomicUsize::new(0));

                let mut handles = Vec::new();
                for _ in 0..workers {
                    let job = job.clone();
                    let holders = holders.clone();
                    let max_seen = max_seen.clone();
                    handles.push(tokio::spawn(async move {
                        for _ in 0..20 {
                            if let Some(_permit) = job.try_acquire_upload() {
                                let now_held = holders.fetch_add(1, Ordering::SeqCst) + 1;
                                max_seen.fetch_max(now_held, Ordering::SeqCst);
                                tokio::task::yield_now().await;
                                holders.fetch_sub(1, Ordering::SeqCst);
                            }
                            tokio::task::yield_now().await;
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
                assert!(max_seen.load(Ordering::SeqCst) <= 1);
            });
        }
    }
}
