// 调度引擎上下文
//
// 所有调度循环和工作单元共享的依赖集中在这里，
// 测试时直接构造新的实例替换其中的协作方

use super::collaborators::{FfprobeMediaProbe, FileArchiver, MediaProbe, UploadedFolderArchiver};
use super::status::StatusSink;
use crate::config::AppConfig;
use crate::governor::{QuotaBook, RateGovernor};
use crate::graph::GraphTransport;
use crate::job::{InMemoryTemplates, Job, JobKey, JobRegistry, JobType, ScheduleTemplates};
use crate::uploader::{
    ConnectivityProbe, RetryDriver, RetryPolicy, TcpConnectivityProbe, TransferClient,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<JobRegistry>,
    pub transport: Arc<dyn GraphTransport>,
    /// 全局限流退避状态
    pub governor: Arc<RateGovernor>,
    /// 快拍任务的调用配额
    pub quotas: QuotaBook,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub media_probe: Arc<dyn MediaProbe>,
    pub archiver: Arc<dyn FileArchiver>,
    pub templates: Arc<dyn ScheduleTemplates>,
    pub status: StatusSink,
}

impl EngineContext {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<JobRegistry>,
        transport: Arc<dyn GraphTransport>,
    ) -> Self {
        Self {
            governor: Arc::new(RateGovernor::new(&config.rate_limit)),
            quotas: QuotaBook::new(),
            connectivity: Arc::new(TcpConnectivityProbe::new(&config.connectivity)),
            media_probe: Arc::new(FfprobeMediaProbe::default()),
            archiver: Arc::new(UploadedFolderArchiver::new(
                config.scheduler.uploaded_folder_name.clone(),
            )),
            templates: Arc::new(InMemoryTemplates::new()),
            status: StatusSink::disabled(),
            config,
            registry,
            transport,
        }
    }

    pub fn with_status(mut self, status: StatusSink) -> Self {
        self.status = status;
        self
    }

    pub fn with_connectivity(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = probe;
        self
    }

    pub fn with_media_probe(mut self, probe: Arc<dyn MediaProbe>) -> Self {
        self.media_probe = probe;
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn FileArchiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn ScheduleTemplates>) -> Self {
        self.templates = templates;
        self
    }

    /// 删除任务；快拍任务的配额跟踪器一并移除
    pub fn remove_job(&self, job_type: JobType, key: &JobKey) -> Option<Arc<Job>> {
        let job = self.registry.remove(job_type, key)?;
        if job_type == JobType::Story {
            self.quotas.remove(key.as_str());
        }
        Some(job)
    }

    /// 按当前配置组装一个重试驱动
    pub fn retry_driver(&self) -> RetryDriver {
        let client = TransferClient::new(self.transport.clone(), self.governor.clone(), &self.config);
        RetryDriver::new(
            Arc::new(client),
            self.governor.clone(),
            self.connectivity.clone(),
            RetryPolicy::from_config(&self.config),
        )
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("jobs", &self.registry.len())
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::mock::ScriptedTransport;
    use crate::graph::TransportError;
    use crate::job::{JobKind, StorySettings};

    #[test]
    fn test_remove_story_job_drops_quota_tracker() {
        let ctx = EngineContext::new(
            Arc::new(AppConfig::default()),
            Arc::new(JobRegistry::new()),
            Arc::new(ScriptedTransport::from_fn(|_, _| {
                Err(TransportError::Timeout("offline".into()))
            })),
        );
        let job = ctx.registry.insert(
            Job::builder(JobKind::Story(StorySettings::default()), "page-1", "/stories").build(),
        );
        let key = job.key().clone();
        ctx.quotas.tracker_for(key.as_str(), 20, 200).record_call(2);
        assert!(ctx.quotas.get(key.as_str()).is_some());

        assert!(ctx.remove_job(JobType::Story, &key).is_some());
        assert!(ctx.registry.get(JobType::Story, &key).is_none());
        assert!(ctx.quotas.get(key.as_str()).is_none());
        assert!(!job.is_enabled());
        assert!(ctx.remove_job(JobType::Story, &key).is_none());
    }
}
