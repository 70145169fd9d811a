// 任务注册表
//
// 以 (任务类型, 任务键) 为键保存所有任务；
// 调度循环每轮取快照遍历，不持有表级锁

use super::base::Job;
use super::model::{JobKey, JobType};
use super::record::JobRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<(JobType, JobKey), Arc<Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或替换任务，返回插入后的共享句柄
    ///
    /// 被替换的任务会被禁用，以便其正在进行的上传尽快退出；
    /// 新任务沿用旧任务的上传锁，两者的上传不会重叠
    pub fn insert(&self, mut job: Job) -> Arc<Job> {
        let id = (job.job_type(), job.key().clone());
        match self.jobs.entry(id) {
            Entry::Occupied(mut entry) => {
                job.inherit_upload_lock(entry.get());
                let job = Arc::new(job);
                let old = entry.insert(job.clone());
                old.disable();
                debug!("替换已有任务: {} ({})", job.key(), job.job_type());
                job
            }
            Entry::Vacant(entry) => {
                let job = Arc::new(job);
                entry.insert(job.clone());
                job
            }
        }
    }

    /// 删除任务，同时禁用它
    pub fn remove(&self, job_type: JobType, key: &JobKey) -> Option<Arc<Job>> {
        let (_, job) = self.jobs.remove(&(job_type, key.clone()))?;
        job.disable();
        info!("已删除任务: {} ({})", key, job_type);
        Some(job)
    }

    pub fn get(&self, job_type: JobType, key: &JobKey) -> Option<Arc<Job>> {
        self.jobs.get(&(job_type, key.clone())).map(|j| j.clone())
    }

    /// 某类型任务的快照，按键排序
    pub fn snapshot(&self, job_type: JobType) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self
            .jobs
            .iter()
            .filter(|entry| entry.key().0 == job_type)
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.key().cmp(b.key()));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// 全部任务的持久化记录
    pub fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .iter()
            .map(|entry| JobRecord::from_job(entry.value()))
            .collect();
        records.sort_by(|a, b| {
            (a.job_type, &a.page_id, &a.app_name).cmp(&(b.job_type, &b.page_id, &b.app_name))
        });
        records
    }

    /// 从 JSON 文件加载
    ///
    /// 文件不存在时返回空表；单条记录损坏只跳过该条
    pub async fn load_from_file(path: &Path, now: DateTime<Utc>) -> Result<Self> {
        let registry = Self::new();
        if !path.exists() {
            info!("任务文件不存在，使用空任务表: {:?}", path);
            return Ok(registry);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("读取任务文件失败: {:?}", path))?;
        let values: Vec<serde_json::Value> =
            serde_json::from_str(&content).with_context(|| format!("解析任务文件失败: {:?}", path))?;

        let total = values.len();
        for (index, value) in values.into_iter().enumerate() {
            match JobRecord::from_value(value).and_then(|record| record.into_job(now)) {
                Ok(job) => {
                    registry.insert(job);
                }
                Err(e) => warn!("跳过第 {} 条任务记录: {}", index, e),
            }
        }

        info!("已加载任务 {}/{} 条: {:?}", registry.len(), total, path);
        Ok(registry)
    }

    /// 保存到 JSON 文件（临时文件 + 原子重命名）
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建目录失败: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(&self.records()).context("序列化任务记录失败")?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .with_context(|| format!("写入临时文件失败: {:?}", temp_path))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("重命名任务文件失败: {:?}", path))?;

        debug!("已保存任务 {} 条: {:?}", self.len(), path);
        Ok(())
    }
}
