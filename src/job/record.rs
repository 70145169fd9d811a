//! 任务持久化记录
//!
//! 扁平 JSON 对象，字段 snake_case；视频/Reels 与快拍的专属字段按需出现

use super::base::{Job, JobBuilder};
use super::model::{
    clamp_interval, JobKind, JobType, ScheduleSettings, SortPolicy, StorySettings, VideoSettings,
    WatermarkSettings,
};
use super::schedule::after_secs;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// 记录转换错误
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("任务记录缺少字段: {0}")]
    MissingField(&'static str),

    #[error("任务记录格式错误: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_job_type() -> JobType {
    JobType::Video
}

fn default_true() -> bool {
    true
}

fn default_jitter_percent() -> u32 {
    10
}

fn default_sort_by() -> String {
    SortPolicy::Name.as_str().to_string()
}

/// 持久化的任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
    #[serde(default)]
    pub page_id: String,
    #[serde(default)]
    pub page_name: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_access_token: Option<String>,
    #[serde(default)]
    pub next_index: usize,
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_scheduled: bool,
    /// Unix 秒（浮点）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_timestamp: Option<f64>,
    #[serde(default)]
    pub use_smart_schedule: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i64>,
    #[serde(default)]
    pub jitter_enabled: bool,
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u32,

    // 视频 / Reels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_filename_as_title: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_scale: Option<f64>,

    // 快拍
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stories_per_schedule: Option<u32>,
    /// 旧版本字段，只读
    #[serde(default, skip_serializing)]
    pub stories_per_day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_ban_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_delay_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_delay_max: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u32>,
}

impl JobRecord {
    /// 从 JSON 值解析
    pub fn from_value(value: serde_json::Value) -> Result<Self, RecordError> {
        Ok(serde_json::from_value(value)?)
    }

    /// 从运行中的任务生成记录
    pub fn from_job(job: &Job) -> Self {
        let schedule = job.schedule_settings();
        let mut record = JobRecord {
            job_type: job.job_type(),
            page_id: job.page_id().to_string(),
            page_name: job.page_name().to_string(),
            app_name: job.app_name().to_string(),
            folder: job.folder().to_string_lossy().to_string(),
            interval_seconds: Some(schedule.interval_seconds),
            page_access_token: job.access_token().map(str::to_string),
            next_index: job.next_index(),
            sort_by: job.sort_by().as_str().to_string(),
            enabled: job.is_enabled(),
            is_scheduled: job.is_scheduled(),
            next_run_timestamp: Some(to_epoch_secs(job.next_run_at())),
            use_smart_schedule: schedule.use_smart_schedule,
            template_id: schedule.template_id,
            jitter_enabled: schedule.jitter_enabled,
            jitter_percent: schedule.jitter_percent,
            title_template: None,
            description_template: None,
            use_filename_as_title: None,
            chunk_size: None,
            watermark_enabled: None,
            watermark_path: None,
            watermark_position: None,
            watermark_opacity: None,
            watermark_scale: None,
            stories_per_schedule: None,
            stories_per_day: None,
            anti_ban_enabled: None,
            random_delay_min: None,
            random_delay_max: None,
            hourly_limit: None,
            daily_limit: None,
        };

        match job.kind() {
            JobKind::Video(v) | JobKind::Reels(v) => {
                record.title_template = Some(v.title_template.clone());
                record.description_template = Some(v.description_template.clone());
                record.use_filename_as_title = Some(v.use_filename_as_title);
                record.chunk_size = Some(v.chunk_size);
                record.watermark_enabled = Some(v.watermark.enabled);
                record.watermark_path = Some(v.watermark.path.clone());
                record.watermark_position = Some(v.watermark.position.clone());
                record.watermark_opacity = Some(v.watermark.opacity);
                record.watermark_scale = Some(v.watermark.scale);
            }
            JobKind::Story(s) => {
                record.stories_per_schedule = Some(s.stories_per_schedule);
                record.anti_ban_enabled = Some(s.anti_ban_enabled);
                record.random_delay_min = Some(s.random_delay_min);
                record.random_delay_max = Some(s.random_delay_max);
                record.hourly_limit = Some(s.hourly_limit);
                record.daily_limit = Some(s.daily_limit);
            }
        }

        record
    }

    /// 还原为任务
    ///
    /// 加载恢复规则：
    /// - 已调度但未启用的记录按未调度加载
    /// - 已调度且运行时间缺失或已过去的记录，下次运行时间设为 `now`，只补跑一次
    pub fn into_job(self, now: DateTime<Utc>) -> Result<Job, RecordError> {
        if self.page_id.trim().is_empty() {
            return Err(RecordError::MissingField("page_id"));
        }
        if self.folder.trim().is_empty() {
            return Err(RecordError::MissingField("folder"));
        }

        let kind = self.kind();
        let interval = self
            .interval_seconds
            .unwrap_or_else(|| self.job_type.default_interval_secs());
        let interval = clamp_interval(interval);
        let schedule = ScheduleSettings {
            interval_seconds: interval,
            use_smart_schedule: self.use_smart_schedule,
            template_id: self.template_id,
            jitter_enabled: self.jitter_enabled,
            jitter_percent: self.jitter_percent,
        };

        let scheduled = self.is_scheduled && self.enabled;
        let stored = self.next_run_timestamp.and_then(from_epoch_secs);
        let next_run_at = match stored {
            Some(at) if !scheduled || at >= now => at,
            _ if scheduled => now,
            _ => after_secs(now, interval),
        };

        Ok(JobBuilder::new(kind, self.page_id, PathBuf::from(self.folder))
            .page_name(self.page_name)
            .app_name(self.app_name)
            .access_token(self.page_access_token)
            .sort_by(SortPolicy::parse_lenient(&self.sort_by))
            .schedule(schedule)
            .enabled(self.enabled)
            .scheduled(scheduled)
            .next_run_at(next_run_at)
            .next_index(self.next_index)
            .build())
    }

    fn kind(&self) -> JobKind {
        match self.job_type {
            JobType::Video => JobKind::Video(self.video_settings()),
            JobType::Reels => JobKind::Reels(self.video_settings()),
            JobType::Story => {
                let defaults = StorySettings::default();
                JobKind::Story(
                    StorySettings {
                        stories_per_schedule: self
                            .stories_per_schedule
                            .or(self.stories_per_day)
                            .unwrap_or(defaults.stories_per_schedule),
                        anti_ban_enabled: self.anti_ban_enabled.unwrap_or(defaults.anti_ban_enabled),
                        random_delay_min: self.random_delay_min.unwrap_or(defaults.random_delay_min),
                        random_delay_max: self.random_delay_max.unwrap_or(defaults.random_delay_max),
                        hourly_limit: self.hourly_limit.unwrap_or(defaults.hourly_limit),
                        daily_limit: self.daily_limit.unwrap_or(defaults.daily_limit),
                    }
                    .normalized(),
                )
            }
        }
    }

    fn video_settings(&self) -> VideoSettings {
        let defaults = VideoSettings::default();
        let watermark = WatermarkSettings::default();
        VideoSettings {
            title_template: self
                .title_template
                .clone()
                .unwrap_or(defaults.title_template),
            description_template: self
                .description_template
                .clone()
                .unwrap_or(defaults.description_template),
            use_filename_as_title: self.use_filename_as_title.unwrap_or(false),
            chunk_size: self.chunk_size.unwrap_or(0),
            watermark: WatermarkSettings {
                enabled: self.watermark_enabled.unwrap_or(watermark.enabled),
                path: self.watermark_path.clone().unwrap_or(watermark.path),
                position: self
                    .watermark_position
                    .clone()
                    .unwrap_or(watermark.position),
                opacity: self.watermark_opacity.unwrap_or(watermark.opacity),
                scale: self.watermark_scale.unwrap_or(watermark.scale),
            },
        }
    }
}

fn to_epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}
