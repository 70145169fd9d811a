//! 任务数据模型
//!
//! 任务类型、文件排序策略、各类型专属设置以及任务键

use serde::{Deserialize, Serialize};
use std::fmt;

/// 视频任务默认间隔（3 小时）
pub const DEFAULT_VIDEO_INTERVAL_SECS: u64 = 10_800;
/// 快拍任务默认间隔（1 小时）
pub const DEFAULT_STORY_INTERVAL_SECS: u64 = 3_600;
/// Reels 任务默认间隔（1 小时）
pub const DEFAULT_REELS_INTERVAL_SECS: u64 = 3_600;

/// 固定间隔上限（365 天）
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;

/// 把间隔限制在 [1, MAX_INTERVAL_SECS]
pub fn clamp_interval(secs: u64) -> u64 {
    secs.clamp(1, MAX_INTERVAL_SECS)
}

/// 快拍防封延迟默认下限（秒）
pub const DEFAULT_STORY_DELAY_MIN: u64 = 5;
/// 快拍防封延迟默认上限（秒）
pub const DEFAULT_STORY_DELAY_MAX: u64 = 15;

/// 任务键中 page_id 与 app_name 的分隔符
pub const JOB_KEY_SEPARATOR: &str = ":::";

/// 任务类型（持久化时的 job_type 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Video,
    Story,
    Reels,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Video => "video",
            JobType::Story => "story",
            JobType::Reels => "reels",
        }
    }

    /// 该类型的默认调度间隔（秒）
    pub fn default_interval_secs(&self) -> u64 {
        match self {
            JobType::Video => DEFAULT_VIDEO_INTERVAL_SECS,
            JobType::Story => DEFAULT_STORY_INTERVAL_SECS,
            JobType::Reels => DEFAULT_REELS_INTERVAL_SECS,
        }
    }

    /// 日志里使用的中文名
    pub fn label(&self) -> &'static str {
        match self {
            JobType::Video => "视频",
            JobType::Story => "快拍",
            JobType::Reels => "Reels",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 文件排序策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortPolicy {
    /// 按文件名
    #[default]
    Name,
    /// 每轮随机打乱
    Random,
    /// 按创建时间
    DateCreated,
    /// 按修改时间
    DateModified,
}

impl SortPolicy {
    /// 宽松解析，未知值回退为按文件名
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "random" => SortPolicy::Random,
            "date_created" => SortPolicy::DateCreated,
            "date_modified" => SortPolicy::DateModified,
            _ => SortPolicy::Name,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortPolicy::Name => "name",
            SortPolicy::Random => "random",
            SortPolicy::DateCreated => "date_created",
            SortPolicy::DateModified => "date_modified",
        }
    }
}

/// 水印参数（只保存，不在本引擎内处理）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSettings {
    pub enabled: bool,
    pub path: String,
    pub position: String,
    pub opacity: f64,
    pub scale: f64,
}

impl Default for WatermarkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: String::new(),
            position: "bottom_right".to_string(),
            opacity: 0.8,
            scale: 0.15,
        }
    }
}

/// 视频 / Reels 任务设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    /// 标题模板，支持 {filename} {date} 等占位符
    pub title_template: String,
    pub description_template: String,
    /// 为 true 时标题直接使用文件名
    pub use_filename_as_title: bool,
    /// 分片大小（字节），0 表示使用默认值
    pub chunk_size: u64,
    pub watermark: WatermarkSettings,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            title_template: "{filename}".to_string(),
            description_template: String::new(),
            use_filename_as_title: false,
            chunk_size: 0,
            watermark: WatermarkSettings::default(),
        }
    }
}

/// 快拍任务设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySettings {
    /// 每次调度上传的快拍数量
    pub stories_per_schedule: u32,
    /// 是否在快拍之间插入随机延迟
    pub anti_ban_enabled: bool,
    pub random_delay_min: u64,
    pub random_delay_max: u64,
    /// 每小时调用上限
    pub hourly_limit: u32,
    /// 每天调用上限
    pub daily_limit: u32,
}

impl Default for StorySettings {
    fn default() -> Self {
        Self {
            stories_per_schedule: 1,
            anti_ban_enabled: true,
            random_delay_min: DEFAULT_STORY_DELAY_MIN,
            random_delay_max: DEFAULT_STORY_DELAY_MAX,
            hourly_limit: 20,
            daily_limit: 200,
        }
    }
}

impl StorySettings {
    /// 规范化：数量至少为 1，延迟为 0 时回退默认值，上限不小于下限
    pub fn normalized(mut self) -> Self {
        self.stories_per_schedule = self.stories_per_schedule.max(1);
        if self.random_delay_min == 0 {
            self.random_delay_min = DEFAULT_STORY_DELAY_MIN;
        }
        if self.random_delay_max == 0 {
            self.random_delay_max = DEFAULT_STORY_DELAY_MAX;
        }
        if self.random_delay_max < self.random_delay_min {
            self.random_delay_max = self.random_delay_min;
        }
        self
    }
}

/// 任务的类型专属负载
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    Video(VideoSettings),
    Story(StorySettings),
    Reels(VideoSettings),
}

impl JobKind {
    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::Video(_) => JobType::Video,
            JobKind::Story(_) => JobType::Story,
            JobKind::Reels(_) => JobType::Reels,
        }
    }

    pub fn video_settings(&self) -> Option<&VideoSettings> {
        match self {
            JobKind::Video(s) | JobKind::Reels(s) => Some(s),
            JobKind::Story(_) => None,
        }
    }

    pub fn story_settings(&self) -> Option<&StorySettings> {
        match self {
            JobKind::Story(s) => Some(s),
            _ => None,
        }
    }
}

/// 调度设置：固定间隔或智能调度模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub interval_seconds: u64,
    pub use_smart_schedule: bool,
    pub template_id: Option<i64>,
    pub jitter_enabled: bool,
    /// 抖动百分比（使用时限制在 0-50）
    pub jitter_percent: u32,
}

impl ScheduleSettings {
    pub fn with_interval(interval_seconds: u64) -> Self {
        Self {
            interval_seconds: clamp_interval(interval_seconds),
            ..Self::default()
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_STORY_INTERVAL_SECS,
            use_smart_schedule: false,
            template_id: None,
            jitter_enabled: false,
            jitter_percent: 10,
        }
    }
}

/// 任务键
///
/// 同一页面可能由多个应用驱动，所以键由 page_id 与 app_name 组成；
/// app_name 为空时键就是 page_id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(page_id: &str, app_name: &str) -> Self {
        if app_name.is_empty() {
            JobKey(page_id.to_string())
        } else {
            JobKey(format!("{}{}{}", page_id, JOB_KEY_SEPARATOR, app_name))
        }
    }

    /// 拆回 (page_id, app_name)
    pub fn parse(key: &str) -> (String, String) {
        match key.split_once(JOB_KEY_SEPARATOR) {
            Some((page, app)) => (page.to_string(), app.to_string()),
            None => (key.to_string(), String::new()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_roundtrip() {
        let key = JobKey::new("12345", "MyApp");
        assert_eq!(key.as_str(), "12345:::MyApp");
        assert_eq!(
            JobKey::parse(key.as_str()),
            ("12345".to_string(), "MyApp".to_string())
        );

        let bare = JobKey::new("12345", "");
        assert_eq!(bare.as_str(), "12345");
        assert_eq!(JobKey::parse("12345"), ("12345".to_string(), String::new()));
    }

    #[test]
    fn test_app_name_with_pipe() {
        let key = JobKey::new("1", "a|b");
        assert_eq!(JobKey::parse(key.as_str()).1, "a|b");
    }

    #[test]
    fn test_story_settings_normalized() {
        let s = StorySettings {
            stories_per_schedule: 0,
            random_delay_min: 0,
            random_delay_max: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(s.stories_per_schedule, 1);
        assert_eq!((s.random_delay_min, s.random_delay_max), (5, 15));

        let clamped = StorySettings {
            random_delay_min: 30,
            random_delay_max: 10,
            ..Default::default()
        }
        .normalized();
        assert_eq!((clamped.random_delay_min, clamped.random_delay_max), (30, 30));
    }

    #[test]
    fn test_sort_policy_lenient() {
        assert_eq!(SortPolicy::parse_lenient("RANDOM"), SortPolicy::Random);
        assert_eq!(SortPolicy::parse_lenient("date_modified"), SortPolicy::DateModified);
        assert_eq!(SortPolicy::parse_lenient("whatever"), SortPolicy::Name);
    }

    #[test]
    fn test_job_type_serde() {
        assert_eq!(serde_json::to_string(&JobType::Reels).unwrap(), "\"reels\"");
        let t: JobType = serde_json::from_str("\"story\"").unwrap();
        assert_eq!(t, JobType::Story);
        assert_eq!(JobType::Video.default_interval_secs(), 10_800);
    }
}
