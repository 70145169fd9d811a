// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 调度器配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 限流退避配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 网络连通性检测配置
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    /// API 配额配置
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Graph API 配置
    #[serde(default)]
    pub graph: GraphConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

// =====================================================
// 日志配置
// =====================================================

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

// =====================================================
// 调度器配置
// =====================================================

/// 调度器配置
///
/// 视频 / 快拍 / 短视频三个调度循环共享同一份配置，
/// 各自的并发上限单独设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 轮询周期（毫秒，默认 1000）
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 视频调度器最大并发上传数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_video: usize,
    /// 快拍调度器最大并发上传数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_story: usize,
    /// 短视频调度器最大并发上传数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reels: usize,
    /// 上传成功后是否移动到已上传目录
    #[serde(default)]
    pub auto_move_uploaded: bool,
    /// 已上传目录名
    #[serde(default = "default_uploaded_folder_name")]
    pub uploaded_folder_name: String,
    /// 上传前是否检测网络连通性
    #[serde(default = "default_true")]
    pub check_connectivity: bool,
    /// 上传前是否校验文件（大小、扩展名、时长）
    #[serde(default = "default_true")]
    pub validate_before_upload: bool,
    /// 限流推迟最小秒数（默认 30 分钟）
    #[serde(default = "default_rate_limit_defer_min_secs")]
    pub rate_limit_defer_min_secs: u64,
    /// 限流推迟最大秒数（默认 60 分钟）
    #[serde(default = "default_rate_limit_defer_max_secs")]
    pub rate_limit_defer_max_secs: u64,
    /// 任务列表文件
    #[serde(default = "default_jobs_file")]
    pub jobs_file: PathBuf,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    3
}

fn default_uploaded_folder_name() -> String {
    "Uploaded".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_defer_min_secs() -> u64 {
    30 * 60
}

fn default_rate_limit_defer_max_secs() -> u64 {
    60 * 60
}

fn default_jobs_file() -> PathBuf {
    PathBuf::from("config/jobs.json")
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent_video: default_max_concurrent(),
            max_concurrent_story: default_max_concurrent(),
            max_concurrent_reels: default_max_concurrent(),
            auto_move_uploaded: false,
            uploaded_folder_name: default_uploaded_folder_name(),
            check_connectivity: true,
            validate_before_upload: true,
            rate_limit_defer_min_secs: default_rate_limit_defer_min_secs(),
            rate_limit_defer_max_secs: default_rate_limit_defer_max_secs(),
            jobs_file: default_jobs_file(),
        }
    }
}

impl SchedulerConfig {
    /// 轮询周期
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

// =====================================================
// 上传配置
// =====================================================

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分段上传阈值 (MB)，不超过此大小的文件一次性上传
    #[serde(default = "default_resumable_threshold_mb")]
    pub resumable_threshold_mb: u64,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// start 阶段超时（秒）
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// transfer 阶段超时（秒）
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// finish 阶段超时（秒）
    #[serde(default = "default_finish_timeout_secs")]
    pub finish_timeout_secs: u64,
    /// 一次性上传超时（秒）
    #[serde(default = "default_single_shot_timeout_secs")]
    pub single_shot_timeout_secs: u64,
}

fn default_resumable_threshold_mb() -> u64 {
    50
}

fn default_chunk_size_mb() -> u64 {
    32
}

fn default_start_timeout_secs() -> u64 {
    60
}

fn default_transfer_timeout_secs() -> u64 {
    300
}

fn default_finish_timeout_secs() -> u64 {
    180
}

fn default_single_shot_timeout_secs() -> u64 {
    300
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            resumable_threshold_mb: default_resumable_threshold_mb(),
            chunk_size_mb: default_chunk_size_mb(),
            start_timeout_secs: default_start_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            finish_timeout_secs: default_finish_timeout_secs(),
            single_shot_timeout_secs: default_single_shot_timeout_secs(),
        }
    }
}

impl UploadConfig {
    /// 分段上传阈值（字节）
    pub fn resumable_threshold(&self) -> u64 {
        self.resumable_threshold_mb * 1024 * 1024
    }

    /// 分片大小（字节）
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb.max(1) * 1024 * 1024
    }
}

// =====================================================
// 重试配置
// =====================================================

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 退避步长（秒），第 n 次失败后等待 n × 步长
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,
    /// 单次上传内最多原地等待限流的次数
    #[serde(default = "default_max_rate_limit_waits")]
    pub max_rate_limit_waits: u32,
    /// 原地等待限流的最长时间（秒），超过则交给调度器推迟
    #[serde(default = "default_max_inline_rate_limit_wait_secs")]
    pub max_inline_rate_limit_wait_secs: u64,
    /// 可中断睡眠的切片长度（毫秒）
    #[serde(default = "default_sleep_slice_ms")]
    pub sleep_slice_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_step_secs() -> u64 {
    5
}

fn default_max_rate_limit_waits() -> u32 {
    2
}

fn default_max_inline_rate_limit_wait_secs() -> u64 {
    300
}

fn default_sleep_slice_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_step_secs: default_backoff_step_secs(),
            max_rate_limit_waits: default_max_rate_limit_waits(),
            max_inline_rate_limit_wait_secs: default_max_inline_rate_limit_wait_secs(),
            sleep_slice_ms: default_sleep_slice_ms(),
        }
    }
}

// =====================================================
// 限流配置
// =====================================================

/// 限流退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 初始等待（秒）
    #[serde(default = "default_initial_wait_secs")]
    pub initial_wait_secs: u64,
    /// 最大等待（秒）
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// 退避倍数
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_wait_secs() -> u64 {
    60
}

fn default_max_wait_secs() -> u64 {
    3600
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_wait_secs: default_initial_wait_secs(),
            max_wait_secs: default_max_wait_secs(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

// =====================================================
// 连通性配置
// =====================================================

/// 网络连通性检测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// 探测地址（TCP 直连）
    #[serde(default = "default_probe_hosts")]
    pub hosts: Vec<String>,
    /// 单个地址探测超时（秒）
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// 断网后两次检测的间隔（秒）
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// 断网等待的最大检测次数
    #[serde(default = "default_max_wait_attempts")]
    pub max_wait_attempts: u32,
}

fn default_probe_hosts() -> Vec<String> {
    vec![
        "8.8.8.8:53".to_string(),
        "8.8.4.4:53".to_string(),
        "1.1.1.1:53".to_string(),
        "208.67.222.222:53".to_string(),
    ]
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_max_wait_attempts() -> u32 {
    60
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            hosts: default_probe_hosts(),
            probe_timeout_secs: default_probe_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            max_wait_attempts: default_max_wait_attempts(),
        }
    }
}

// =====================================================
// 配额配置
// =====================================================

/// API 配额配置（快拍任务使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// 默认每小时调用上限
    #[serde(default = "default_hourly_limit")]
    pub default_hourly_limit: u32,
    /// 默认每日调用上限
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: u32,
    /// 每条快拍消耗的 API 调用数
    #[serde(default = "default_calls_per_story")]
    pub calls_per_story: u32,
}

fn default_hourly_limit() -> u32 {
    20
}

fn default_daily_limit() -> u32 {
    200
}

fn default_calls_per_story() -> u32 {
    2
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_hourly_limit: default_hourly_limit(),
            default_daily_limit: default_daily_limit(),
            calls_per_story: default_calls_per_story(),
        }
    }
}

// =====================================================
// Graph API 配置
// =====================================================

/// Graph API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// API 版本
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// 普通接口地址
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    /// 视频上传接口地址
    #[serde(default = "default_video_base_url")]
    pub video_base_url: String,
    /// 默认请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_version() -> String {
    "v20.0".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_video_base_url() -> String {
    "https://graph-video.facebook.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            graph_base_url: default_graph_base_url(),
            video_base_url: default_video_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时使用默认配置并尝试写回
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }

    /// 校验配置取值范围
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts 必须大于 0");
        }
        if self.scheduler.rate_limit_defer_min_secs > self.scheduler.rate_limit_defer_max_secs {
            anyhow::bail!(
                "限流推迟区间无效: {} > {}",
                self.scheduler.rate_limit_defer_min_secs,
                self.scheduler.rate_limit_defer_max_secs
            );
        }
        if !self.rate_limit.backoff_factor.is_finite() || self.rate_limit.backoff_factor < 1.0 {
            anyhow::bail!("rate_limit.backoff_factor 必须是不小于 1.0 的有限数");
        }
        if self.upload.chunk_size_mb == 0 {
            anyhow::bail!("upload.chunk_size_mb 必须大于 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.scheduler.max_concurrent_video, 3);
        assert_eq!(config.scheduler.max_concurrent_story, 3);
        assert_eq!(config.scheduler.max_concurrent_reels, 3);
        assert_eq!(config.upload.resumable_threshold(), 50 * 1024 * 1024);
        assert_eq!(config.upload.chunk_size(), 32 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limit.initial_wait_secs, 60);
        assert_eq!(config.rate_limit.max_wait_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let content = r#"
            [scheduler]
            max_concurrent_story = 1

            [upload]
            chunk_size_mb = 8
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.scheduler.max_concurrent_story, 1);
        assert_eq!(config.scheduler.max_concurrent_video, 3);
        assert_eq!(config.upload.chunk_size(), 8 * 1024 * 1024);
        assert_eq!(config.upload.resumable_threshold_mb, 50);
        assert_eq!(config.graph.api_version, "v20.0");
        assert_eq!(config.connectivity.hosts.len(), 4);
    }

    #[test]
    fn test_validate_rejects_bad_defer_window() {
        let mut config = AppConfig::default();
        config.scheduler.rate_limit_defer_min_secs = 100;
        config.scheduler.rate_limit_defer_max_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_backoff_factor() {
        let mut config = AppConfig::default();
        config.rate_limit.backoff_factor = f64::INFINITY;
        assert!(config.validate().is_err());
        config.rate_limit.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path_str = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.scheduler.auto_move_uploaded = true;
        config.quota.default_hourly_limit = 42;
        config.save_to_file(path_str).await.unwrap();

        let loaded = AppConfig::load_from_file(path_str).await.unwrap();
        assert!(loaded.scheduler.auto_move_uploaded);
        assert_eq!(loaded.quota.default_hourly_limit, 42);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert_eq!(config.retry.max_attempts, 3);
        assert!(path.exists());
    }
}
