// 上传前校验
//
// 校验在任何网络请求之前进行；被拒绝的文件游标照常前进

use super::collaborators::MediaProbe;
use crate::job::{is_supported, is_video, JobType};
use std::path::Path;

/// Reels 文件大小上限 1 GiB
pub const REELS_MAX_BYTES: u64 = 1024 * 1024 * 1024;
/// Reels 时长上限（秒）
pub const REELS_MAX_DURATION_SECS: f64 = 60.0;
/// 快拍视频建议时长上限（秒），超出只提醒
pub const STORY_VIDEO_MAX_DURATION_SECS: f64 = 60.0;
/// 普通视频时长上限 4 小时
pub const VIDEO_MAX_DURATION_SECS: f64 = 4.0 * 3600.0;

/// 校验结果
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// 可以上传，可能附带提醒
    Accepted { warning: Option<String> },
    /// 拒绝上传
    Rejected(String),
}

impl Validation {
    fn ok() -> Self {
        Validation::Accepted { warning: None }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Validation::Rejected(_))
    }
}

/// 校验待上传文件
///
/// # 参数
/// * `job_type` - 任务类型
/// * `path` - 文件路径
/// * `probe` - 时长探测；返回 None 时视为通过
/// * `thorough` - 是否做可选的深度检查（普通视频时长）
pub async fn validate_media(
    job_type: JobType,
    path: &Path,
    probe: &dyn MediaProbe,
    thorough: bool,
) -> Validation {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Validation::Rejected(format!("文件不存在: {}", path.display())),
    };
    if size == 0 {
        return Validation::Rejected(format!("文件为空: {}", path.display()));
    }
    if !is_supported(job_type, path) {
        return Validation::Rejected(format!("不支持的文件格式: {}", path.display()));
    }

    match job_type {
        JobType::Reels => {
            if size > REELS_MAX_BYTES {
                return Validation::Rejected(format!(
                    "Reels 文件过大: {:.1} MB (上限 1024 MB)",
                    size as f64 / 1024.0 / 1024.0
                ));
            }
            if let Some(duration) = probe.duration_secs(path).await {
                if duration > REELS_MAX_DURATION_SECS {
                    return Validation::Rejected(format!(
                        "Reels 时长 {:.0} 秒超过 {:.0} 秒上限",
                        duration, REELS_MAX_DURATION_SECS
                    ));
                }
            }
            Validation::ok()
        }
        JobType::Story => {
            if !is_video(path) {
                return Validation::ok();
            }
            match probe.duration_secs(path).await {
                Some(duration) if duration > STORY_VIDEO_MAX_DURATION_SECS => {
                    Validation::Accepted {
                        warning: Some(format!(
                            "快拍视频时长 {:.0} 秒，超过 {:.0} 秒可能被截断",
                            duration, STORY_VIDEO_MAX_DURATION_SECS
                        )),
                    }
                }
                _ => Validation::ok(),
            }
        }
        JobType::Video => {
            if !thorough {
                return Validation::ok();
            }
            match probe.duration_secs(path).await {
                Some(duration) if duration > VIDEO_MAX_DURATION_SECS => Validation::Rejected(
                    format!("视频时长 {:.1} 小时超过 4 小时上限", duration / 3600.0),
                ),
                _ => Validation::ok(),
            }
        }
    }
}
