// 外部协作方：媒体时长探测、上传后归档

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// 媒体时长探测
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// 时长（秒），无法获取时返回 None
    async fn duration_secs(&self, path: &Path) -> Option<f64>;
}

/// 基于 ffprobe 的时长探测
#[derive(Debug, Clone)]
pub struct FfprobeMediaProbe {
    binary: String,
    timeout: Duration,
}

impl FfprobeMediaProbe {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

impl Default for FfprobeMediaProbe {
    fn default() -> Self {
        Self::new("ffprobe", Duration::from_secs(30))
    }
}

#[async_trait]
impl MediaProbe for FfprobeMediaProbe {
    async fn duration_secs(&self, path: &Path) -> Option<f64> {
        let output = tokio::process::Command::new(&self.binary)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(out)) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                text.trim().parse::<f64>().ok().filter(|d| *d > 0.0)
            }
            Ok(Ok(out)) => {
                debug!("ffprobe 返回非零状态: {:?}, 文件 {:?}", out.status, path);
                None
            }
            Ok(Err(e)) => {
                debug!("ffprobe 无法执行: {}", e);
                None
            }
            Err(_) => {
                debug!("ffprobe 超时: {:?}", path);
                None
            }
        }
    }
}

/// 不做探测，时长视为未知
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMediaProbe;

#[async_trait]
impl MediaProbe for NoMediaProbe {
    async fn duration_secs(&self, _path: &Path) -> Option<f64> {
        None
    }
}

/// 上传成功后的文件归档
#[async_trait]
pub trait FileArchiver: Send + Sync {
    /// 归档文件，返回新位置
    async fn archive(&self, file: &Path) -> Result<PathBuf>;
}

/// 移动到同级的已上传目录，重名时追加 _1、_2 …
#[derive(Debug, Clone)]
pub struct UploadedFolderArchiver {
    folder_name: String,
}

impl UploadedFolderArchiver {
    pub fn new(folder_name: impl Into<String>) -> Self {
        Self {
            folder_name: folder_name.into(),
        }
    }

    fn free_destination(dir: &Path, file: &Path) -> Result<PathBuf> {
        let name = file
            .file_name()
            .with_context(|| format!("无效的文件路径: {:?}", file))?;
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }

        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = file
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut counter = 1u32;
        loop {
            let candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
            if !candidate.exists() {
                return Ok(candidate);
            }
            counter += 1;
        }
    }
}

#[async_trait]
impl FileArchiver for UploadedFolderArchiver {
    async fn archive(&self, file: &Path) -> Result<PathBuf> {
        let parent = file
            .parent()
            .with_context(|| format!("文件没有上级目录: {:?}", file))?;
        let dir = parent.join(&self.folder_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建目录失败: {:?}", dir))?;

        let destination = Self::free_destination(&dir, file)?;
        if tokio::fs::rename(file, &destination).await.is_err() {
            // 跨设备时退回复制 + 删除
            tokio::fs::copy(file, &destination)
                .await
                .with_context(|| format!("复制文件失败: {:?} -> {:?}", file, destination))?;
            tokio::fs::remove_file(file)
                .await
                .with_context(|| format!("删除源文件失败: {:?}", file))?;
        }

        info!("📁 文件已移动到: {:?}", destination);
        Ok(destination)
    }
}
