//! 媒体文件扫描与选择
//!
//! 只扫描任务目录第一层；隐藏文件、子目录（包括已上传目录）都不参与

use super::model::{JobType, SortPolicy};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// 视频扩展名（视频与 Reels 任务）
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];

/// 图片扩展名（仅快拍任务）
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_image(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_video(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// 该任务类型是否支持此文件
pub fn is_supported(job_type: JobType, path: &Path) -> bool {
    match job_type {
        JobType::Video | JobType::Reels => is_video(path),
        JobType::Story => is_video(path) || is_image(path),
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// 媒体目录扫描器
#[derive(Debug, Clone)]
pub struct MediaScanner {
    folder: PathBuf,
    job_type: JobType,
    sort_by: SortPolicy,
}

impl MediaScanner {
    pub fn new(folder: impl Into<PathBuf>, job_type: JobType, sort_by: SortPolicy) -> Self {
        Self {
            folder: folder.into(),
            job_type,
            sort_by,
        }
    }

    /// 扫描并按策略排序，目录不存在时返回空列表
    pub fn scan_collect(&self) -> Vec<PathBuf> {
        if !self.folder.is_dir() {
            return Vec::new();
        }

        let mut files: Vec<(PathBuf, Option<std::fs::Metadata>)> = walkdir::WalkDir::new(&self.folder)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let metadata = entry.metadata().ok();
                (entry.into_path(), metadata)
            })
            .filter(|(path, _)| !is_hidden(path) && is_supported(self.job_type, path))
            .collect();

        match self.sort_by {
            SortPolicy::Name => files.sort_by_key(|(path, _)| name_key(path)),
            SortPolicy::Random => files.shuffle(&mut rand::thread_rng()),
            SortPolicy::DateCreated => files.sort_by_key(|(path, meta)| {
                let created = meta
                    .as_ref()
                    .and_then(|m| m.created().or_else(|_| m.modified()).ok());
                (created.unwrap_or(SystemTime::UNIX_EPOCH), name_key(path))
            }),
            SortPolicy::DateModified => files.sort_by_key(|(path, meta)| {
                let modified = meta.as_ref().and_then(|m| m.modified().ok());
                (modified.unwrap_or(SystemTime::UNIX_EPOCH), name_key(path))
            }),
        }

        files.into_iter().map(|(path, _)| path).collect()
    }

    /// 在阻塞线程池中扫描
    pub async fn scan_async(&self) -> anyhow::Result<Vec<PathBuf>> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan_collect())
            .await
            .map_err(|e| anyhow::anyhow!("扫描媒体目录失败: {}", e))
    }
}

fn name_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// 按游标取文件，返回 (实际下标, 路径)
pub fn pick_next(files: &[PathBuf], cursor: usize) -> Option<(usize, &PathBuf)> {
    if files.is_empty() {
        return None;
    }
    let index = cursor % files.len();
    Some((index, &files[index]))
}

/// 从游标开始取最多 `count` 个文件，到末尾后回绕
pub fn story_batch(files: &[PathBuf], cursor: usize, count: usize) -> Vec<PathBuf> {
    if files.is_empty() {
        return Vec::new();
    }
    let take = count.max(1).min(files.len());
    let start = cursor % files.len();
    (0..take)
        .map(|offset| files[(start + offset) % files.len()].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"data").unwrap();
    }

    #[test]
    fn test_extension_checks() {
        assert!(is_video(Path::new("/a/clip.MP4")));
        assert!(is_image(Path::new("x.webp")));
        assert!(!is_supported(JobType::Reels, Path::new("x.jpg")));
        assert!(is_supported(JobType::Story, Path::new("x.jpg")));
        assert!(!is_supported(JobType::Video, Path::new("noext")));
    }

    #[test]
    fn test_scan_filters_and_sorts_by_name() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "b.mp4");
        touch(dir.path(), "A.mov");
        touch(dir.path(), "c.txt");
        touch(dir.path(), ".hidden.mp4");
        touch(dir.path(), "photo.jpg");
        fs::create_dir(dir.path().join("Uploaded")).unwrap();
        touch(&dir.path().join("Uploaded"), "old.mp4");

        let files = MediaScanner::new(dir.path(), JobType::Video, SortPolicy::Name).scan_collect();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["A.mov", "b.mp4"]);

        let story = MediaScanner::new(dir.path(), JobType::Story, SortPolicy::Random).scan_collect();
        assert_eq!(story.len(), 3);
    }

    #[test]
    fn test_missing_folder_is_empty() {
        let scanner = MediaScanner::new("/definitely/not/here", JobType::Video, SortPolicy::Name);
        assert!(scanner.scan_collect().is_empty());
    }

    #[tokio::test]
    async fn test_scan_async() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "one.mp4");
        let files = MediaScanner::new(dir.path(), JobType::Reels, SortPolicy::DateModified)
            .scan_async()
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_pick_and_batch_wrap() {
        let files: Vec<PathBuf> = ["a", "b", "c"].iter().map(PathBuf::from).collect();
        assert_eq!(pick_next(&files, 4).unwrap().0, 1);
        assert!(pick_next(&[], 0).is_none());

        let batch = story_batch(&files, 2, 2);
        assert_eq!(batch, vec![PathBuf::from("c"), PathBuf::from("a")]);
        assert_eq!(story_batch(&files, 0, 10).len(), 3);
        assert!(story_batch(&[], 0, 3).is_empty());
    }
}
