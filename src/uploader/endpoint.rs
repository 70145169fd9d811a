// 上传目标接口

use crate::config::GraphConfig;
use std::path::{Path, PathBuf};

/// 内容类型对应的上传接口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEndpoint {
    /// 普通视频 `/videos`
    Video,
    /// 短视频 `/video_reels`
    Reels,
    /// 快拍视频 `/video_stories`
    StoryVideo,
    /// 快拍图片 `/photos` + `/photo_stories`
    StoryPhoto,
}

/// 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStyle {
    /// upload_session_id + multipart 分片
    SessionChunks,
    /// start 返回 upload_url，原始字节流 + offset 请求头
    Hosted,
    /// 先上传未发布图片，再发布为快拍
    Photo,
}

impl ContentEndpoint {
    pub fn edge(&self) -> &'static str {
        match self {
            ContentEndpoint::Video => "videos",
            ContentEndpoint::Reels => "video_reels",
            ContentEndpoint::StoryVideo => "video_stories",
            ContentEndpoint::StoryPhoto => "photos",
        }
    }

    pub fn style(&self) -> TransferStyle {
        match self {
            ContentEndpoint::Video => TransferStyle::SessionChunks,
            ContentEndpoint::Reels | ContentEndpoint::StoryVideo => TransferStyle::Hosted,
            ContentEndpoint::StoryPhoto => TransferStyle::Photo,
        }
    }

    /// 接口地址；普通视频走视频专用域名
    pub fn url(&self, graph: &GraphConfig, page_id: &str) -> String {
        let base = match self {
            ContentEndpoint::Video => &graph.video_base_url,
            _ => &graph.graph_base_url,
        };
        edge_url(base, &graph.api_version, page_id, self.edge())
    }

    /// 发布阶段是否带标题/描述
    pub fn carries_metadata(&self) -> bool {
        matches!(self, ContentEndpoint::Video | ContentEndpoint::Reels)
    }
}

/// `{base}/{version}/{page_id}/{edge}`
pub fn edge_url(base: &str, api_version: &str, page_id: &str, edge: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        base.trim_end_matches('/'),
        api_version,
        page_id,
        edge
    )
}

/// 一次上传的输入
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub page_id: String,
    pub file_path: PathBuf,
    pub access_token: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub endpoint: ContentEndpoint,
    /// 分片大小覆盖（字节）
    pub chunk_size: Option<u64>,
}

impl UploadRequest {
    pub fn new(
        endpoint: ContentEndpoint,
        page_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            page_id: page_id.into(),
            file_path: file_path.into(),
            access_token: access_token.into(),
            title: None,
            description: None,
            endpoint,
            chunk_size: None,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title.filter(|t| !t.is_empty());
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.is_empty());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: Option<u64>) -> Self {
        self.chunk_size = chunk_size.filter(|s| *s > 0);
        self
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string())
    }
}

/// 按扩展名推断 MIME 类型
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let graph = GraphConfig::default();
        assert_eq!(
            ContentEndpoint::Video.url(&graph, "42"),
            "https://graph-video.facebook.com/v20.0/42/videos"
        );
        assert_eq!(
            ContentEndpoint::Reels.url(&graph, "42"),
            "https://graph.facebook.com/v20.0/42/video_reels"
        );
        assert_eq!(
            edge_url("http://127.0.0.1:9000/", "v1", "p", "photo_stories"),
            "http://127.0.0.1:9000/v1/p/photo_stories"
        );
    }

    #[test]
    fn test_styles() {
        assert_eq!(ContentEndpoint::Video.style(), TransferStyle::SessionChunks);
        assert_eq!(ContentEndpoint::StoryVideo.style(), TransferStyle::Hosted);
        assert_eq!(ContentEndpoint::StoryPhoto.style(), TransferStyle::Photo);
        assert!(!ContentEndpoint::StoryVideo.carries_metadata());
    }

    #[test]
    fn test_request_builders_drop_empty_values() {
        let req = UploadRequest::new(ContentEndpoint::Video, "1", "/tmp/a.MP4", "tok")
            .with_title(Some(String::new()))
            .with_description(Some("desc".into()))
            .with_chunk_size(Some(0));
        assert!(req.title.is_none());
        assert_eq!(req.description.as_deref(), Some("desc"));
        assert!(req.chunk_size.is_none());
        assert_eq!(req.file_name(), "a.MP4");
        assert_eq!(mime_for(&req.file_path), "video/mp4");
    }
}
