// 上传引擎
//
// 核心功能：
// 1. 小文件一次性上传，大文件走 start / transfer / finish 三阶段
// 2. 每个网络调用都和取消令牌竞争，取消后立即放弃在途请求
// 3. 分片上传失败时在分片内做有限重试（仅暂时性错误）
// 4. 响应分类：成功 / 限流 / 暂时性失败 / 永久性失败

use crate::config::{AppConfig, GraphConfig, UploadConfig};
use crate::governor::RateGovernor;
use crate::graph::{
    GraphErrorKind, GraphRequest, GraphResponse, GraphTransport, StartSessionResponse,
    TransferChunkResponse,
};
use crate::uploader::chunk::{read_chunk_at, ChunkPlan};
use crate::uploader::endpoint::{edge_url, mime_for, ContentEndpoint, TransferStyle};
use crate::uploader::retry::{sleep_cancellable, RetryPolicy};
use crate::uploader::{
    ProgressReporter, TransferOutcome, TransferResult, UploadPhase, UploadRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 中途失败时直接携带最终结果返回
type Step<T> = Result<T, TransferResult>;

/// 上传方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    SingleShot,
    Resumable,
}

/// 单文件上传客户端
pub struct TransferClient {
    transport: Arc<dyn GraphTransport>,
    governor: Arc<RateGovernor>,
    graph: GraphConfig,
    upload: UploadConfig,
    /// 分片内重试使用
    chunk_retry: RetryPolicy,
}

impl TransferClient {
    pub fn new(
        transport: Arc<dyn GraphTransport>,
        governor: Arc<RateGovernor>,
        config: &AppConfig,
    ) -> Self {
        Self {
            transport,
            governor,
            graph: config.graph.clone(),
            upload: config.upload.clone(),
            chunk_retry: RetryPolicy::from_config(config),
        }
    }

    /// 按文件大小选择上传方式
    pub fn choose_mode(&self, file_size: u64) -> UploadMode {
        if file_size <= self.upload.resumable_threshold() {
            UploadMode::SingleShot
        } else {
            UploadMode::Resumable
        }
    }

    /// 上传一个文件
    ///
    /// 预期内的失败都体现在返回值里，不会以错误形式抛出
    ///
    /// # 参数
    /// * `request` - 上传输入
    /// * `progress` - 进度上报
    /// * `cancel` - 取消令牌
    pub async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> TransferResult {
        if cancel.is_cancelled() {
            return TransferResult::cancelled();
        }

        let file_size = match tokio::fs::metadata(&request.file_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return TransferResult::local(
                    TransferOutcome::PermanentFailure,
                    format!("读取文件信息失败: {:?}, 错误: {}", request.file_path, e),
                )
            }
        };
        if file_size == 0 {
            return TransferResult::local(TransferOutcome::PermanentFailure, "文件为空");
        }

        let mode = self.choose_mode(file_size);
        info!(
            "开始上传: page={}, 文件={:?}, 大小={} bytes, 接口={}, 方式={:?}",
            request.page_id,
            request.file_path,
            file_size,
            request.endpoint.edge(),
            mode
        );

        let result = match (request.endpoint.style(), mode) {
            (TransferStyle::Photo, _) => self.upload_photo_story(request, progress, cancel).await,
            (TransferStyle::SessionChunks, UploadMode::SingleShot) => {
                self.upload_video_single(request, progress, cancel).await
            }
            (TransferStyle::SessionChunks, UploadMode::Resumable) => {
                self.upload_video_resumable(request, file_size, progress, cancel)
                    .await
            }
            (TransferStyle::Hosted, mode) => {
                self.upload_hosted(request, file_size, mode, progress, cancel)
                    .await
            }
        };

        let result = result.unwrap_or_else(|failure| failure);
        match result.outcome {
            TransferOutcome::Success => info!(
                "✅ 上传成功: 文件={:?}, id={:?}",
                request.file_path, result.content_id
            ),
            TransferOutcome::Cancelled => info!("上传已取消: 文件={:?}", request.file_path),
            _ => warn!(
                "上传未完成: 文件={:?}, 结果={:?}, 原因={}",
                request.file_path,
                result.outcome,
                result.describe()
            ),
        }
        result
    }

    // =====================================================
    // 普通视频
    // =====================================================

    async fn upload_video_single(
        &self,
        request: &UploadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Step<TransferResult> {
        let data = self.read_whole(request).await?;
        progress.report(UploadPhase::Start, 1.0);

        let mut form = GraphRequest::form(
            request.endpoint.url(&self.graph, &request.page_id),
            self.single_shot_timeout(),
        )
        .field("access_token", request.access_token.as_str());
        form = with_metadata(form, request);
        let form = form.file_part("source", &request.file_name(), mime_for(&request.file_path), data);

        let response = self.call(form, cancel).await?;
        progress.report(UploadPhase::Finish, 1.0);

        let content_id = response
            .str_field("id")
            .or_else(|| response.str_field("video_id"));
        Ok(TransferResult::success(&response, content_id))
    }

    async fn upload_video_resumable(
        &self,
        request: &UploadRequest,
        file_size: u64,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Step<TransferResult> {
        let url = request.endpoint.url(&self.graph, &request.page_id);

        // start
        progress.report(UploadPhase::Start, 0.0);
        let start = GraphRequest::form(url.as_str(), self.timeout(self.upload.start_timeout_secs))
            .field("access_token", request.access_token.as_str())
            .field("upload_phase", "start")
            .field("file_size", file_size.to_string());
        let response = self.call(start, cancel).await?;
        let session: StartSessionResponse = response.parse().unwrap_or_default();
        let session_id = session.upload_session_id.ok_or_else(|| {
            TransferResult::from_response(TransferOutcome::TransientFailure, &response)
                .with_message("start 响应缺少 upload_session_id")
        })?;
        progress.report(UploadPhase::Start, 1.0);
        debug!("上传会话已创建: session={}, video_id={:?}", session_id, session.video_id);

        // transfer
        let chunk_size = self.chunk_size_for(request);
        let mut plan = ChunkPlan::new(file_size, chunk_size);
        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferResult::cancelled());
            }
            let data = self.read_chunk(request, offset, chunk_size).await?;
            if data.is_empty() {
                break;
            }
            let len = data.len() as u64;

            let chunk = GraphRequest::form(url.as_str(), self.timeout(self.upload.transfer_timeout_secs))
                .field("access_token", request.access_token.as_str())
                .field("upload_phase", "transfer")
                .field("upload_session_id", session_id.as_str())
                .field("start_offset", offset.to_string())
                .file_part(
                    "video_file_chunk",
                    &request.file_name(),
                    "application/octet-stream",
                    data,
                );
            let response = self.call_with_chunk_retry(chunk, cancel).await?;

            plan.mark_completed_at(offset);
            offset += len;
            progress.report(UploadPhase::Transfer, offset as f64 / file_size as f64);

            let next: TransferChunkResponse = response.parse().unwrap_or_default();
            if let (Some(start), Some(end)) = (next.start_offset, next.end_offset) {
                if start == end {
                    debug!("服务端确认全部分片已接收: offset={}", start);
                    break;
                }
                if start != offset {
                    debug!("服务端偏移与本地不一致: 服务端={}, 本地={}", start, offset);
                }
            }
        }
        debug!(
            "分片传输完成: 已确认 {}/{} 个分片, {} bytes",
            plan.chunks().iter().filter(|c| c.completed).count(),
            plan.chunk_count(),
            plan.uploaded_bytes()
        );

        // finish
        if cancel.is_cancelled() {
            return Err(TransferResult::cancelled());
        }
        let mut finish = GraphRequest::form(url.as_str(), self.timeout(self.upload.finish_timeout_secs))
            .field("access_token", request.access_token.as_str())
            .field("upload_phase", "finish")
            .field("upload_session_id", session_id.as_str())
            .field("published", "true");
        finish = with_metadata(finish, request);
        let response = self.call(finish, cancel).await?;
        progress.report(UploadPhase::Finish, 1.0);

        let content_id = session.video_id.or_else(|| response.str_field("id"));
        Ok(TransferResult::success(&response, content_id))
    }

    // =====================================================
    // 短视频 / 快拍视频（托管上传地址）
    // =====================================================

    async fn upload_hosted(
        &self,
        request: &UploadRequest,
        file_size: u64,
        mode: UploadMode,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Step<TransferResult> {
        let url = request.endpoint.url(&self.graph, &request.page_id);

        // start
        progress.report(UploadPhase::Start, 0.0);
        let start = GraphRequest::form(url.as_str(), self.timeout(self.upload.start_timeout_secs))
            .field("access_token", request.access_token.as_str())
            .field("upload_phase", "start");
        let response = self.call(start, cancel).await?;
        let session: StartSessionResponse = response.parse().unwrap_or_default();
        let (video_id, upload_url) = match (session.video_id, session.upload_url) {
            (Some(id), Some(url)) => (id, url),
            _ => {
                return Err(TransferResult::from_response(
                    TransferOutcome::TransientFailure,
                    &response,
                )
                .with_message("start 响应缺少 video_id 或 upload_url"))
            }
        };
        progress.report(UploadPhase::Start, 1.0);
        debug!("托管上传地址已创建: video_id={}", video_id);

        // transfer
        let chunk_size = match mode {
            UploadMode::SingleShot => file_size,
            UploadMode::Resumable => self.chunk_size_for(request),
        };
        let mut plan = ChunkPlan::new(file_size, chunk_size);
        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferResult::cancelled());
            }
            let data = self.read_chunk(request, offset, chunk_size).await?;
            if data.is_empty() {
                break;
            }
            let len = data.len() as u64;

            let chunk = GraphRequest::form(upload_url.as_str(), self.transfer_timeout_for(mode))
                .header("Authorization", format!("OAuth {}", request.access_token))
                .header("offset", offset.to_string())
                .header("file_size", file_size.to_string())
                .raw(data);
            self.call_with_chunk_retry(chunk, cancel).await?;

            plan.mark_completed_at(offset);
            offset += len;
            progress.report(UploadPhase::Transfer, plan.fraction());
        }

        // finish
        if cancel.is_cancelled() {
            return Err(TransferResult::cancelled());
        }
        let mut finish = GraphRequest::form(url.as_str(), self.timeout(self.upload.finish_timeout_secs))
            .field("access_token", request.access_token.as_str())
            .field("upload_phase", "finish")
            .field("video_id", video_id.as_str());
        if request.endpoint == ContentEndpoint::Reels {
            finish = finish.field("video_state", "PUBLISHED");
        }
        if request.endpoint.carries_metadata() {
            finish = with_metadata(finish, request);
        }
        let response = self.call(finish, cancel).await?;
        progress.report(UploadPhase::Finish, 1.0);

        Ok(TransferResult::success(&response, Some(video_id)))
    }

    // =====================================================
    // 快拍图片
    // =====================================================

    async fn upload_photo_story(
        &self,
        request: &UploadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Step<TransferResult> {
        let data = self.read_whole(request).await?;
        progress.report(UploadPhase::Start, 1.0);

        // 先上传为未发布的临时图片
        let photo = GraphRequest::form(
            request.endpoint.url(&self.graph, &request.page_id),
            self.single_shot_timeout(),
        )
        .field("access_token", request.access_token.as_str())
        .field("published", "false")
        .field("temporary", "true")
        .file_part("source", &request.file_name(), mime_for(&request.file_path), data);
        let response = self.call(photo, cancel).await?;
        let photo_id = response.str_field("id").ok_or_else(|| {
            TransferResult::from_response(TransferOutcome::TransientFailure, &response)
                .with_message("图片上传响应缺少 id")
        })?;
        progress.report(UploadPhase::Transfer, 1.0);

        // 发布为快拍
        if cancel.is_cancelled() {
            return Err(TransferResult::cancelled());
        }
        let publish = GraphRequest::form(
            edge_url(
                &self.graph.graph_base_url,
                &self.graph.api_version,
                &request.page_id,
                "photo_stories",
            ),
            self.timeout(self.upload.finish_timeout_secs),
        )
        .field("access_token", request.access_token.as_str())
        .field("photo_id", photo_id.as_str());
        let response = self.call(publish, cancel).await?;
        progress.report(UploadPhase::Finish, 1.0);

        let content_id = response
            .str_field("post_id")
            .or_else(|| response.str_field("id"))
            .or(Some(photo_id));
        Ok(TransferResult::success(&response, content_id))
    }

    // =====================================================
    // 网络调用与分类
    // =====================================================

    /// 发送请求，与取消令牌竞争；非成功响应转换为失败结果
    async fn call(&self, request: GraphRequest, cancel: &CancellationToken) -> Step<GraphResponse> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferResult::cancelled()),
            response = self.transport.send(request) => response,
        };

        match response {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(self.classify_failure(&response)),
            Err(e) => {
                warn!("请求失败: {}", e);
                Err(TransferResult::transport(&e))
            }
        }
    }

    /// 分片调用：暂时性失败在分片内重试，限流和永久失败直接返回
    async fn call_with_chunk_retry(
        &self,
        request: GraphRequest,
        cancel: &CancellationToken,
    ) -> Step<GraphResponse> {
        let max_attempts = self.chunk_retry.max_attempts;
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferResult::cancelled());
            }
            match self.call(request.clone(), cancel).await {
                Ok(response) => return Ok(response),
                Err(failure)
                    if failure.outcome == TransferOutcome::TransientFailure
                        && attempt < max_attempts =>
                {
                    let backoff = self.chunk_retry.backoff_for(attempt);
                    warn!(
                        "分片上传失败 (第 {}/{} 次)，{} 秒后重试: {}",
                        attempt,
                        max_attempts,
                        backoff.as_secs_f64(),
                        failure.describe()
                    );
                    if !sleep_cancellable(backoff, self.chunk_retry.sleep_slice, cancel).await {
                        return Err(TransferResult::cancelled());
                    }
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    /// 失败响应分类
    pub fn classify_failure(&self, response: &GraphResponse) -> TransferResult {
        let error = response.error();

        let outcome = if self.governor.is_rate_limited(response.status, error.as_ref()) {
            TransferOutcome::RateLimited
        } else if error
            .as_ref()
            .map(|e| GraphErrorKind::from_code(e.code).is_permanent())
            .unwrap_or(false)
        {
            TransferOutcome::PermanentFailure
        } else {
            TransferOutcome::TransientFailure
        };

        debug!(
            "响应分类: status={}, code={:?}, 结果={:?}",
            response.status,
            error.as_ref().map(|e| e.code),
            outcome
        );
        TransferResult::from_response(outcome, response)
    }

    // =====================================================
    // 辅助
    // =====================================================

    async fn read_whole(&self, request: &UploadRequest) -> Step<Vec<u8>> {
        tokio::fs::read(&request.file_path).await.map_err(|e| {
            TransferResult::local(
                TransferOutcome::PermanentFailure,
                format!("读取文件失败: {:?}, 错误: {}", request.file_path, e),
            )
        })
    }

    async fn read_chunk(&self, request: &UploadRequest, offset: u64, len: u64) -> Step<Vec<u8>> {
        read_chunk_at(&request.file_path, offset, len)
            .await
            .map_err(|e| TransferResult::local(TransferOutcome::PermanentFailure, format!("{:#}", e)))
    }

    fn chunk_size_for(&self, request: &UploadRequest) -> u64 {
        request.chunk_size.unwrap_or_else(|| self.upload.chunk_size())
    }

    fn timeout(&self, secs: u64) -> Duration {
        Duration::from_secs(secs.max(1))
    }

    fn single_shot_timeout(&self) -> Duration {
        self.timeout(self.upload.single_shot_timeout_secs)
    }

    fn transfer_timeout_for(&self, mode: UploadMode) -> Duration {
        match mode {
            UploadMode::SingleShot => self.single_shot_timeout(),
            UploadMode::Resumable => self.timeout(self.upload.transfer_timeout_secs),
        }
    }
}

fn with_metadata(mut request: GraphRequest, upload: &UploadRequest) -> GraphRequest {
    if let Some(title) = &upload.title {
        request = request.field("title", title.as_str());
    }
    if let Some(description) = &upload.description {
        request = request.field("description", description.as_str());
    }
    request
}
