// 上传分片管理
//
// 分段上传按固定大小顺序读取文件，本地已上传字节数只在服务端确认后推进，
// 不从服务端反推

use anyhow::{Context, Result};
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// 默认分片大小: 32MB
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// 最小分片大小: 1MB
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// 上传分片信息
#[derive(Debug, Clone, PartialEq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否已被服务端确认
    pub completed: bool,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            completed: false,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 分片计划
#[derive(Debug)]
pub struct ChunkPlan {
    chunks: Vec<UploadChunk>,
    total_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// 创建分片计划
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小（0 视为 1 字节以避免死循环）
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = Self::calculate_chunks(total_size, chunk_size);

        info!(
            "创建分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Self {
            chunks,
            total_size,
            chunk_size,
        }
    }

    fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        let mut chunks = Vec::new();
        let mut offset = 0u64;
        let mut index = 0;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            chunks.push(UploadChunk::new(index, offset..end));
            offset = end;
            index += 1;
        }

        chunks
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 标记从 `offset` 开始的分片为已确认，返回分片索引
    pub fn mark_completed_at(&mut self, offset: u64) -> Option<usize> {
        let chunk = self.chunks.iter_mut().find(|c| c.range.start == offset)?;
        chunk.completed = true;
        Some(chunk.index)
    }

    /// 已确认的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.completed)
            .map(|c| c.size())
            .sum()
    }

    /// 已确认比例（0.0 - 1.0）
    pub fn fraction(&self) -> f64 {
        if self.total_size == 0 {
            return 1.0;
        }
        self.uploaded_bytes() as f64 / self.total_size as f64
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }
}

/// 从 `offset` 开始读取最多 `max_len` 字节
///
/// 到达文件末尾时返回的数据可能不足 `max_len`，超出末尾时返回空
pub async fn read_chunk_at(file_path: &Path, offset: u64, max_len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(file_path).await.context("打开上传文件失败")?;

    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .context("文件定位失败")?;

    let mut buffer = Vec::with_capacity(max_len.min(DEFAULT_CHUNK_SIZE * 2) as usize);
    file.take(max_len)
        .read_to_end(&mut buffer)
        .await
        .context("读取分片数据失败")?;

    debug!(
        "读取分片: offset={}, 请求={} bytes, 实际={} bytes",
        offset,
        max_len,
        buffer.len()
    );

    Ok(buffer)
}
