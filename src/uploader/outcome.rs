// 上传结果

use crate::graph::{GraphErrorBody, GraphResponse, TransportError};
use serde::Serialize;
use serde_json::Value;

/// 上传结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferOutcome {
    Success,
    /// 被限流，调度器负责推迟，不计入失败
    RateLimited,
    /// 被取消（不是错误）
    Cancelled,
    /// 可重试的失败（超时、连接错误、5xx 等）
    TransientFailure,
    /// 重试无意义的失败（令牌、参数、权限、本地文件问题）
    PermanentFailure,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TransferOutcome::TransientFailure | TransferOutcome::PermanentFailure
        )
    }
}

/// 一次上传的结构化结果
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub outcome: TransferOutcome,
    /// 最后一次响应的 HTTP 状态码
    pub status: Option<u16>,
    /// 最后一次响应的响应体
    pub body: Option<Value>,
    /// 服务端错误对象
    pub error: Option<GraphErrorBody>,
    /// 服务端建议的等待秒数
    pub retry_after: Option<u64>,
    /// 是否为网络层错误（需要检测连通性）
    pub network_error: bool,
    /// 本地描述
    pub message: Option<String>,
    /// 发布成功后的内容 ID
    pub content_id: Option<String>,
}

impl TransferResult {
    fn empty(outcome: TransferOutcome) -> Self {
        Self {
            outcome,
            status: None,
            body: None,
            error: None,
            retry_after: None,
            network_error: false,
            message: None,
            content_id: None,
        }
    }

    pub fn success(response: &GraphResponse, content_id: Option<String>) -> Self {
        Self {
            content_id,
            ..Self::from_response(TransferOutcome::Success, response)
        }
    }

    pub fn from_response(outcome: TransferOutcome, response: &GraphResponse) -> Self {
        Self {
            status: Some(response.status),
            body: Some(response.body.clone()),
            error: response.error(),
            retry_after: response.server_retry_after(),
            ..Self::empty(outcome)
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: Some("上传已取消".to_string()),
            ..Self::empty(TransferOutcome::Cancelled)
        }
    }

    /// 没有拿到响应
    pub fn transport(error: &TransportError) -> Self {
        let outcome = if error.is_retriable() {
            TransferOutcome::TransientFailure
        } else {
            TransferOutcome::PermanentFailure
        };
        Self {
            network_error: error.is_network(),
            message: Some(error.to_string()),
            ..Self::empty(outcome)
        }
    }

    /// 本地产生的失败
    pub fn local(outcome: TransferOutcome, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty(outcome)
        }
    }

    /// 附加本地描述
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// 服务端错误码
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }

    /// 可读的失败描述
    pub fn describe(&self) -> String {
        if let Some(error) = &self.error {
            if !error.message.is_empty() {
                return format!("{} (code={})", error.message, error.code);
            }
        }
        if let Some(message) = &self.message {
            return message.clone();
        }
        match self.status {
            Some(status) => format!("HTTP {}", status),
            None => format!("{:?}", self.outcome),
        }
    }
}
