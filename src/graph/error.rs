use thiserror::Error;

/// 传输层错误
///
/// 只描述"请求没有拿到响应"的情况；拿到响应后的业务错误
/// 通过 `GraphResponse::error()` 解析
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("连接失败: {0}")]
    Connect(String),

    #[error("请求失败: {0}")]
    Request(String),

    #[error("本地文件读取失败: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// 是否属于网络层问题（需要检测连通性）
    pub fn is_network(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }

    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        !matches!(self, TransportError::Io(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}
