// Graph API 数据类型

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// 永久性错误码（令牌无效/过期、参数错误、权限不足），重试没有意义
pub const PERMANENT_ERROR_CODES: [i64; 3] = [190, 100, 200];

/// 限流错误码
pub const RATE_LIMIT_ERROR_CODES: [i64; 4] = [4, 17, 32, 613];

/// 错误响应中的 error 对象
///
/// `{"error": {"message": "...", "code": 4, "type": "OAuthException"}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_subcode: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl GraphErrorBody {
    /// 服务端给出的建议等待秒数
    pub fn retry_after(&self) -> Option<u64> {
        self.retry_after.or_else(|| {
            self.error_data
                .as_ref()
                .and_then(|d| d.get("retry_after"))
                .and_then(value_as_u64)
        })
    }

    pub fn kind(&self) -> GraphErrorKind {
        GraphErrorKind::from_code(self.code)
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// 限流（推迟，不计失败）
    RateLimited,
    /// 令牌无效或过期
    InvalidToken,
    /// 参数错误
    BadParameter,
    /// 权限不足
    PermissionDenied,
    /// 其他错误（可重试）
    Other,
}

impl GraphErrorKind {
    /// 从错误码转换
    pub fn from_code(code: i64) -> Self {
        match code {
            4 | 17 | 32 | 613 => GraphErrorKind::RateLimited,
            190 => GraphErrorKind::InvalidToken,
            100 => GraphErrorKind::BadParameter,
            200 => GraphErrorKind::PermissionDenied,
            _ => GraphErrorKind::Other,
        }
    }

    /// 是否为永久性错误
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            GraphErrorKind::InvalidToken
                | GraphErrorKind::BadParameter
                | GraphErrorKind::PermissionDenied
        )
    }
}

/// 一次 HTTP 调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct GraphResponse {
    /// HTTP 状态码
    pub status: u16,
    /// 响应体；非 JSON 时为 `Value::String`
    pub body: Value,
    /// `Retry-After` 响应头（秒）
    pub retry_after: Option<u64>,
}

impl GraphResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    /// 从原始文本构造，非 JSON 文本保留为字符串
    pub fn from_text(status: u16, text: &str, retry_after: Option<u64>) -> Self {
        let body = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        Self {
            status,
            body,
            retry_after,
        }
    }

    /// 2xx 且响应体是不含 error 的 JSON 对象
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
            && self.body.is_object()
            && self.body.get("error").is_none()
    }

    /// 解析 error 对象
    pub fn error(&self) -> Option<GraphErrorBody> {
        let error = self.body.get("error")?;
        match error {
            Value::Object(_) => serde_json::from_value(error.clone()).ok(),
            Value::String(message) => Some(GraphErrorBody {
                message: message.clone(),
                ..Default::default()
            }),
            _ => None,
        }
    }

    /// 服务端建议的等待秒数（响应头优先）
    pub fn server_retry_after(&self) -> Option<u64> {
        self.retry_after
            .or_else(|| self.error().and_then(|e| e.retry_after()))
    }

    /// 读取字符串字段（兼容数字）
    pub fn str_field(&self, key: &str) -> Option<String> {
        match self.body.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// 解析为指定结构
    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.body.clone()).ok()
    }
}

/// 分段上传 start 阶段响应
///
/// 视频接口返回 upload_session_id + offset；
/// 短视频/快拍接口返回 video_id + upload_url
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartSessionResponse {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub upload_session_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub video_id: Option<String>,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default, deserialize_with = "opt_u64_or_string")]
    pub start_offset: Option<u64>,
    #[serde(default, deserialize_with = "opt_u64_or_string")]
    pub end_offset: Option<u64>,
}

/// transfer 阶段响应（视频接口）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferChunkResponse {
    #[serde(default, deserialize_with = "opt_u64_or_string")]
    pub start_offset: Option<u64>,
    #[serde(default, deserialize_with = "opt_u64_or_string")]
    pub end_offset: Option<u64>,
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn opt_u64_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_u64))
}
