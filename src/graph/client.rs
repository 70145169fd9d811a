// Graph API 客户端实现

use crate::config::GraphConfig;
use crate::graph::{GraphResponse, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// 请求体形式
#[derive(Clone)]
pub enum RequestBody {
    /// application/x-www-form-urlencoded
    Form,
    /// multipart/form-data，附带一个文件部分
    Multipart {
        field: String,
        file_name: String,
        mime: String,
        data: Vec<u8>,
    },
    /// 原始字节流（托管上传地址使用），表单字段走查询参数
    Raw { data: Vec<u8> },
}

/// 一次 Graph 调用
#[derive(Clone)]
pub struct GraphRequest {
    pub url: String,
    pub fields: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

impl GraphRequest {
    /// 创建表单请求
    pub fn form(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            fields: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Form,
            timeout,
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// 附带文件部分（multipart）
    pub fn file_part(mut self, field: &str, file_name: &str, mime: &str, data: Vec<u8>) -> Self {
        self.body = RequestBody::Multipart {
            field: field.to_string(),
            file_name: file_name.to_string(),
            mime: mime.to_string(),
            data,
        };
        self
    }

    /// 原始字节流
    pub fn raw(mut self, data: Vec<u8>) -> Self {
        self.body = RequestBody::Raw { data };
        self
    }

    /// 表单字段取值
    pub fn field_value(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// 请求携带的数据字节数
    pub fn payload_len(&self) -> usize {
        match &self.body {
            RequestBody::Form => 0,
            RequestBody::Multipart { data, .. } | RequestBody::Raw { data } => data.len(),
        }
    }
}

impl fmt::Debug for GraphRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 令牌不进日志
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| {
                if k == "access_token" {
                    format!("{}=***", k)
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect();
        f.debug_struct("GraphRequest")
            .field("url", &self.url)
            .field("fields", &fields)
            .field("payload_len", &self.payload_len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Graph API 传输层
///
/// 上传引擎只依赖这个 trait，测试中用脚本化的实现替换
#[async_trait]
pub trait GraphTransport: Send + Sync {
    /// 发送请求；拿到任何 HTTP 响应都返回 Ok，由调用方判断业务结果
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse, TransportError>;
}

/// 基于 reqwest 的 Graph API 客户端
#[derive(Debug, Clone)]
pub struct GraphClient {
    client: Client,
}

impl GraphClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `config` - Graph API 配置（默认超时）
    pub fn new(config: &GraphConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl GraphTransport for GraphClient {
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse, TransportError> {
        debug!("发送 Graph 请求: {:?}", request);

        let GraphRequest {
            url,
            fields,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self.client.post(&url).timeout(timeout);
        for (key, value) in &headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        builder = match body {
            RequestBody::Form => builder.form(&fields),
            RequestBody::Multipart {
                field,
                file_name,
                mime,
                data,
            } => {
                let mut form = multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                let part = multipart::Part::bytes(data)
                    .file_name(file_name)
                    .mime_str(&mime)?;
                builder.multipart(form.part(field, part))
            }
            RequestBody::Raw { data } => builder.query(&fields).body(data),
        };

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await?;

        debug!("Graph 响应: url={}, status={}, body={}", url, status, text);

        Ok(GraphResponse::from_text(status, &text, retry_after))
    }
}
