// 测试用的脚本化传输层

use crate::graph::{GraphRequest, GraphResponse, GraphTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

type Responder = dyn Fn(&GraphRequest, usize) -> Result<GraphResponse, TransportError> + Send + Sync;

/// 记录下来的请求（不保留数据本身）
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub fields: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub payload_len: usize,
}

impl RecordedRequest {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// 按闭包应答的传输层；闭包第二个参数是调用序号（从 0 开始）
pub struct ScriptedTransport {
    responder: Box<Responder>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&GraphRequest, usize) -> Result<GraphResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// 每次应答前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn count_where(&self, predicate: impl Fn(&RecordedRequest) -> bool) -> usize {
        self.requests.lock().iter().filter(|r| predicate(r)).count()
    }
}

#[async_trait]
impl GraphTransport for ScriptedTransport {
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse, TransportError> {
        let index = {
            let mut requests = self.requests.lock();
            requests.push(RecordedRequest {
                url: request.url.clone(),
                fields: request.fields.clone(),
                headers: request.headers.clone(),
                payload_len: request.payload_len(),
            });
            requests.len() - 1
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        (self.responder)(&request, index)
    }
}
