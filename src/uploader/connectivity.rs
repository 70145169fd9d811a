// 网络连通性检测

use crate::config::ConnectivityConfig;
use crate::uploader::retry::sleep_cancellable;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 连通性探测
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// TCP 直连探测：任意一个地址连通即视为在线
#[derive(Debug, Clone)]
pub struct TcpConnectivityProbe {
    hosts: Vec<String>,
    timeout: Duration,
}

impl TcpConnectivityProbe {
    pub fn new(config: &ConnectivityConfig) -> Self {
        Self {
            hosts: config.hosts.clone(),
            timeout: Duration::from_secs(config.probe_timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpConnectivityProbe {
    async fn is_online(&self) -> bool {
        for host in &self.hosts {
            match tokio::time::timeout(self.timeout, TcpStream::connect(host.as_str())).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => debug!("连通性探测失败: {}, 错误: {}", host, e),
                Err(_) => debug!("连通性探测超时: {}", host),
            }
        }
        false
    }
}

/// 始终在线（关闭检测时使用）
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// 等待网络恢复的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityWait {
    Online,
    TimedOut,
    Cancelled,
}

/// 断网时循环检测，直到恢复、超过最大次数或被取消
///
/// # 参数
/// * `probe` - 探测实现
/// * `interval` - 两次检测间隔
/// * `max_checks` - 最大检测次数
/// * `slice` - 可中断睡眠切片
/// * `cancel` - 取消令牌
pub async fn wait_for_connectivity(
    probe: &dyn ConnectivityProbe,
    interval: Duration,
    max_checks: u32,
    slice: Duration,
    cancel: &CancellationToken,
) -> ConnectivityWait {
    for check in 1..=max_checks.max(1) {
        if cancel.is_cancelled() {
            return ConnectivityWait::Cancelled;
        }
        if probe.is_online().await {
            if check > 1 {
                info!("✅ 网络已恢复");
            }
            return ConnectivityWait::Online;
        }
        warn!(
            "🌐 网络不可用，{} 秒后重新检测 ({}/{})",
            interval.as_secs(),
            check,
            max_checks
        );
        if !sleep_cancellable(interval, slice, cancel).await {
            return ConnectivityWait::Cancelled;
        }
    }

    if probe.is_online().await {
        ConnectivityWait::Online
    } else {
        ConnectivityWait::TimedOut
    }
}
