// 上传重试驱动
//
// 在 TransferClient 外层做有限次重试：
// - 暂时性失败：等待 attempt × 步长 后重试
// - 限流：交给 RateGovernor 计算等待时间，原地等待有上限，不消耗重试次数
// - 永久性失败 / 取消：立即返回
// - 断网：先等待网络恢复再重试

use crate::config::AppConfig;
use crate::governor::RateGovernor;
use crate::uploader::connectivity::{wait_for_connectivity, ConnectivityProbe, ConnectivityWait};
use crate::uploader::{
    ProgressReporter, TransferClient, TransferOutcome, TransferResult, UploadRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 可中断睡眠
///
/// 按切片睡眠，每个切片内都响应取消
///
/// # 返回
/// 完整睡完返回 true，被取消返回 false
pub async fn sleep_cancellable(
    duration: Duration,
    slice: Duration,
    cancel: &CancellationToken,
) -> bool {
    let slice = slice.max(Duration::from_millis(1));
    let mut remaining = duration;

    while !remaining.is_zero() {
        let step = remaining.min(slice);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(step) => {}
        }
        remaining = remaining.saturating_sub(step);
    }

    !cancel.is_cancelled()
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 退避步长
    pub backoff_step: Duration,
    /// 原地等待限流的最大次数
    pub max_rate_limit_waits: u32,
    /// 原地等待限流的最长时间
    pub max_inline_rate_limit_wait: Duration,
    /// 睡眠切片
    pub sleep_slice: Duration,
    /// 是否在每次尝试前检测网络
    pub check_connectivity: bool,
    /// 断网时的检测间隔
    pub connectivity_interval: Duration,
    /// 断网时的最大检测次数
    pub connectivity_max_checks: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts.max(1),
            backoff_step: Duration::from_secs(config.retry.backoff_step_secs),
            max_rate_limit_waits: config.retry.max_rate_limit_waits,
            max_inline_rate_limit_wait: Duration::from_secs(
                config.retry.max_inline_rate_limit_wait_secs,
            ),
            sleep_slice: Duration::from_millis(config.retry.sleep_slice_ms.max(1)),
            check_connectivity: config.scheduler.check_connectivity,
            connectivity_interval: Duration::from_secs(config.connectivity.check_interval_secs),
            connectivity_max_checks: config.connectivity.max_wait_attempts,
        }
    }

    /// 第 `attempt` 次失败后的退避时间
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 重试过程统计
#[derive(Debug, Clone)]
pub struct RetryReport {
    /// 最终结果
    pub result: TransferResult,
    /// 消耗的重试次数（限流不计）
    pub attempts: u32,
    /// TransferClient 实际调用次数
    pub calls: u32,
    /// 暂时性失败后的退避睡眠次数
    pub backoff_sleeps: u32,
    /// 原地等待限流的次数
    pub rate_limit_waits: u32,
    /// 等待网络恢复的次数
    pub connectivity_waits: u32,
}

impl RetryReport {
    pub fn outcome(&self) -> TransferOutcome {
        self.result.outcome
    }
}

/// 上传重试驱动
#[derive(Clone)]
pub struct RetryDriver {
    client: Arc<TransferClient>,
    governor: Arc<RateGovernor>,
    probe: Arc<dyn ConnectivityProbe>,
    policy: RetryPolicy,
}

impl RetryDriver {
    pub fn new(
        client: Arc<TransferClient>,
        governor: Arc<RateGovernor>,
        probe: Arc<dyn ConnectivityProbe>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            governor,
            probe,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行上传（含重试）
    pub async fn run(
        &self,
        request: &UploadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> RetryReport {
        let mut report = RetryReport {
            result: TransferResult::local(TransferOutcome::TransientFailure, "未执行上传"),
            attempts: 0,
            calls: 0,
            backoff_sleeps: 0,
            rate_limit_waits: 0,
            connectivity_waits: 0,
        };

        loop {
            if cancel.is_cancelled() {
                report.result = TransferResult::cancelled();
                return report;
            }
            if report.attempts >= self.policy.max_attempts {
                warn!(
                    "上传失败，已达最大重试次数 {}: {}",
                    self.policy.max_attempts,
                    report.result.describe()
                );
                return report;
            }

            if self.policy.check_connectivity && !self.probe.is_online().await {
                report.connectivity_waits += 1;
                match wait_for_connectivity(
                    self.probe.as_ref(),
                    self.policy.connectivity_interval,
                    self.policy.connectivity_max_checks,
                    self.policy.sleep_slice,
                    cancel,
                )
                .await
                {
                    ConnectivityWait::Online => {}
                    ConnectivityWait::Cancelled => {
                        report.result = TransferResult::cancelled();
                        return report;
                    }
                    ConnectivityWait::TimedOut => {
                        report.attempts += 1;
                        report.result = TransferResult::local(
                            TransferOutcome::TransientFailure,
                            "网络长时间不可用",
                        );
                        report.result.network_error = true;
                        continue;
                    }
                }
            }

            report.calls += 1;
            let result = self.client.upload(request, progress, cancel).await;

            match result.outcome {
                TransferOutcome::Success => {
                    self.governor.reset();
                    report.attempts += 1;
                    report.result = result;
                    return report;
                }
                TransferOutcome::Cancelled => {
                    report.result = result;
                    return report;
                }
                TransferOutcome::PermanentFailure => {
                    report.attempts += 1;
                    warn!("永久性错误，不再重试: {}", result.describe());
                    report.result = result;
                    return report;
                }
                TransferOutcome::RateLimited => {
                    let wait = self.governor.record_rate_limit(result.retry_after);
                    let inline_allowed = report.rate_limit_waits < self.policy.max_rate_limit_waits
                        && wait <= self.policy.max_inline_rate_limit_wait;
                    if !inline_allowed {
                        report.result = result;
                        return report;
                    }

                    report.rate_limit_waits += 1;
                    info!(
                        "限流，原地等待 {} 秒后重试 ({}/{})",
                        wait.as_secs(),
                        report.rate_limit_waits,
                        self.policy.max_rate_limit_waits
                    );
                    report.result = result;
                    if !sleep_cancellable(wait, self.policy.sleep_slice, cancel).await {
                        report.result = TransferResult::cancelled();
                        return report;
                    }
                }
                TransferOutcome::TransientFailure => {
                    report.attempts += 1;
                    warn!(
                        "上传失败 (第 {}/{} 次): {}",
                        report.attempts,
                        self.policy.max_attempts,
                        result.describe()
                    );
                    report.result = result;

                    if report.attempts < self.policy.max_attempts {
                        let backoff = self.policy.backoff_for(report.attempts);
                        report.backoff_sleeps += 1;
                        info!("{} 秒后重试", backoff.as_secs_f64());
                        if !sleep_cancellable(backoff, self.policy.sleep_slice, cancel).await {
                            report.result = TransferResult::cancelled();
                            return report;
                        }
                    }
                }
            }
        }
    }
}
