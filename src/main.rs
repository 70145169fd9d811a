use page_uploader::{
    config::AppConfig,
    logging,
    scheduler::{StatusEvent, StatusSink},
    EngineContext, GraphClient, JobRegistry, JobType, SchedulerLoop,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 任务表自动保存间隔
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(60);

/// 周期性保存任务表（游标和下次运行时间会在运行中变化）
fn spawn_autosave(
    registry: Arc<JobRegistry>,
    path: PathBuf,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(AUTOSAVE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = registry.save_to_file(&path).await {
                        warn!("自动保存任务表失败: {:#}", e);
                    }
                }
            }
        }
    })
}

/// 状态事件消费者：没有界面时只做调试输出
fn spawn_status_consumer(mut rx: mpsc::UnboundedReceiver<StatusEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            debug!(
                "状态事件 [{}] {:?}/{:?}: {}",
                event.page_name, event.kind, event.level, event.message
            );
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 先加载配置，失败时使用默认配置
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Page Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));
    if let Err(e) = config.validate() {
        error!("配置无效: {:#}", e);
        return Err(e);
    }

    let config = Arc::new(config);
    let jobs_file = config.scheduler.jobs_file.clone();
    let registry = Arc::new(JobRegistry::load_from_file(&jobs_file, chrono::Utc::now()).await?);
    info!("已加载 {} 个任务", registry.len());

    let transport = Arc::new(GraphClient::new(&config.graph)?);
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    spawn_status_consumer(status_rx);

    let ctx = EngineContext::new(config.clone(), registry.clone(), transport)
        .with_status(StatusSink::new(status_tx));

    let loops: Vec<SchedulerLoop> = [JobType::Video, JobType::Story, JobType::Reels]
        .into_iter()
        .map(|job_type| SchedulerLoop::new(job_type, ctx.clone()))
        .collect();
    for scheduler in &loops {
        scheduler.start();
    }

    let autosave_cancel = CancellationToken::new();
    let autosave = spawn_autosave(registry.clone(), jobs_file.clone(), autosave_cancel.clone());

    info!("调度器已启动，按 Ctrl+C 退出");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("监听退出信号失败: {}", e);
    }
    info!("收到 Ctrl+C，开始优雅关闭...");

    // 🔥 优雅关闭：先停调度循环，再保存任务表
    futures::future::join_all(loops.iter().map(|scheduler| scheduler.stop())).await;
    for scheduler in &loops {
        info!(
            "{}调度统计: {:?}",
            scheduler.job_type().label(),
            scheduler.stats()
        );
    }
    autosave_cancel.cancel();
    let _ = autosave.await;

    registry.save_to_file(&jobs_file).await?;
    info!("任务表已保存: {:?}", jobs_file);
    Ok(())
}
