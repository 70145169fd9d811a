// Page Uploader
// 社交主页媒体定时上传引擎核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// Graph API 访问层
pub mod graph;

// 限流与配额模块
pub mod governor;

// 上传引擎模块
pub mod uploader;

// 任务模块（状态机、注册表、文件选择）
pub mod job;

// 🔥 调度模块
pub mod scheduler;

// 导出常用类型
pub use config::AppConfig;
pub use governor::{QuotaBook, QuotaTracker, RateGovernor};
pub use graph::{GraphClient, GraphTransport};
pub use job::{Job, JobKey, JobKind, JobRegistry, JobType};
pub use scheduler::{EngineContext, SchedulerLoop, StatusEvent, StatusSink};
pub use uploader::{RetryDriver, TransferClient, TransferOutcome, TransferResult};
