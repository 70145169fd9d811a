// 调度模块
//
// - SchedulerLoop：每种内容类型一个 1 秒周期的调度循环
// - EngineContext：循环与工作单元共享的依赖
// - video / story：按任务类型的处理流程
// - status：状态事件与统计

pub mod collaborators;
pub mod context;
pub mod runner;
pub mod status;
mod story;
pub mod validate;
mod video;
pub mod worker;

pub use collaborators::{
    FfprobeMediaProbe, FileArchiver, MediaProbe, NoMediaProbe, UploadedFolderArchiver,
};
pub use context::EngineContext;
pub use runner::SchedulerLoop;
pub use status::{
    ProgressThrottler, SchedulerStats, StatsSnapshot, StatusEvent, StatusKind, StatusLevel,
    StatusSink,
};
pub use validate::{validate_media, Validation};
pub use worker::{permission_hint, run_job, JobRunReport};
