// 任务模块
//
// Job 由共享核心（状态、锁、游标、调度）加类型专属负载 JobKind 组成

pub mod base;
pub mod files;
pub mod model;
pub mod record;
pub mod registry;
pub mod schedule;
pub mod title;

pub use base::{Job, JobBuilder, JobPhase, RunGuard, TransitionError, UploadPermit};
pub use files::{
    is_image, is_supported, is_video, pick_next, story_batch, MediaScanner, IMAGE_EXTENSIONS,
    VIDEO_EXTENSIONS,
};
pub use model::{
    clamp_interval, JobKey, JobKind, JobType, ScheduleSettings, SortPolicy, StorySettings,
    VideoSettings, WatermarkSettings, MAX_INTERVAL_SECS,
};
pub use record::{JobRecord, RecordError};
pub use registry::JobRegistry;
pub use schedule::{
    after_secs, apply_jitter, compute_next_run, next_run_from_template, next_run_from_times,
    InMemoryTemplates, ScheduleTemplate, ScheduleTemplates,
};
pub use title::{apply_placeholders, render_metadata};
