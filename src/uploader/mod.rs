// 上传引擎模块
//
// - TransferClient：单个文件的一次上传（一次性 / 三阶段分段）
// - RetryDriver：有限重试、限流等待、断网等待
// - 所有睡眠按切片进行，取消请求在一个切片内生效

pub mod chunk;
pub mod connectivity;
pub mod endpoint;
pub mod engine;
pub mod outcome;
pub mod progress;
pub mod retry;

pub use chunk::{read_chunk_at, ChunkPlan, UploadChunk, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use connectivity::{
    wait_for_connectivity, AlwaysOnline, ConnectivityProbe, ConnectivityWait,
    TcpConnectivityProbe,
};
pub use endpoint::{mime_for, ContentEndpoint, TransferStyle, UploadRequest};
pub use engine::{TransferClient, UploadMode};
pub use outcome::{TransferOutcome, TransferResult};
pub use progress::{ProgressCallback, ProgressReporter, UploadPhase};
pub use retry::{sleep_cancellable, RetryDriver, RetryPolicy, RetryReport};
