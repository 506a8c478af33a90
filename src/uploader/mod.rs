// 上传客户端模块
//
// - task: 上传项与状态机
// - manager: 队列管理器（并发上限、自动重试、定时、快照）
// - executor: 分片上传执行器
// - adaptive: 自适应超时 / 并发 / 限速
// - client: 协议传输层（HTTP 与进程内）

pub mod adaptive;
pub mod chunk;
pub mod client;
pub mod collaborators;
pub mod executor;
pub mod folder;
pub mod manager;
pub mod task;

pub use adaptive::{AdaptiveController, AdaptiveSettings, BandwidthPacer, NetworkQuality};
pub use chunk::ChunkPlan;
pub use client::{HttpUploadClient, LocalTransport, TransportError, UploadTransport};
pub use collaborators::{
    HistoryEntry, HistoryRecorder, LogNotificationSink, Notification, NotificationSink,
};
pub use executor::{
    ChunkedUploadExecutor, ExecutionContext, ExecutionOutcome, ExecutorOptions, ProgressReporter,
    ProgressSink, ProgressUpdate, UploadExecutor,
};
pub use folder::{FolderScanner, ScanOptions, ScannedFile};
pub use manager::{QueueStats, UploadQueueManager, UploadQueueManagerBuilder};
pub use task::{UploadCategory, UploadItem, UploadStatus};
