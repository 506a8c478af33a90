// Resumable Upload Library
// 可续传、自适应的多文件分片上传引擎

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 对象存储模块
pub mod storage;

// 上传会话模块（服务端）
pub mod session;

// 分片上传协议（服务端）
pub mod protocol;

// Web服务器模块
pub mod server;

// 上传事件
pub mod events;

// 上传客户端模块
pub mod uploader;

// 客户端持久化模块
pub mod persistence;

// 导出常用类型
pub use config::AppConfig;
pub use events::{EventBus, UploadEvent};
pub use protocol::{DomainRecord, ProtocolError, UploadService};
pub use server::{build_router, AppState};
pub use session::{CleanupSweeper, SessionRegistry};
pub use storage::{ChunkStore, ObjectStorage};
pub use uploader::{
    AdaptiveController, ChunkedUploadExecutor, HttpUploadClient, UploadItem, UploadQueueManager,
    UploadStatus,
};
