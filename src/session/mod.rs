//! 服务端会话模块

pub mod registry;
pub mod sweeper;
pub mod types;

pub use registry::SessionRegistry;
pub use sweeper::{CleanupSweeper, SweepResult};
pub use types::{SessionStatus, UploadChunkRecord, UploadSession};
