//! 客户端持久化模块
//!
//! - 恢复快照：未结束的上传项，启动时读取一次后丢弃
//! - 上传历史：进入终态的上传项写入 SQLite
//!
//! ## 目录结构
//!
//! ```text
//! data/client/
//! ├── queue_snapshot.json   # 恢复快照（临时文件 + 原子重命名）
//! └── history.db            # 上传历史
//! ```

pub mod history_db;
pub mod snapshot;

pub use history_db::SqliteHistoryRecorder;
pub use snapshot::{JsonFileSnapshotStore, MemorySnapshotStore, SnapshotEntry, SnapshotStore};
