//! 上传事件类型
//!
//! 队列管理器在每次状态变化时发布，订阅方通过 broadcast 接收

use serde::{Deserialize, Serialize};

use crate::protocol::DomainRecord;
use crate::uploader::task::{UploadCategory, UploadStatus};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 进度、倒计时
    Low = 0,
    /// 状态变更
    Medium = 1,
    /// 完成、失败、取消等
    High = 2,
}

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    Created {
        item_id: String,
        filename: String,
        file_size: u64,
        category: UploadCategory,
        status: UploadStatus,
    },
    Progress {
        item_id: String,
        uploaded_bytes: u64,
        file_size: u64,
        progress: f64,
        /// 字节/秒
        speed: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta: Option<u64>,
        completed_chunks: u32,
        total_chunks: u32,
    },
    StatusChanged {
        item_id: String,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 自动重试倒计时，每个 tick 发布一次
    RetryCountdown {
        item_id: String,
        attempt: u32,
        max_attempts: u32,
        remaining_secs: u64,
    },
    Completed {
        item_id: String,
        record: DomainRecord,
        completed_at: i64,
    },
    Failed {
        item_id: String,
        error: String,
        retry_count: u32,
        /// 是否还会自动重试
        will_retry: bool,
    },
    Paused {
        item_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        paused_at_chunk: Option<u32>,
    },
    Resumed {
        item_id: String,
    },
    Cancelled {
        item_id: String,
    },
    Removed {
        item_id: String,
    },
}

impl UploadEvent {
    pub fn item_id(&self) -> &str {
        match self {
            UploadEvent::Created { item_id, .. }
            | UploadEvent::Progress { item_id, .. }
            | UploadEvent::StatusChanged { item_id, .. }
            | UploadEvent::RetryCountdown { item_id, .. }
            | UploadEvent::Completed { item_id, .. }
            | UploadEvent::Failed { item_id, .. }
            | UploadEvent::Paused { item_id, .. }
            | UploadEvent::Resumed { item_id }
            | UploadEvent::Cancelled { item_id }
            | UploadEvent::Removed { item_id } => item_id,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Progress { .. } | UploadEvent::RetryCountdown { .. } => EventPriority::Low,
            UploadEvent::StatusChanged { .. } => EventPriority::Medium,
            _ => EventPriority::High,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Created { .. } => "created",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::RetryCountdown { .. } => "retry_countdown",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Paused { .. } => "paused",
            UploadEvent::Resumed { .. } => "resumed",
            UploadEvent::Cancelled { .. } => "cancelled",
            UploadEvent::Removed { .. } => "removed",
        }
    }
}
