// 队列管理器的外部协作方：通知与历史记录
//
// 两者都是尽力而为，失败只记日志，不影响状态切换

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::uploader::task::{UploadItem, UploadStatus};

/// 发给用户的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Completed {
        item_id: String,
        filename: String,
        url: String,
    },
    Failed {
        item_id: String,
        filename: String,
        error: String,
    },
    /// 定时上传到点开始
    ScheduledStarted { item_id: String, filename: String },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// 只写日志的通知实现
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, notification: Notification) {
        match notification {
            Notification::Completed { filename, url, .. } => {
                info!("🔔 上传完成: {} -> {}", filename, url)
            }
            Notification::Failed { filename, error, .. } => {
                info!("🔔 上传失败: {}, 原因: {}", filename, error)
            }
            Notification::ScheduledStarted { filename, .. } => {
                info!("🔔 定时上传开始: {}", filename)
            }
        }
    }
}

/// 一条上传历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub item_id: String,
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    /// completed / error / cancelled
    pub status: UploadStatus,
    pub duration_secs: f64,
    /// 平均速度（字节/秒）
    pub average_speed: u64,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// 按上传项的终态生成历史记录
    pub fn from_item(item: &UploadItem, now: DateTime<Utc>) -> Self {
        let duration_secs = item.elapsed_secs(now);
        let average_speed = if item.status == UploadStatus::Completed && duration_secs > 0.0 {
            (item.file_size as f64 / duration_secs) as u64
        } else {
            0
        };
        Self {
            item_id: item.id.clone(),
            filename: item.filename.clone(),
            file_size: item.file_size,
            mime_type: item.mime_type.clone(),
            status: item.status,
            duration_secs,
            average_speed,
            error: item.error.clone(),
            finished_at: item.completed_at.unwrap_or(now),
        }
    }
}

#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record(&self, entry: HistoryEntry) -> Result<()>;
}
