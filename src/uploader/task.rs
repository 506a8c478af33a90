// 上传项定义

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::protocol::{DomainRecord, RecordKind};

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待定时开始
    Scheduled,
    /// 等待空闲槽位
    Pending,
    /// 上传中
    Uploading,
    /// 等待自动重试
    Retrying,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败（自动重试已用尽）
    Error,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Scheduled => "scheduled",
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Retrying => "retrying",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "scheduled" => UploadStatus::Scheduled,
            "pending" => UploadStatus::Pending,
            "uploading" => UploadStatus::Uploading,
            "retrying" => UploadStatus::Retrying,
            "paused" => UploadStatus::Paused,
            "completed" => UploadStatus::Completed,
            "error" => UploadStatus::Error,
            "cancelled" => UploadStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    /// completed / error / cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Error | UploadStatus::Cancelled
        )
    }

    /// 进度、速度只在这两个状态下有意义
    pub fn is_active(&self) -> bool {
        matches!(self, UploadStatus::Uploading | UploadStatus::Retrying)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上传类别，决定由哪个执行器处理
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadCategory {
    File,
    Video,
}

impl UploadCategory {
    pub fn from_mime(mime_type: &str) -> Self {
        match RecordKind::from_mime(mime_type) {
            RecordKind::Video => UploadCategory::Video,
            RecordKind::File => UploadCategory::File,
        }
    }
}

/// 上传项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: String,
    /// 本地源文件
    pub local_path: PathBuf,
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    pub category: UploadCategory,
    pub status: UploadStatus,
    /// 0-100
    pub progress: f64,
    pub uploaded_bytes: u64,
    /// 字节/秒
    pub speed: u64,
    /// 剩余秒数
    pub eta: Option<u64>,
    /// init 成功后绑定
    pub session_id: Option<String>,
    /// 下一个需要上传的分片序号（已确认分片 + 1）
    pub paused_at_chunk: Option<u32>,
    /// 已消耗的自动重试次数
    pub retry_count: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// 下一次自动重试的时间
    pub retry_at: Option<DateTime<Utc>>,
    pub result: Option<DomainRecord>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 第一次开始上传的时间
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 之前各次上传累计的传输时间（毫秒），不含重试等待和暂停
    #[serde(default)]
    pub active_ms: u64,
    /// 本次上传开始的时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_started_at: Option<DateTime<Utc>>,
}

impl UploadItem {
    pub fn new(local_path: PathBuf, filename: String, file_size: u64, mime_type: String) -> Self {
        let category = UploadCategory::from_mime(&mime_type);
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            filename,
            file_size,
            mime_type,
            category,
            status: UploadStatus::Pending,
            progress: 0.0,
            uploaded_bytes: 0,
            speed: 0,
            eta: None,
            session_id: None,
            paused_at_chunk: None,
            retry_count: 0,
            scheduled_for: None,
            retry_at: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            active_ms: 0,
            attempt_started_at: None,
        }
    }

    /// 读取本地文件元数据，按扩展名推断媒体类型
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("读取文件信息失败: {:?}", path))?;
        if !meta.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("无法解析文件名: {:?}", path))?;
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self::new(path.to_path_buf(), filename, meta.len(), mime_type))
    }

    pub fn with_category(mut self, category: UploadCategory) -> Self {
        self.category = category;
        self
    }

    /// 计算进度百分比
    pub fn progress_of(uploaded: u64, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (uploaded as f64 / total as f64 * 100.0).min(100.0)
    }

    /// 切换状态
    ///
    /// 速度和 ETA 每次切换都清零；进度只在 uploading → retrying 时保留
    fn transition(&mut self, next: UploadStatus) {
        let keep_progress = self.status == UploadStatus::Uploading && next == UploadStatus::Retrying;
        self.status = next;
        self.speed = 0;
        self.eta = None;
        if !keep_progress {
            self.progress = 0.0;
            self.uploaded_bytes = 0;
        }
    }

    /// 离开 uploading 时把本次传输时间计入累计
    fn stop_clock(&mut self, now: DateTime<Utc>) {
        if let Some(start) = self.attempt_started_at.take() {
            self.active_ms += (now - start).num_milliseconds().max(0) as u64;
        }
    }

    pub fn mark_scheduled(&mut self, at: DateTime<Utc>) {
        self.stop_clock(Utc::now());
        self.transition(UploadStatus::Scheduled);
        self.scheduled_for = Some(at);
    }

    pub fn mark_pending(&mut self) {
        self.stop_clock(Utc::now());
        self.transition(UploadStatus::Pending);
        self.scheduled_for = None;
        self.retry_at = None;
    }

    pub fn mark_uploading(&mut self, now: DateTime<Utc>) {
        self.stop_clock(now);
        self.transition(UploadStatus::Uploading);
        self.error = None;
        self.attempt_started_at = Some(now);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    pub fn mark_completed(&mut self, record: DomainRecord, now: DateTime<Utc>) {
        self.stop_clock(now);
        self.transition(UploadStatus::Completed);
        self.progress = 100.0;
        self.uploaded_bytes = self.file_size;
        self.result = Some(record);
        self.error = None;
        self.retry_at = None;
        self.completed_at = Some(now);
    }

    /// 消耗一次自动重试，在 retry_at 之后回到 pending
    pub fn mark_retrying(&mut self, error: String, retry_at: DateTime<Utc>) {
        self.stop_clock(Utc::now());
        self.transition(UploadStatus::Retrying);
        self.retry_count += 1;
        self.error = Some(error);
        self.retry_at = Some(retry_at);
    }

    pub fn mark_error(&mut self, error: String, now: DateTime<Utc>) {
        self.stop_clock(now);
        self.transition(UploadStatus::Error);
        self.error = Some(error);
        self.retry_at = None;
        self.completed_at = Some(now);
    }

    pub fn mark_paused(&mut self) {
        self.stop_clock(Utc::now());
        self.transition(UploadStatus::Paused);
        self.retry_at = None;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.stop_clock(now);
        self.transition(UploadStatus::Cancelled);
        self.retry_at = None;
        self.scheduled_for = None;
        self.completed_at = Some(now);
    }

    /// 手动重试：清除错误和会话绑定，保留 retry_count
    pub fn reset_for_manual_retry(&mut self) {
        self.mark_pending();
        self.error = None;
        self.session_id = None;
        self.paused_at_chunk = None;
        self.completed_at = None;
    }

    /// 更新进度，只在活跃状态下生效
    pub fn update_progress(&mut self, uploaded_bytes: u64, speed: u64) {
        if !self.status.is_active() {
            return;
        }
        self.uploaded_bytes = uploaded_bytes.min(self.file_size);
        self.progress = Self::progress_of(self.uploaded_bytes, self.file_size);
        self.speed = speed;
        self.eta = self.compute_eta();
    }

    /// 估算剩余时间 (秒)
    fn compute_eta(&self) -> Option<u64> {
        if self.speed == 0 || self.uploaded_bytes >= self.file_size {
            return None;
        }
        Some((self.file_size - self.uploaded_bytes) / self.speed)
    }

    /// 实际传输耗时（秒），不含重试等待和暂停
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        let running = match self.attempt_started_at {
            Some(start) => (now - start).num_milliseconds().max(0) as u64,
            None => 0,
        };
        (self.active_ms + running) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> UploadItem {
        UploadItem::new(
            PathBuf::from("/tmp/a.mp4"),
            "a.mp4".into(),
            1000,
            "video/mp4".into(),
        )
    }

    #[test]
    fn test_item_creation() {
        let item = item();
        assert_eq!(item.status, UploadStatus::Pending);
        assert_eq!(item.category, UploadCategory::Video);
        assert_eq!(item.progress, 0.0);
        assert!(item.session_id.is_none());
    }

    #[test]
    fn test_status_transitions() {
        let mut item = item();
        let now = Utc::now();

        item.mark_uploading(now);
        assert_eq!(item.status, UploadStatus::Uploading);
        assert_eq!(item.started_at, Some(now));

        item.update_progress(500, 100);
        assert_eq!(item.progress, 50.0);
        assert_eq!(item.eta, Some(5));

        // uploading -> retrying 保留进度，清零速度
        item.mark_retrying("timeout".into(), now);
        assert_eq!(item.progress, 50.0);
        assert_eq!(item.speed, 0);
        assert_eq!(item.eta, None);
        assert_eq!(item.retry_count, 1);

        // 其余切换清零
        item.mark_pending();
        assert_eq!(item.progress, 0.0);
        assert_eq!(item.uploaded_bytes, 0);
    }

    #[test]
    fn test_elapsed_excludes_pause_and_backoff() {
        let mut item = item();
        let first = Utc::now() - chrono::Duration::seconds(10);
        item.mark_uploading(first);
        item.mark_paused();
        let after_first = item.active_ms;
        assert!((10_000..11_000).contains(&after_first));

        // 暂停 100 秒后恢复，再传 5 秒完成
        let second = Utc::now() + chrono::Duration::seconds(100);
        item.mark_pending();
        item.mark_uploading(second);
        assert_eq!(item.started_at, Some(first));
        assert!((item.elapsed_secs(second) - after_first as f64 / 1000.0).abs() < 0.001);

        item.mark_completed(
            DomainRecord {
                id: "f".into(),
                kind: RecordKind::File,
                url: "u".into(),
                file_key: "k".into(),
            },
            second + chrono::Duration::seconds(5),
        );
        let elapsed = item.elapsed_secs(second + chrono::Duration::seconds(60));
        assert!((elapsed - (after_first as f64 / 1000.0 + 5.0)).abs() < 0.001);
        assert!(item.attempt_started_at.is_none());
    }

    #[test]
    fn test_pause_and_cancel_zero_progress() {
        let mut item = item();
        item.mark_uploading(Utc::now());
        item.update_progress(300, 10);
        item.paused_at_chunk = Some(3);

        item.mark_paused();
        assert_eq!(item.progress, 0.0);
        assert_eq!(item.paused_at_chunk, Some(3));

        item.mark_cancelled(Utc::now());
        assert_eq!(item.status, UploadStatus::Cancelled);
        assert_eq!(item.progress, 0.0);
        assert!(item.status.is_terminal());
    }

    #[test]
    fn test_progress_ignored_when_inactive() {
        let mut item = item();
        item.update_progress(500, 100);
        assert_eq!(item.progress, 0.0);
    }

    #[test]
    fn test_manual_retry_keeps_retry_count() {
        let mut item = item();
        let now = Utc::now();
        item.mark_uploading(now);
        item.session_id = Some("s".into());
        item.retry_count = 3;
        item.mark_error("boom".into(), now);

        item.reset_for_manual_retry();
        assert_eq!(item.status, UploadStatus::Pending);
        assert_eq!(item.retry_count, 3);
        assert!(item.error.is_none());
        assert!(item.session_id.is_none());
    }

    #[test]
    fn test_completed_reports_full() {
        let mut item = item();
        item.mark_uploading(Utc::now());
        item.mark_completed(
            DomainRecord {
                id: "r".into(),
                kind: RecordKind::Video,
                url: "u".into(),
                file_key: "k".into(),
            },
            Utc::now(),
        );
        assert_eq!(item.progress, 100.0);
        assert_eq!(item.uploaded_bytes, 1000);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let item = UploadItem::from_path(&path).unwrap();
        assert_eq!(item.filename, "notes.txt");
        assert_eq!(item.file_size, 5);
        assert_eq!(item.mime_type, "text/plain");
        assert_eq!(item.category, UploadCategory::File);

        assert!(UploadItem::from_path(dir.path()).is_err());
    }
}
