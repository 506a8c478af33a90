//! 上传队列恢复快照
//!
//! 每次队列变化时写入未结束的上传项，启动时读取一次后丢弃。
//!
//! ## 文件格式
//!
//! ```json
//! {
//!   "version": 1,
//!   "saved_at": "2026-01-01T00:00:00Z",
//!   "items": [{ "id": "xxx", "filename": "a.mp4", "status": "paused", ... }]
//! }
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::uploader::task::{UploadCategory, UploadItem, UploadStatus};

const SNAPSHOT_VERSION: u32 = 1;

/// 快照中的一条上传项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    #[serde(default = "default_category")]
    pub category: UploadCategory,
    pub progress: f64,
    pub uploaded_bytes: u64,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at_chunk: Option<u32>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// 源文件路径，仅用于提示用户重新选择或桌面端直接恢复
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

fn default_category() -> UploadCategory {
    UploadCategory::File
}

impl SnapshotEntry {
    /// 终态项返回 None；uploading 降级为 paused
    pub fn from_item(item: &UploadItem) -> Option<Self> {
        if item.status.is_terminal() {
            return None;
        }
        let status = match item.status {
            UploadStatus::Uploading => UploadStatus::Paused,
            other => other,
        };
        Some(Self {
            id: item.id.clone(),
            filename: item.filename.clone(),
            file_size: item.file_size,
            mime_type: item.mime_type.clone(),
            category: item.category,
            progress: item.progress,
            uploaded_bytes: item.uploaded_bytes,
            status,
            session_id: item.session_id.clone(),
            paused_at_chunk: item.paused_at_chunk,
            retry_count: item.retry_count,
            scheduled_for: item.scheduled_for,
            local_path: Some(item.local_path.clone()),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at: DateTime<Utc>,
    items: Vec<SnapshotEntry>,
}

/// 快照存储
pub trait SnapshotStore: Send + Sync {
    /// 读取快照，不存在时返回空列表
    fn load(&self) -> Result<Vec<SnapshotEntry>>;

    fn save(&self, entries: &[SnapshotEntry]) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// JSON 文件快照，先写临时文件再原子重命名
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn load(&self) -> Result<Vec<SnapshotEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("打开快照文件失败: {:?}", self.path))?;
        let snapshot: SnapshotFile = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("解析快照文件失败: {:?}", self.path))?;

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "快照版本不匹配: 期望 {}, 实际 {}，忽略",
                SNAPSHOT_VERSION, snapshot.version
            );
            return Ok(Vec::new());
        }

        debug!("已加载快照: {:?}, {} 项", self.path, snapshot.items.len());
        Ok(snapshot.items)
    }

    fn save(&self, entries: &[SnapshotEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            items: entries.to_vec(),
        };

        let file = File::create(&temp_path)
            .with_context(|| format!("创建临时快照失败: {:?}", temp_path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &snapshot)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("重命名快照失败: {:?}", self.path))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除快照失败: {:?}", self.path)),
        }
    }
}

/// 内存快照
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<Option<Vec<SnapshotEntry>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<SnapshotEntry>) -> Self {
        Self {
            entries: Mutex::new(Some(entries)),
        }
    }

    /// 最近一次写入的内容
    pub fn current(&self) -> Option<Vec<SnapshotEntry>> {
        self.entries.lock().clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Vec<SnapshotEntry>> {
        Ok(self.entries.lock().clone().unwrap_or_default())
    }

    fn save(&self, entries: &[SnapshotEntry]) -> Result<()> {
        *self.entries.lock() = Some(entries.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.entries.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(status: UploadStatus) -> UploadItem {
        let mut item = UploadItem::new(
            PathBuf::from("/data/a.mp4"),
            "a.mp4".into(),
            1000,
            "video/mp4".into(),
        );
        item.status = status;
        item
    }

    #[test]
    fn test_from_item_excludes_terminal() {
        for status in [
            UploadStatus::Completed,
            UploadStatus::Error,
            UploadStatus::Cancelled,
        ] {
            assert!(SnapshotEntry::from_item(&item(status)).is_none());
        }

        let mut uploading = item(UploadStatus::Uploading);
        uploading.session_id = Some("s1".into());
        uploading.paused_at_chunk = Some(4);
        let entry = SnapshotEntry::from_item(&uploading).unwrap();
        assert_eq!(entry.status, UploadStatus::Paused);
        assert_eq!(entry.session_id.as_deref(), Some("s1"));
        assert_eq!(entry.paused_at_chunk, Some(4));
        assert_eq!(entry.category, UploadCategory::Video);
    }

    #[test]
    fn test_json_store_roundtrip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileSnapshotStore::new(dir.path().join("client/queue.json"));
        assert!(store.load().unwrap().is_empty());

        let entries: Vec<_> = [UploadStatus::Pending, UploadStatus::Retrying]
            .into_iter()
            .filter_map(|s| SnapshotEntry::from_item(&item(s)))
            .collect();
        store.save(&entries).unwrap();
        assert!(!dir.path().join("client/queue.json.tmp").exists());
        assert_eq!(store.load().unwrap(), entries);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
        // 重复清理
        store.clear().unwrap();
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, "{not json").unwrap();
        assert!(JsonFileSnapshotStore::new(path).load().is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        assert!(store.current().is_none());
        store.save(&[]).unwrap();
        assert_eq!(store.current(), Some(Vec::new()));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
