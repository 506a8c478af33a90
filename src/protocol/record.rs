//! 领域记录
//!
//! finalize 成功后把合并好的对象交给 `RecordCreator`，得到文件或视频记录

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// 记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    File,
    Video,
}

impl RecordKind {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.to_ascii_lowercase().starts_with("video/") {
            RecordKind::Video
        } else {
            RecordKind::File
        }
    }
}

/// 已合并完成、等待建档的上传
#[derive(Debug, Clone)]
pub struct FinalizedUpload {
    pub user_id: String,
    pub session_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub file_key: String,
}

/// 领域记录引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: String,
    pub kind: RecordKind,
    pub url: String,
    pub file_key: String,
}

#[async_trait]
pub trait RecordCreator: Send + Sync {
    async fn create(&self, upload: FinalizedUpload) -> anyhow::Result<DomainRecord>;
}

/// 保存在进程内的记录
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: DomainRecord,
    pub user_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// 默认实现：生成 UUID，URL 由 public_base_url 与 file_key 拼接
pub struct LocalRecordCreator {
    public_base_url: String,
    records: DashMap<String, StoredRecord>,
}

impl LocalRecordCreator {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            records: DashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<StoredRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordCreator for LocalRecordCreator {
    async fn create(&self, upload: FinalizedUpload) -> anyhow::Result<DomainRecord> {
        let record = DomainRecord {
            id: Uuid::new_v4().to_string(),
            kind: RecordKind::from_mime(&upload.mime_type),
            url: format!("{}/{}", self.public_base_url, upload.file_key),
            file_key: upload.file_key.clone(),
        };

        info!(
            "创建{}记录: id={}, 文件={}, 大小={}",
            match record.kind {
                RecordKind::File => "文件",
                RecordKind::Video => "视频",
            },
            record.id,
            upload.filename,
            upload.size
        );

        self.records.insert(
            record.id.clone(),
            StoredRecord {
                record: record.clone(),
                user_id: upload.user_id,
                filename: upload.filename,
                mime_type: upload.mime_type,
                size: upload.size,
                created_at: Utc::now(),
            },
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mime() {
        assert_eq!(RecordKind::from_mime("video/mp4"), RecordKind::Video);
        assert_eq!(RecordKind::from_mime("Video/QuickTime"), RecordKind::Video);
        assert_eq!(RecordKind::from_mime("image/png"), RecordKind::File);
        assert_eq!(RecordKind::from_mime(""), RecordKind::File);
    }

    #[tokio::test]
    async fn test_local_creator_builds_url() {
        let creator = LocalRecordCreator::new("http://host/objects/");
        let record = creator
            .create(FinalizedUpload {
                user_id: "u".into(),
                session_id: "s".into(),
                filename: "clip.mp4".into(),
                mime_type: "video/mp4".into(),
                size: 42,
                file_key: "files/u/s/clip.mp4".into(),
            })
            .await
            .unwrap();

        assert_eq!(record.kind, RecordKind::Video);
        assert_eq!(record.url, "http://host/objects/files/u/s/clip.mp4");
        assert_eq!(creator.get(&record.id).unwrap().size, 42);
    }
}
