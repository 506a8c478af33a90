//! 上传历史 SQLite 数据库
//!
//! 每个进入终态（completed / error / cancelled）的上传项写入一行

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::uploader::collaborators::{HistoryEntry, HistoryRecorder};
use crate::uploader::task::UploadStatus;

/// 上传历史数据库
pub struct SqliteHistoryRecorder {
    conn: Mutex<Connection>,
}

impl SqliteHistoryRecorder {
    /// 打开数据库，自动建表
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let recorder = Self {
            conn: Mutex::new(conn),
        };
        recorder.init_tables()?;
        info!("上传历史数据库已打开: {:?}", db_path);
        Ok(recorder)
    }

    pub fn in_memory() -> Result<Self> {
        let recorder = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        recorder.init_tables()?;
        Ok(recorder)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS upload_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                average_speed INTEGER NOT NULL,
                error_msg TEXT,
                finished_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_upload_history_finished ON upload_history(finished_at)",
            [],
        )?;
        Ok(())
    }

    /// 写入一条历史
    pub fn insert(&self, entry: &HistoryEntry) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO upload_history
                (item_id, filename, file_size, mime_type, status, duration_ms,
                 average_speed, error_msg, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.item_id,
                entry.filename,
                entry.file_size as i64,
                entry.mime_type,
                entry.status.as_str(),
                (entry.duration_secs * 1000.0).round() as i64,
                entry.average_speed as i64,
                entry.error,
                entry.finished_at.timestamp_millis(),
            ],
        )?;
        debug!("写入上传历史: {} ({})", entry.filename, entry.status);
        Ok(())
    }

    /// 最近的历史记录，按结束时间倒序
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT item_id, filename, file_size, mime_type, status, duration_ms,
                   average_speed, error_msg, finished_at
            FROM upload_history
            ORDER BY finished_at DESC, id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let status: String = row.get(4)?;
            let duration_ms: i64 = row.get(5)?;
            let finished_at: i64 = row.get(8)?;
            Ok((
                HistoryEntry {
                    item_id: row.get(0)?,
                    filename: row.get(1)?,
                    file_size: row.get::<_, i64>(2)? as u64,
                    mime_type: row.get(3)?,
                    status: UploadStatus::Error,
                    duration_secs: duration_ms as f64 / 1000.0,
                    average_speed: row.get::<_, i64>(6)? as u64,
                    error: row.get(7)?,
                    finished_at: millis_to_utc(finished_at),
                },
                status,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (mut entry, status) = row?;
            match UploadStatus::parse(&status) {
                Some(s) => entry.status = s,
                None => {
                    warn!("未知的历史状态: {}", status);
                    continue;
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[async_trait]
impl HistoryRecorder for SqliteHistoryRecorder {
    async fn record(&self, entry: HistoryEntry) -> Result<()> {
        self.insert(&entry)
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(name: &str, status: UploadStatus, finished_at: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            item_id: format!("id-{}", name),
            filename: name.to_string(),
            file_size: 2048,
            mime_type: "application/pdf".into(),
            status,
            duration_secs: 1.5,
            average_speed: 1365,
            error: (status == UploadStatus::Error).then(|| "网络错误".to_string()),
            finished_at,
        }
    }

    #[tokio::test]
    async fn test_record_and_recent() {
        let db = SqliteHistoryRecorder::in_memory().unwrap();
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();

        db.record(entry("a.pdf", UploadStatus::Completed, base)).await.unwrap();
        db.record(entry("b.pdf", UploadStatus::Error, base + Duration::seconds(1)))
            .await
            .unwrap();
        db.record(entry("c.pdf", UploadStatus::Cancelled, base + Duration::seconds(2)))
            .await
            .unwrap();

        let recent = db.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].filename, "c.pdf");
        assert_eq!(recent[0].status, UploadStatus::Cancelled);
        assert_eq!(recent[1].status, UploadStatus::Error);
        assert_eq!(recent[1].error.as_deref(), Some("网络错误"));
        assert_eq!(recent[1].duration_secs, 1.5);
        assert_eq!(recent[1].finished_at, base + Duration::seconds(1));
    }

    #[test]
    fn test_file_backed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("client/history.db");
        {
            let db = SqliteHistoryRecorder::new(&path).unwrap();
            db.insert(&entry("a.pdf", UploadStatus::Completed, Utc::now())).unwrap();
        }
        let db = SqliteHistoryRecorder::new(&path).unwrap();
        assert_eq!(db.recent(10).unwrap().len(), 1);
    }
}
