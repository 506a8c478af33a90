//! 会话注册表（SQLite）
//!
//! - upload_sessions: 会话
//! - upload_chunks: 已接收分片，主键 (session_id, chunk_index)

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::types::{SessionStatus, UploadChunkRecord, UploadSession};

const SESSION_COLUMNS: &str = "session_id, user_id, filename, mime_type, total_size, chunk_size, \
     total_chunks, status, created_at, expires_at, last_activity_at";

/// 会话注册表
pub struct SessionRegistry {
    conn: Mutex<Connection>,
}

impl SessionRegistry {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// 内存数据库，进程退出即丢失
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // 多个 handler 并发写同一库时等待而不是立即报 busy
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.init_tables()?;
        Ok(registry)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upload_chunks (
                session_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                storage_key TEXT NOT NULL,
                size INTEGER NOT NULL,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_upload_sessions_expires ON upload_sessions(expires_at);
            CREATE INDEX IF NOT EXISTS idx_upload_sessions_activity ON upload_sessions(last_activity_at);
            "#,
        )?;

        info!("会话数据库表初始化完成");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    /// 创建会话
    pub fn create(&self, session: &UploadSession) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO upload_sessions (
                session_id, user_id, filename, mime_type, total_size, chunk_size,
                total_chunks, status, created_at, expires_at, last_activity_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                session.session_id,
                session.user_id,
                session.filename,
                session.mime_type,
                session.total_size as i64,
                session.chunk_size as i64,
                session.total_chunks,
                session.status.as_str(),
                session.created_at.timestamp_millis(),
                session.expires_at.timestamp_millis(),
                session.last_activity_at.timestamp_millis(),
            ],
        )?;
        debug!("会话已创建: {}", session.session_id);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<Option<UploadSession>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM upload_sessions WHERE session_id = ?1", SESSION_COLUMNS);
        let session = conn
            .query_row(&sql, params![session_id], row_to_session)
            .optional()?;
        Ok(session)
    }

    /// 记录一个分片，返回该会话已接收的不同分片数，会话不存在时返回 None
    ///
    /// 同一 (session_id, chunk_index) 重复写入只覆盖 key 和大小，计数不变。
    /// 同时刷新 last_activity_at，把 expires_at 推到 now + ttl，
    /// 暂停的会话恢复为 active
    pub fn record_chunk(
        &self,
        chunk: &UploadChunkRecord,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<u32>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let touched = tx.execute(
            r#"
            UPDATE upload_sessions SET
                last_activity_at = ?2,
                expires_at = MAX(expires_at, ?3),
                status = CASE WHEN status = 'paused' THEN 'active' ELSE status END
            WHERE session_id = ?1
            "#,
            params![
                chunk.session_id,
                now.timestamp_millis(),
                (now + ttl).timestamp_millis(),
            ],
        )?;
        if touched == 0 {
            // 会话已被取消或回收，事务随 drop 回滚
            return Ok(None);
        }

        tx.execute(
            r#"
            INSERT INTO upload_chunks (session_id, chunk_index, storage_key, size, received_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id, chunk_index) DO UPDATE SET
                storage_key = excluded.storage_key,
                size = excluded.size,
                received_at = excluded.received_at
            "#,
            params![
                chunk.session_id,
                chunk.chunk_index,
                chunk.storage_key,
                chunk.size as i64,
                now.timestamp_millis(),
            ],
        )?;

        let received: u32 = tx.query_row(
            "SELECT COUNT(DISTINCT chunk_index) FROM upload_chunks WHERE session_id = ?1",
            params![chunk.session_id],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(Some(received))
    }

    /// 已接收的分片序号，升序
    pub fn received_indices(&self, session_id: &str) -> Result<Vec<u32>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT chunk_index FROM upload_chunks WHERE session_id = ?1 ORDER BY chunk_index",
        )?;
        let indices = stmt
            .query_map(params![session_id], |row| row.get::<_, u32>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(indices)
    }

    /// 分片记录，按序号升序
    pub fn chunks(&self, session_id: &str) -> Result<Vec<UploadChunkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, chunk_index, storage_key, size FROM upload_chunks \
             WHERE session_id = ?1 ORDER BY chunk_index",
        )?;
        let chunks = stmt
            .query_map(params![session_id], |row| {
                Ok(UploadChunkRecord {
                    session_id: row.get(0)?,
                    chunk_index: row.get(1)?,
                    storage_key: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// 更新会话状态，返回会话是否存在
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE upload_sessions SET status = ?2 WHERE session_id = ?1",
            params![session_id, status.as_str()],
        )?;
        Ok(n > 0)
    }

    /// 删除会话及其分片记录（不碰存储中的分片数据）
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM upload_chunks WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute(
            "DELETE FROM upload_sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.commit()?;
        debug!("会话记录已删除: {}", session_id);
        Ok(())
    }

    /// 可回收的会话：已过期，或最后活动早于 abandon_before
    pub fn find_collectable(
        &self,
        now: DateTime<Utc>,
        abandon_before: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE expires_at <= ?1 OR last_activity_at <= ?2 \
             ORDER BY last_activity_at",
            SESSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(
                params![now.timestamp_millis(), abandon_before.timestamp_millis()],
                row_to_session,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// 会话总数
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM upload_sessions", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<UploadSession> {
    let status: String = row.get(7)?;
    let status = SessionStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("未知的会话状态: {}", status).into(),
        )
    })?;

    Ok(UploadSession {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        filename: row.get(2)?,
        mime_type: row.get(3)?,
        total_size: row.get::<_, i64>(4)? as u64,
        chunk_size: row.get::<_, i64>(5)? as u64,
        total_chunks: row.get(6)?,
        status,
        created_at: millis_to_utc(row.get(8)?),
        expires_at: millis_to_utc(row.get(9)?),
        last_activity_at: millis_to_utc(row.get(10)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(id: &str, now: DateTime<Utc>) -> UploadSession {
        UploadSession {
            session_id: id.to_string(),
            user_id: "alice".to_string(),
            filename: "a.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            total_size: 30,
            chunk_size: 10,
            total_chunks: 3,
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now + Duration::hours(1),
            last_activity_at: now,
        }
    }

    fn chunk(id: &str, index: u32) -> UploadChunkRecord {
        UploadChunkRecord {
            session_id: id.to_string(),
            chunk_index: index,
            storage_key: format!("chunks/{}/{:08}", id, index),
            size: 10,
        }
    }

    #[test]
    fn test_create_and_get() {
        let registry = SessionRegistry::in_memory().unwrap();
        let now = Utc::now();
        let s = session("s1", now);
        registry.create(&s).unwrap();

        let loaded = registry.get("s1").unwrap().unwrap();
        assert_eq!(loaded.filename, "a.bin");
        assert_eq!(loaded.total_chunks, 3);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.expires_at.timestamp_millis(), s.expires_at.timestamp_millis());
        assert!(registry.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_record_chunk_is_idempotent() {
        let registry = SessionRegistry::in_memory().unwrap();
        let now = Utc::now();
        registry.create(&session("s1", now)).unwrap();

        let ttl = Duration::hours(2);
        assert_eq!(registry.record_chunk(&chunk("s1", 0), now, ttl).unwrap(), Some(1));
        assert_eq!(registry.record_chunk(&chunk("s1", 2), now, ttl).unwrap(), Some(2));
        // 重传同一分片，计数不变
        assert_eq!(registry.record_chunk(&chunk("s1", 0), now, ttl).unwrap(), Some(2));
        // 不存在的会话不留下分片记录
        assert_eq!(registry.record_chunk(&chunk("nope", 0), now, ttl).unwrap(), None);
        assert!(registry.received_indices("nope").unwrap().is_empty());

        assert_eq!(registry.received_indices("s1").unwrap(), vec![0, 2]);
        assert_eq!(registry.chunks("s1").unwrap().len(), 2);
    }

    #[test]
    fn test_record_chunk_refreshes_expiry_and_reactivates() {
        let registry = SessionRegistry::in_memory().unwrap();
        let now = Utc::now();
        registry.create(&session("s1", now)).unwrap();
        registry.set_status("s1", SessionStatus::Paused).unwrap();

        let later = now + Duration::minutes(30);
        registry
            .record_chunk(&chunk("s1", 1), later, Duration::hours(2))
            .unwrap();

        let s = registry.get("s1").unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.last_activity_at.timestamp_millis(), later.timestamp_millis());
        assert_eq!(
            s.expires_at.timestamp_millis(),
            (later + Duration::hours(2)).timestamp_millis()
        );
    }

    #[test]
    fn test_delete_removes_rows() {
        let registry = SessionRegistry::in_memory().unwrap();
        let now = Utc::now();
        registry.create(&session("s1", now)).unwrap();
        registry.record_chunk(&chunk("s1", 0), now, Duration::hours(1)).unwrap();

        registry.delete("s1").unwrap();
        assert!(registry.get("s1").unwrap().is_none());
        assert!(registry.received_indices("s1").unwrap().is_empty());
        assert_eq!(registry.count().unwrap(), 0);
    }

    #[test]
    fn test_find_collectable() {
        let registry = SessionRegistry::in_memory().unwrap();
        let now = Utc::now();

        // 正常会话
        registry.create(&session("fresh", now)).unwrap();

        // 已过期
        let mut expired = session("expired", now - Duration::hours(3));
        expired.expires_at = now - Duration::hours(1);
        registry.create(&expired).unwrap();

        // 未到期但 49 小时无活动
        let mut abandoned = session("abandoned", now - Duration::hours(49));
        abandoned.expires_at = now + Duration::days(5);
        registry.create(&abandoned).unwrap();

        let found = registry
            .find_collectable(now, now - Duration::hours(48))
            .unwrap();
        let mut ids: Vec<_> = found.into_iter().map(|s| s.session_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["abandoned".to_string(), "expired".to_string()]);
    }

    #[test]
    fn test_open_file_backed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta/sessions.db");
        {
            let registry = SessionRegistry::open(&path).unwrap();
            registry.create(&session("s1", Utc::now())).unwrap();
        }
        let registry = SessionRegistry::open(&path).unwrap();
        assert!(registry.get("s1").unwrap().is_some());
    }
}
