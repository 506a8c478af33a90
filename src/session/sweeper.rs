//! 过期会话清理
//!
//! 定时扫描已过期或长时间无活动的会话，先删分片数据，再删会话记录

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::SessionRegistry;
use super::types::{SessionStatus, UploadSession};
use crate::storage::ChunkStore;

/// 一次清理的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepResult {
    /// 处理的会话数
    pub expired_sessions: usize,
    /// 删除的分片数
    pub chunks_deleted: usize,
    pub errors: Vec<String>,
}

/// 单个会话并发删除分片的数量
const DELETE_CONCURRENCY: usize = 8;

pub struct CleanupSweeper {
    registry: Arc<SessionRegistry>,
    chunks: ChunkStore,
    /// 无活动超过该时长的会话视为废弃
    abandon_after: Duration,
}

impl CleanupSweeper {
    pub fn new(registry: Arc<SessionRegistry>, chunks: ChunkStore, abandon_after: Duration) -> Self {
        Self {
            registry,
            chunks,
            abandon_after,
        }
    }

    /// 以当前时间执行一次清理
    pub async fn sweep(&self) -> SweepResult {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepResult {
        let mut result = SweepResult::default();

        let sessions = match self
            .registry
            .find_collectable(now, now - self.abandon_after)
        {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("查询可回收会话失败: {:#}", e);
                result.errors.push(format!("查询可回收会话失败: {:#}", e));
                return result;
            }
        };

        for session in sessions {
            self.collect_one(&session, &mut result).await;
        }

        if result.expired_sessions > 0 || !result.errors.is_empty() {
            info!(
                "会话清理完成: 会话={}, 分片={}, 错误={}",
                result.expired_sessions,
                result.chunks_deleted,
                result.errors.len()
            );
        }
        result
    }

    async fn collect_one(&self, session: &UploadSession, result: &mut SweepResult) {
        let id = &session.session_id;
        result.expired_sessions += 1;

        if let Err(e) = self.registry.set_status(id, SessionStatus::Expired) {
            warn!("标记会话过期失败: {}, 错误: {:#}", id, e);
            result.errors.push(format!("{}: 标记过期失败: {:#}", id, e));
            return;
        }

        let chunks = match self.registry.chunks(id) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("读取会话分片失败: {}, 错误: {:#}", id, e);
                result.errors.push(format!("{}: 读取分片失败: {:#}", id, e));
                return;
            }
        };

        let chunk_count = chunks.len();
        let outcomes: Vec<_> = stream::iter(chunks)
            .map(|chunk| {
                let store = self.chunks.clone();
                async move {
                    let outcome = store.delete(&chunk.storage_key).await;
                    (chunk, outcome)
                }
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .collect()
            .await;

        let mut all_deleted = true;
        for (chunk, outcome) in outcomes {
            match outcome {
                Ok(_) => result.chunks_deleted += 1,
                Err(e) => {
                    all_deleted = false;
                    warn!("删除分片失败: {}, 错误: {}", chunk.storage_key, e);
                    result
                        .errors
                        .push(format!("{}: 删除分片 {} 失败: {}", id, chunk.chunk_index, e));
                }
            }
        }

        // 分片没删干净就保留会话记录（已标记 expired），下一轮再试
        if !all_deleted {
            return;
        }

        if let Err(e) = self.registry.delete(id) {
            warn!("删除会话记录失败: {}, 错误: {:#}", id, e);
            result.errors.push(format!("{}: 删除会话记录失败: {:#}", id, e));
            return;
        }

        debug!("会话已回收: {} ({} 个分片)", id, chunk_count);
    }

    /// 启动定时清理任务，token 取消后退出
    pub fn spawn(self: Arc<Self>, interval: StdDuration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("会话清理任务已启动，间隔 {:?}", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("会话清理任务已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::UploadChunkRecord;
    use crate::storage::{MemoryStorage, ObjectStorage, StorageError, StorageResult};
    use async_trait::async_trait;

    fn session(id: &str, last_activity: DateTime<Utc>, expires: DateTime<Utc>) -> UploadSession {
        UploadSession {
            session_id: id.to_string(),
            user_id: "u".to_string(),
            filename: "f.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            total_size: 20,
            chunk_size: 10,
            total_chunks: 2,
            status: SessionStatus::Active,
            created_at: last_activity,
            expires_at: expires,
            last_activity_at: last_activity,
        }
    }

    async fn seed(registry: &SessionRegistry, store: &ChunkStore, s: &UploadSession) {
        registry.create(s).unwrap();
        for i in 0..s.total_chunks {
            let key = store.put_chunk(&s.session_id, i, vec![0u8; 10]).await.unwrap();
            let record = UploadChunkRecord {
                session_id: s.session_id.clone(),
                chunk_index: i,
                storage_key: key,
                size: 10,
            };
            // 用会话自己的活动时间记录，保持其"陈旧"
            registry
                .record_chunk(&record, s.last_activity_at, Duration::zero())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_abandoned_session_collected_before_expiry() {
        let registry = Arc::new(SessionRegistry::in_memory().unwrap());
        let storage = Arc::new(MemoryStorage::new());
        let store = ChunkStore::new(storage.clone());
        let now = Utc::now();

        let abandoned = session("abandoned", now - Duration::hours(49), now + Duration::days(3));
        let alive = session("alive", now - Duration::hours(1), now + Duration::days(3));
        seed(&registry, &store, &abandoned).await;
        seed(&registry, &store, &alive).await;

        let sweeper = CleanupSweeper::new(registry.clone(), store, Duration::hours(48));
        let result = sweeper.sweep_at(now).await;

        assert_eq!(result.expired_sessions, 1);
        assert_eq!(result.chunks_deleted, 2);
        assert!(result.errors.is_empty());
        assert!(registry.get("abandoned").unwrap().is_none());
        assert!(registry.get("alive").unwrap().is_some());
        assert_eq!(storage.count_prefix("chunks/abandoned/"), 0);
        assert_eq!(storage.count_prefix("chunks/alive/"), 2);
    }

    #[tokio::test]
    async fn test_expired_session_collected() {
        let registry = Arc::new(SessionRegistry::in_memory().unwrap());
        let store = ChunkStore::new(Arc::new(MemoryStorage::new()));
        let now = Utc::now();
        let s = session("old", now - Duration::hours(2), now - Duration::minutes(1));
        seed(&registry, &store, &s).await;

        let sweeper = CleanupSweeper::new(registry.clone(), store, Duration::hours(48));
        let result = sweeper.sweep_at(now).await;
        assert_eq!(result.expired_sessions, 1);
        assert!(registry.get("old").unwrap().is_none());

        // 第二轮无事可做
        assert_eq!(sweeper.sweep_at(now).await, SweepResult::default());
    }

    /// 删除指定会话分片时失败的存储
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_prefix: String,
    }

    #[async_trait]
    impl ObjectStorage for FlakyStorage {
        async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
            self.inner.put(key, data).await
        }
        async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            if key.starts_with(&self.fail_prefix) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "denied",
                )));
            }
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failure_keeps_record_and_does_not_block_others() {
        let registry = Arc::new(SessionRegistry::in_memory().unwrap());
        let store = ChunkStore::new(Arc::new(FlakyStorage {
            inner: MemoryStorage::new(),
            fail_prefix: "chunks/bad/".to_string(),
        }));
        let now = Utc::now();
        let past = now - Duration::hours(1);
        seed(&registry, &store, &session("bad", past, past)).await;
        seed(&registry, &store, &session("good", past, past)).await;

        let sweeper = CleanupSweeper::new(registry.clone(), store, Duration::hours(48));
        let result = sweeper.sweep_at(now).await;

        assert_eq!(result.expired_sessions, 2);
        assert_eq!(result.chunks_deleted, 2);
        assert_eq!(result.errors.len(), 2);

        // 分片删不掉时会话记录保留并标记为过期
        let bad = registry.get("bad").unwrap().unwrap();
        assert_eq!(bad.status, SessionStatus::Expired);
        assert!(registry.get("good").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawn_stops_on_cancel() {
        let registry = Arc::new(SessionRegistry::in_memory().unwrap());
        let store = ChunkStore::new(Arc::new(MemoryStorage::new()));
        let sweeper = Arc::new(CleanupSweeper::new(registry, store, Duration::hours(48)));

        let cancel = CancellationToken::new();
        let handle = sweeper.spawn(StdDuration::from_millis(10), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_task_collects_expired_sessions() {
        let registry = Arc::new(SessionRegistry::in_memory().unwrap());
        let storage = Arc::new(MemoryStorage::new());
        let store = ChunkStore::new(storage.clone());
        let now = Utc::now();
        let s = session("stale", now - Duration::hours(2), now - Duration::minutes(1));
        seed(&registry, &store, &s).await;

        let sweeper = Arc::new(CleanupSweeper::new(registry.clone(), store, Duration::hours(48)));
        let cancel = CancellationToken::new();
        let handle = sweeper.spawn(StdDuration::from_millis(10), cancel.clone());

        for _ in 0..200 {
            if registry.get("stale").unwrap().is_none() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(registry.get("stale").unwrap().is_none());
        assert_eq!(storage.count_prefix("chunks/stale/"), 0);
    }
}
