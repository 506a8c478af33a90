//! 分片上传服务
//!
//! init → upload_chunk × N → finalize，任意时刻可 cancel。
//! 服务端从不信任客户端声明的完整性，finalize 前逐一核对分片序号

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ProtocolError;
use super::record::{FinalizedUpload, RecordCreator};
use super::types::{
    AckResponse, ChunkPayload, FinalizeResponse, InitUploadRequest, InitUploadResponse,
    SessionStatusResponse, UploadChunkResponse,
};
use crate::config::SessionConfig;
use crate::session::{SessionRegistry, SessionStatus, UploadChunkRecord, UploadSession};
use crate::storage::ChunkStore;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// 协议参数
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub chunk_size: u64,
    pub session_ttl: Duration,
    pub max_file_size: u64,
}

impl From<&SessionConfig> for ProtocolSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            session_ttl: config.session_ttl(),
            max_file_size: config.max_file_size,
        }
    }
}

pub struct UploadService {
    registry: Arc<SessionRegistry>,
    chunks: ChunkStore,
    records: Arc<dyn RecordCreator>,
    settings: ProtocolSettings,
}

impl UploadService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        chunks: ChunkStore,
        records: Arc<dyn RecordCreator>,
        settings: ProtocolSettings,
    ) -> Self {
        Self {
            registry,
            chunks,
            records,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// 创建上传会话
    pub async fn init(&self, user_id: &str, req: InitUploadRequest) -> ProtocolResult<InitUploadResponse> {
        let filename = req.filename.trim();
        if filename.is_empty() {
            return Err(ProtocolError::InvalidRequest("文件名不能为空".to_string()));
        }
        if req.total_size > self.settings.max_file_size {
            return Err(ProtocolError::InvalidRequest(format!(
                "文件大小 {} 超过上限 {}",
                req.total_size, self.settings.max_file_size
            )));
        }

        let mime_type = if req.mime_type.trim().is_empty() {
            mime_guess::from_path(filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        } else {
            req.mime_type.trim().to_string()
        };

        let now = Utc::now();
        let session = UploadSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            filename: filename.to_string(),
            mime_type,
            total_size: req.total_size,
            chunk_size: self.settings.chunk_size,
            total_chunks: UploadSession::chunk_count(req.total_size, self.settings.chunk_size),
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now + self.settings.session_ttl,
            last_activity_at: now,
        };
        self.registry.create(&session)?;

        info!(
            "创建上传会话: id={}, 用户={}, 文件={}, 大小={}, 分片数={}",
            session.session_id, user_id, session.filename, session.total_size, session.total_chunks
        );

        Ok(InitUploadResponse {
            session_id: session.session_id,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            expires_at: session.expires_at,
        })
    }

    /// 接收一个分片，重复上传同一序号只覆盖
    pub async fn upload_chunk(
        &self,
        user_id: &str,
        session_id: &str,
        chunk: ChunkPayload,
    ) -> ProtocolResult<UploadChunkResponse> {
        let now = Utc::now();
        let session = self.live_session(user_id, session_id, now)?;

        if chunk.total_chunks != session.total_chunks {
            return Err(ProtocolError::InvalidChunk(format!(
                "分片总数不一致: 声明 {}, 会话 {}",
                chunk.total_chunks, session.total_chunks
            )));
        }
        if chunk.chunk_index >= session.total_chunks {
            return Err(ProtocolError::InvalidChunk(format!(
                "分片序号越界: {} (共 {} 片)",
                chunk.chunk_index, session.total_chunks
            )));
        }

        let expected = session.expected_chunk_len(chunk.chunk_index);
        if chunk.data.len() as u64 != expected {
            return Err(ProtocolError::InvalidChunk(format!(
                "分片 {} 长度错误: 期望 {}, 实际 {}",
                chunk.chunk_index,
                expected,
                chunk.data.len()
            )));
        }

        if let Some(checksum) = &chunk.checksum {
            let actual = format!("{:x}", md5::compute(&chunk.data));
            if !actual.eq_ignore_ascii_case(checksum.trim()) {
                return Err(ProtocolError::InvalidChunk(format!(
                    "分片 {} 校验失败: 期望 {}, 实际 {}",
                    chunk.chunk_index, checksum, actual
                )));
            }
        }

        let size = chunk.data.len() as u64;
        let storage_key = self
            .chunks
            .put_chunk(session_id, chunk.chunk_index, chunk.data)
            .await?;

        let record = UploadChunkRecord {
            session_id: session_id.to_string(),
            chunk_index: chunk.chunk_index,
            storage_key: storage_key.clone(),
            size,
        };
        let Some(received) = self
            .registry
            .record_chunk(&record, now, self.settings.session_ttl)?
        else {
            // 写入期间会话被取消
            let _ = self.chunks.delete(&storage_key).await;
            return Err(ProtocolError::SessionNotFound(session_id.to_string()));
        };

        debug!(
            "收到分片: session={}, index={}, 已收到 {}/{}",
            session_id, chunk.chunk_index, received, session.total_chunks
        );

        Ok(UploadChunkResponse {
            success: true,
            received_chunks: received,
            total_chunks: session.total_chunks,
        })
    }

    /// 校验完整性后合并分片并建档
    pub async fn finalize(&self, user_id: &str, session_id: &str) -> ProtocolResult<FinalizeResponse> {
        let session = self.live_session(user_id, session_id, Utc::now())?;

        let chunks = self.registry.chunks(session_id)?;
        let complete = chunks.len() as u32 == session.total_chunks
            && chunks
                .iter()
                .enumerate()
                .all(|(i, c)| c.chunk_index == i as u32);
        if !complete {
            return Err(ProtocolError::IncompleteUpload {
                received: chunks.len() as u32,
                total: session.total_chunks,
            });
        }

        let file_key = ChunkStore::file_key(&session.user_id, session_id, &session.filename);
        let keys: Vec<String> = chunks.iter().map(|c| c.storage_key.clone()).collect();
        let size = self.chunks.assemble(&file_key, &keys).await?;
        if size != session.total_size {
            let _ = self.chunks.delete(&file_key).await;
            return Err(ProtocolError::InvalidRequest(format!(
                "合并后大小不符: 期望 {}, 实际 {}",
                session.total_size, size
            )));
        }

        let upload = FinalizedUpload {
            user_id: session.user_id.clone(),
            session_id: session_id.to_string(),
            filename: session.filename.clone(),
            mime_type: session.mime_type.clone(),
            size,
            file_key: file_key.clone(),
        };
        let record = match self.records.create(upload).await {
            Ok(record) => record,
            Err(e) => {
                // 分片保留，客户端可以再次 finalize
                let _ = self.chunks.delete(&file_key).await;
                return Err(ProtocolError::Record(format!("{:#}", e)));
            }
        };

        self.release(&session).await;

        info!(
            "上传完成: session={}, 文件={}, 大小={}, 记录={}",
            session_id, session.filename, size, record.id
        );
        Ok(FinalizeResponse::from(&record))
    }

    /// 取消会话并立即释放分片
    pub async fn cancel(&self, user_id: &str, session_id: &str) -> ProtocolResult<AckResponse> {
        let session = self.owned_session(user_id, session_id)?;
        self.release(&session).await;
        info!("上传会话已取消: {}", session_id);
        Ok(AckResponse { success: true })
    }

    /// 暂停会话，下一个分片到达时自动恢复
    pub async fn pause(&self, user_id: &str, session_id: &str) -> ProtocolResult<AckResponse> {
        self.live_session(user_id, session_id, Utc::now())?;
        self.registry.set_status(session_id, SessionStatus::Paused)?;
        debug!("上传会话已暂停: {}", session_id);
        Ok(AckResponse { success: true })
    }

    /// 查询会话状态与已接收分片
    pub async fn status(&self, user_id: &str, session_id: &str) -> ProtocolResult<SessionStatusResponse> {
        let session = self.owned_session(user_id, session_id)?;
        let status = if session.is_expired_at(Utc::now()) {
            SessionStatus::Expired
        } else {
            session.status
        };
        Ok(SessionStatusResponse {
            session_id: session.session_id.clone(),
            status,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            received_chunks: self.registry.received_indices(session_id)?,
            expires_at: session.expires_at,
        })
    }

    fn owned_session(&self, user_id: &str, session_id: &str) -> ProtocolResult<UploadSession> {
        let session = self
            .registry
            .get(session_id)?
            .ok_or_else(|| ProtocolError::SessionNotFound(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(ProtocolError::Forbidden(session_id.to_string()));
        }
        Ok(session)
    }

    fn live_session(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> ProtocolResult<UploadSession> {
        let session = self.owned_session(user_id, session_id)?;
        if session.is_expired_at(now) {
            return Err(ProtocolError::SessionExpired(session_id.to_string()));
        }
        Ok(session)
    }

    /// 删除分片数据与会话记录
    ///
    /// 分片删除失败时会话标记为过期，留给清理任务
    async fn release(&self, session: &UploadSession) {
        let id = &session.session_id;
        let chunks = match self.registry.chunks(id) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("读取会话分片失败: {}, 错误: {:#}", id, e);
                let _ = self.registry.set_status(id, SessionStatus::Expired);
                return;
            }
        };

        let mut clean = true;
        for chunk in &chunks {
            if let Err(e) = self.chunks.delete(&chunk.storage_key).await {
                warn!("释放分片失败: {}, 错误: {}", chunk.storage_key, e);
                clean = false;
            }
        }

        let result = if clean {
            self.registry.delete(id)
        } else {
            self.registry.set_status(id, SessionStatus::Expired).map(|_| ())
        };
        if let Err(e) = result {
            warn!("释放会话记录失败: {}, 错误: {:#}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::record::{LocalRecordCreator, RecordKind};
    use crate::storage::{MemoryStorage, ObjectStorage};

    struct Fixture {
        service: UploadService,
        storage: Arc<MemoryStorage>,
        records: Arc<LocalRecordCreator>,
    }

    fn fixture(chunk_size: u64) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let records = Arc::new(LocalRecordCreator::new("http://localhost/objects"));
        let service = UploadService::new(
            Arc::new(SessionRegistry::in_memory().unwrap()),
            ChunkStore::new(storage.clone()),
            records.clone(),
            ProtocolSettings {
                chunk_size,
                session_ttl: Duration::hours(1),
                max_file_size: 1024,
            },
        );
        Fixture {
            service,
            storage,
            records,
        }
    }

    fn payload(index: u32, total: u32, data: &[u8]) -> ChunkPayload {
        ChunkPayload {
            chunk_index: index,
            total_chunks: total,
            data: data.to_vec(),
            checksum: None,
        }
    }

    async fn init(f: &Fixture, name: &str, mime: &str, size: u64) -> InitUploadResponse {
        f.service
            .init(
                "alice",
                InitUploadRequest {
                    filename: name.into(),
                    mime_type: mime.into(),
                    total_size: size,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_flow_out_of_order() {
        let f = fixture(4);
        let init = init(&f, "a.txt", "text/plain", 10).await;
        assert_eq!(init.total_chunks, 3);

        let sid = init.session_id.as_str();
        f.service.upload_chunk("alice", sid, payload(2, 3, b"ij")).await.unwrap();
        f.service.upload_chunk("alice", sid, payload(0, 3, b"abcd")).await.unwrap();
        let ack = f.service.upload_chunk("alice", sid, payload(1, 3, b"efgh")).await.unwrap();
        assert_eq!(ack.received_chunks, 3);

        let resp = f.service.finalize("alice", sid).await.unwrap();
        assert!(resp.success);
        assert!(resp.file_id.is_some());

        let data = f.storage.get(&resp.file_key).await.unwrap().unwrap();
        assert_eq!(data, b"abcdefghij");

        // 分片与会话都已释放
        assert_eq!(f.storage.count_prefix("chunks/"), 0);
        assert!(f.service.registry().get(sid).unwrap().is_none());
        assert_eq!(f.records.len(), 1);
    }

    #[tokio::test]
    async fn test_reupload_does_not_change_count() {
        let f = fixture(4);
        let init = init(&f, "a.bin", "", 8).await;
        let sid = init.session_id.as_str();

        let first = f.service.upload_chunk("alice", sid, payload(0, 2, b"aaaa")).await.unwrap();
        let again = f.service.upload_chunk("alice", sid, payload(0, 2, b"bbbb")).await.unwrap();
        assert_eq!(first.received_chunks, 1);
        assert_eq!(again.received_chunks, 1);
    }

    #[tokio::test]
    async fn test_finalize_incomplete() {
        let f = fixture(4);
        let init = init(&f, "a.bin", "", 8).await;
        let sid = init.session_id.as_str();
        f.service.upload_chunk("alice", sid, payload(1, 2, b"bbbb")).await.unwrap();

        let err = f.service.finalize("alice", sid).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IncompleteUpload { received: 1, total: 2 }
        ));
        // 会话仍在，可以补传后再 finalize
        f.service.upload_chunk("alice", sid, payload(0, 2, b"aaaa")).await.unwrap();
        f.service.finalize("alice", sid).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let f = fixture(4);
        let init = init(&f, "a.bin", "", 6).await;
        let sid = init.session_id.as_str();

        let out_of_range = f.service.upload_chunk("alice", sid, payload(2, 2, b"xx")).await;
        assert!(matches!(out_of_range, Err(ProtocolError::InvalidChunk(_))));

        let wrong_total = f.service.upload_chunk("alice", sid, payload(0, 3, b"xxxx")).await;
        assert!(matches!(wrong_total, Err(ProtocolError::InvalidChunk(_))));

        let short = f.service.upload_chunk("alice", sid, payload(0, 2, b"xx")).await;
        assert!(matches!(short, Err(ProtocolError::InvalidChunk(_))));

        // 最后一片按实际剩余长度校验
        f.service.upload_chunk("alice", sid, payload(1, 2, b"yy")).await.unwrap();

        let mut bad_sum = payload(0, 2, b"xxxx");
        bad_sum.checksum = Some("00".into());
        let bad = f.service.upload_chunk("alice", sid, bad_sum).await;
        assert!(matches!(bad, Err(ProtocolError::InvalidChunk(_))));

        let mut good_sum = payload(0, 2, b"xxxx");
        good_sum.checksum = Some(format!("{:X}", md5::compute(b"xxxx")));
        f.service.upload_chunk("alice", sid, good_sum).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_validation_and_mime_guess() {
        let f = fixture(4);
        let empty = f
            .service
            .init("alice", InitUploadRequest { filename: "  ".into(), mime_type: "".into(), total_size: 1 })
            .await;
        assert!(matches!(empty, Err(ProtocolError::InvalidRequest(_))));

        let too_big = f
            .service
            .init("alice", InitUploadRequest { filename: "x".into(), mime_type: "".into(), total_size: 4096 })
            .await;
        assert!(matches!(too_big, Err(ProtocolError::InvalidRequest(_))));

        let init = init(&f, "movie.mp4", "", 4).await;
        let session = f.service.registry().get(&init.session_id).unwrap().unwrap();
        assert_eq!(session.mime_type, "video/mp4");

        f.service
            .upload_chunk("alice", &init.session_id, payload(0, 1, b"mp4!"))
            .await
            .unwrap();
        let resp = f.service.finalize("alice", &init.session_id).await.unwrap();
        let record = resp.into_record().unwrap();
        assert_eq!(record.kind, RecordKind::Video);
    }

    #[tokio::test]
    async fn test_ownership_and_missing() {
        let f = fixture(4);
        let init = init(&f, "a.bin", "", 4).await;

        let other = f.service.upload_chunk("bob", &init.session_id, payload(0, 1, b"aaaa")).await;
        assert!(matches!(other, Err(ProtocolError::Forbidden(_))));

        let missing = f.service.finalize("alice", "nope").await.unwrap_err();
        assert!(missing.is_session_gone());
    }

    #[tokio::test]
    async fn test_expired_session_rejected() {
        let f = fixture(4);
        let init = init(&f, "a.bin", "", 4).await;
        f.service
            .registry()
            .set_status(&init.session_id, SessionStatus::Expired)
            .unwrap();

        let err = f
            .service
            .upload_chunk("alice", &init.session_id, payload(0, 1, b"aaaa"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SessionExpired(_)));

        let err = f.service.finalize("alice", &init.session_id).await.unwrap_err();
        assert!(matches!(err, ProtocolError::SessionExpired(_)));
    }

    #[tokio::test]
    async fn test_cancel_releases_immediately() {
        let f = fixture(4);
        let init = init(&f, "a.bin", "", 8).await;
        let sid = init.session_id.as_str();
        f.service.upload_chunk("alice", sid, payload(0, 2, b"aaaa")).await.unwrap();

        let ack = f.service.cancel("alice", sid).await.unwrap();
        assert!(ack.success);
        assert!(f.storage.is_empty());
        assert!(f.service.registry().get(sid).unwrap().is_none());

        let again = f.service.upload_chunk("alice", sid, payload(1, 2, b"bbbb")).await;
        assert!(matches!(again, Err(ProtocolError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_pause_and_status() {
        let f = fixture(4);
        let init = init(&f, "a.bin", "", 12).await;
        let sid = init.session_id.as_str();
        f.service.upload_chunk("alice", sid, payload(0, 3, b"aaaa")).await.unwrap();
        f.service.pause("alice", sid).await.unwrap();

        let status = f.service.status("alice", sid).await.unwrap();
        assert_eq!(status.status, SessionStatus::Paused);
        assert_eq!(status.received_chunks, vec![0]);

        // 下一个分片恢复会话
        f.service.upload_chunk("alice", sid, payload(1, 3, b"bbbb")).await.unwrap();
        let status = f.service.status("alice", sid).await.unwrap();
        assert_eq!(status.status, SessionStatus::Active);
        assert_eq!(status.contiguous_prefix(), 2);
    }
}
