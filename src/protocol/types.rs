//! 协议请求/响应类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{DomainRecord, RecordKind};
use crate::session::SessionStatus;

/// 统一响应信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 0 为成功，其余为错误码
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub filename: String,
    /// 为空时按文件名推断
    #[serde(default)]
    pub mime_type: String,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitUploadResponse {
    pub session_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub expires_at: DateTime<Utc>,
}

/// 分片请求体，data 为 base64 编码的分片字节
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkRequest {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: String,
    /// 分片原始字节的 MD5（十六进制）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// 解码后的分片
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: Vec<u8>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub success: bool,
    pub received_chunks: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    pub url: String,
    pub file_key: String,
}

impl From<&DomainRecord> for FinalizeResponse {
    fn from(record: &DomainRecord) -> Self {
        let (file_id, video_id) = match record.kind {
            RecordKind::File => (Some(record.id.clone()), None),
            RecordKind::Video => (None, Some(record.id.clone())),
        };
        Self {
            success: true,
            file_id,
            video_id,
            url: record.url.clone(),
            file_key: record.file_key.clone(),
        }
    }
}

impl FinalizeResponse {
    /// 还原为领域记录，两个 id 都缺失时返回 None
    pub fn into_record(self) -> Option<DomainRecord> {
        let (id, kind) = match (self.video_id, self.file_id) {
            (Some(id), _) => (id, RecordKind::Video),
            (None, Some(id)) => (id, RecordKind::File),
            (None, None) => return None,
        };
        Some(DomainRecord {
            id,
            kind,
            url: self.url,
            file_key: self.file_key,
        })
    }
}

/// cancel / pause 的应答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// 服务端已持有的分片序号，升序
    pub received_chunks: Vec<u32>,
    pub expires_at: DateTime<Utc>,
}

impl SessionStatusResponse {
    /// 从 0 开始连续已收到的分片数
    pub fn contiguous_prefix(&self) -> u32 {
        let mut next = 0;
        for &i in &self.received_chunks {
            if i != next {
                break;
            }
            next += 1;
        }
        next
    }
}
