use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务端上传会话，每次 init 创建一个
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub user_id: String,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// 每收到一个分片都向后顺延
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl UploadSession {
    /// 分片数 = ceil(total_size / chunk_size)
    pub fn chunk_count(total_size: u64, chunk_size: u64) -> u32 {
        if chunk_size == 0 {
            return 0;
        }
        total_size.div_ceil(chunk_size) as u32
    }

    /// 指定分片应有的字节数，最后一片可能不足 chunk_size
    pub fn expected_chunk_len(&self, chunk_index: u32) -> u64 {
        let start = chunk_index as u64 * self.chunk_size;
        self.total_size.saturating_sub(start).min(self.chunk_size)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Expired || self.expires_at <= now
    }
}

/// 已接收的分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunkRecord {
    pub session_id: String,
    pub chunk_index: u32,
    pub storage_key: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        let mb = 1024 * 1024;
        assert_eq!(UploadSession::chunk_count(0, 2 * mb), 0);
        assert_eq!(UploadSession::chunk_count(1, 2 * mb), 1);
        assert_eq!(UploadSession::chunk_count(2 * mb, 2 * mb), 1);
        assert_eq!(UploadSession::chunk_count(2 * mb + 1, 2 * mb), 2);
        assert_eq!(UploadSession::chunk_count(40 * mb, 2 * mb), 20);
    }

    #[test]
    fn test_expected_chunk_len() {
        let now = Utc::now();
        let session = UploadSession {
            session_id: "s".into(),
            user_id: "u".into(),
            filename: "f".into(),
            mime_type: "application/octet-stream".into(),
            total_size: 25,
            chunk_size: 10,
            total_chunks: 3,
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now,
            last_activity_at: now,
        };
        assert_eq!(session.expected_chunk_len(0), 10);
        assert_eq!(session.expected_chunk_len(2), 5);
        assert_eq!(session.expected_chunk_len(3), 0);
    }

    #[test]
    fn test_status_parse() {
        for s in [SessionStatus::Active, SessionStatus::Paused, SessionStatus::Expired] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse("done"), None);
    }
}
