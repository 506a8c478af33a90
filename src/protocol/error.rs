use crate::storage::StorageError;
use thiserror::Error;

/// 分片上传协议错误
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("会话不存在: {0}")]
    SessionNotFound(String),

    #[error("会话已过期: {0}")]
    SessionExpired(String),

    #[error("上传不完整: 已收到 {received}/{total} 个分片")]
    IncompleteUpload { received: u32, total: u32 },

    #[error("分片无效: {0}")]
    InvalidChunk(String),

    #[error("请求无效: {0}")]
    InvalidRequest(String),

    #[error("无权操作该会话: {0}")]
    Forbidden(String),

    #[error("创建记录失败: {0}")]
    Record(String),

    #[error("存储错误: {0}")]
    Storage(#[from] StorageError),

    #[error("数据库错误: {0:#}")]
    Database(#[from] anyhow::Error),
}

impl ProtocolError {
    /// 对应的 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        match self {
            ProtocolError::SessionNotFound(_) => 404,
            ProtocolError::SessionExpired(_) => 410,
            ProtocolError::IncompleteUpload { .. } => 409,
            ProtocolError::InvalidChunk(_) | ProtocolError::InvalidRequest(_) => 400,
            ProtocolError::Forbidden(_) => 403,
            ProtocolError::Record(_) => 502,
            ProtocolError::Storage(_) | ProtocolError::Database(_) => 500,
        }
    }

    /// 响应体中的业务错误码（0 表示成功）
    pub fn api_code(&self) -> i32 {
        match self {
            ProtocolError::SessionNotFound(_) => 1001,
            ProtocolError::SessionExpired(_) => 1002,
            ProtocolError::IncompleteUpload { .. } => 1003,
            ProtocolError::InvalidChunk(_) => 1004,
            ProtocolError::InvalidRequest(_) => 1005,
            ProtocolError::Forbidden(_) => 1006,
            ProtocolError::Record(_) => 1101,
            ProtocolError::Storage(_) => 1102,
            ProtocolError::Database(_) => 1103,
        }
    }

    /// 会话已不可用，客户端需要重新 init
    pub fn is_session_gone(&self) -> bool {
        matches!(
            self,
            ProtocolError::SessionNotFound(_) | ProtocolError::SessionExpired(_)
        )
    }
}
