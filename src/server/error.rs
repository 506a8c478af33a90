// API 错误

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use crate::protocol::{ApiResponse, ProtocolError};
use crate::storage::StorageError;

/// 未归入协议错误的业务码
const CODE_NOT_FOUND: i32 = 1404;
const CODE_INTERNAL: i32 = 1500;

/// 转换为 HTTP 响应的错误，响应体使用统一的 ApiResponse 信封
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub message: String,
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, code: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, CODE_NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL, message)
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        let status = StatusCode::from_u16(err.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.api_code(), err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Self::not_found(format!("对象不存在: {}", key)),
            StorageError::InvalidKey(key) => {
                ProtocolError::InvalidRequest(format!("非法的对象 key: {}", key)).into()
            }
            StorageError::Io(e) => Self::internal(format!("存储错误: {}", e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("请求处理失败: {} ({})", self.message, self.code);
        } else {
            warn!("请求被拒绝: {} ({})", self.message, self.code);
        }
        let body = Json(ApiResponse::<()>::error(self.code, self.message));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_mapping() {
        let err: ApiError = ProtocolError::SessionExpired("s".into()).into();
        assert_eq!(err.status, StatusCode::GONE);
        assert_eq!(err.code, 1002);

        let err: ApiError = ProtocolError::IncompleteUpload {
            received: 1,
            total: 3,
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.message.contains("1/3"));
    }

    #[test]
    fn test_storage_error_mapping() {
        let err: ApiError = StorageError::NotFound("k".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = StorageError::InvalidKey("../x".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, 1005);
    }
}
