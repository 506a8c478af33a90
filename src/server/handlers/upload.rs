// 分片上传 API
//
// 调用方身份来自 X-User-Id 请求头，缺省为 anonymous

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info};

use crate::protocol::{
    AckResponse, ApiResponse, ChunkPayload, FinalizeResponse, InitUploadRequest,
    InitUploadResponse, ProtocolError, SessionStatusResponse, UploadChunkRequest,
    UploadChunkResponse,
};
use crate::server::{ApiResult, AppState};
use crate::uploader::client::USER_ID_HEADER;

const ANONYMOUS_USER: &str = "anonymous";

fn caller_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// POST /api/v1/uploads/init
/// 创建上传会话
pub async fn init_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitUploadRequest>,
) -> ApiResult<InitUploadResponse> {
    let user_id = caller_id(&headers);
    info!("API: 创建上传会话 user={}, 文件={}", user_id, req.filename);
    let resp = state.service.init(&user_id, req).await?;
    Ok(Json(ApiResponse::success(resp)))
}

/// POST /api/v1/uploads/:id/chunks
/// 上传一个分片（data 为 base64）
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UploadChunkRequest>,
) -> ApiResult<UploadChunkResponse> {
    let user_id = caller_id(&headers);
    let data = BASE64.decode(req.data.as_bytes()).map_err(|e| {
        ProtocolError::InvalidChunk(format!("分片 #{} base64 解码失败: {}", req.chunk_index, e))
    })?;
    debug!(
        "API: 上传分片 session={}, #{}/{} ({} bytes)",
        session_id,
        req.chunk_index,
        req.total_chunks,
        data.len()
    );

    let payload = ChunkPayload {
        chunk_index: req.chunk_index,
        total_chunks: req.total_chunks,
        data,
        checksum: req.checksum,
    };
    let resp = state
        .service
        .upload_chunk(&user_id, &session_id, payload)
        .await?;
    Ok(Json(ApiResponse::success(resp)))
}

/// POST /api/v1/uploads/:id/finalize
/// 合并分片并创建记录
pub async fn finalize_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<FinalizeResponse> {
    let user_id = caller_id(&headers);
    info!("API: 完成上传 session={}", session_id);
    let resp = state.service.finalize(&user_id, &session_id).await?;
    Ok(Json(ApiResponse::success(resp)))
}

/// DELETE /api/v1/uploads/:id
/// 取消上传并释放已上传的分片
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<AckResponse> {
    let user_id = caller_id(&headers);
    info!("API: 取消上传 session={}", session_id);
    let resp = state.service.cancel(&user_id, &session_id).await?;
    Ok(Json(ApiResponse::success(resp)))
}

/// POST /api/v1/uploads/:id/pause
pub async fn pause_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<AckResponse> {
    let user_id = caller_id(&headers);
    let resp = state.service.pause(&user_id, &session_id).await?;
    Ok(Json(ApiResponse::success(resp)))
}

/// GET /api/v1/uploads/:id
/// 查询会话状态与已收到的分片
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<SessionStatusResponse> {
    let user_id = caller_id(&headers);
    let resp = state.service.status(&user_id, &session_id).await?;
    Ok(Json(ApiResponse::success(resp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_id() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_id(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(caller_id(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(caller_id(&headers), "alice");
    }
}
