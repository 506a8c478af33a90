// 维护与文件读取 API

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{Json, Response},
};
use serde::Serialize;
use tracing::info;

use crate::protocol::ApiResponse;
use crate::server::{ApiError, ApiResult, AppState};
use crate::session::SweepResult;

/// 健康检查响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub storage: String,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        storage: state.storage.backend_name().to_string(),
    })
}

/// POST /api/v1/maintenance/sweep
/// 立即执行一次过期会话清理
pub async fn trigger_sweep(State(state): State<AppState>) -> ApiResult<SweepResult> {
    info!("API: 手动触发会话清理");
    let result = state.sweeper.sweep().await;
    Ok(Json(ApiResponse::success(result)))
}

/// GET /objects/*key
/// 读取已合并的文件
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let data = state
        .storage
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("对象不存在: {}", key)))?;

    let mime = mime_guess::from_path(&key).first_or_octet_stream();
    let mut response = Response::new(Body::from(data));
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
