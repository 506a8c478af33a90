// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 按配置构建 CORS 层，包含 "*" 时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("忽略无效的 CORS 源: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// 构建完整路由
pub fn build_router(state: AppState) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.server.cors_origins));

    // 上传API
    let upload_routes = Router::new()
        .route("/init", post(handlers::init_upload))
        .route(
            "/:id",
            get(handlers::get_upload_status).delete(handlers::cancel_upload),
        )
        .route("/:id/chunks", post(handlers::upload_chunk))
        .route("/:id/finalize", post(handlers::finalize_upload))
        .route("/:id/pause", post(handlers::pause_upload));

    let api_routes = Router::new()
        .nest("/uploads", upload_routes)
        .route("/maintenance/sweep", post(handlers::trigger_sweep));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/objects/*key", get(handlers::get_object))
        .route("/health", get(handlers::health_check))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::{
        ApiResponse, FinalizeResponse, InitUploadResponse, SessionStatusResponse,
        UploadChunkResponse,
    };
    use crate::session::SweepResult;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::ServiceExt;

    fn app() -> Router {
        let mut config = AppConfig::default();
        config.session.chunk_size = 4;
        config.storage.public_base_url = "http://files.test/objects".into();
        build_router(AppState::in_memory(config).unwrap())
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        user: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-User-Id", user);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn envelope<T: DeserializeOwned>(bytes: &[u8]) -> ApiResponse<T> {
        serde_json::from_slice(bytes).unwrap()
    }

    async fn init(app: &Router, user: &str, size: u64) -> InitUploadResponse {
        let (status, body) = call(
            app,
            "POST",
            "/api/v1/uploads/init",
            user,
            Some(json!({"filename": "notes.txt", "mime_type": "text/plain", "total_size": size})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        envelope::<InitUploadResponse>(&body).data.unwrap()
    }

    fn chunk_body(index: u32, total: u32, data: &[u8]) -> serde_json::Value {
        json!({"chunk_index": index, "total_chunks": total, "data": BASE64.encode(data)})
    }

    #[tokio::test]
    async fn test_full_upload_over_http() {
        let app = app();
        let session = init(&app, "alice", 11).await;
        assert_eq!(session.total_chunks, 3);
        let sid = session.session_id;

        let parts: [&[u8]; 3] = [b"hell", b"o wo", b"rld"];
        for (i, part) in parts.iter().enumerate() {
            let (status, body) = call(
                &app,
                "POST",
                &format!("/api/v1/uploads/{}/chunks", sid),
                "alice",
                Some(chunk_body(i as u32, 3, part)),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            let ack = envelope::<UploadChunkResponse>(&body).data.unwrap();
            assert_eq!(ack.received_chunks, i as u32 + 1);
        }

        let (_, body) = call(&app, "GET", &format!("/api/v1/uploads/{}", sid), "alice", None).await;
        let status = envelope::<SessionStatusResponse>(&body).data.unwrap();
        assert_eq!(status.received_chunks, vec![0, 1, 2]);

        let (code, body) = call(
            &app,
            "POST",
            &format!("/api/v1/uploads/{}/finalize", sid),
            "alice",
            None,
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        let done = envelope::<FinalizeResponse>(&body).data.unwrap();
        assert!(done.file_id.is_some());
        assert!(done.url.starts_with("http://files.test/objects/"));

        let (code, body) = call(&app, "GET", &format!("/objects/{}", done.file_key), "alice", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_error_envelopes() {
        let app = app();

        let (status, body) = call(&app, "GET", "/api/v1/uploads/missing", "alice", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let resp = envelope::<serde_json::Value>(&body);
        assert_eq!(resp.code, 1001);
        assert!(resp.data.is_none());

        let sid = init(&app, "alice", 10).await.session_id;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/v1/uploads/{}/chunks", sid),
            "alice",
            Some(json!({"chunk_index": 0, "total_chunks": 3, "data": "***"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope::<serde_json::Value>(&body).code, 1004);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/v1/uploads/{}/chunks", sid),
            "mallory",
            Some(chunk_body(0, 3, b"hell")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/v1/uploads/{}/finalize", sid),
            "alice",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(envelope::<serde_json::Value>(&body).code, 1003);

        let (status, _) = call(&app, "DELETE", &format!("/api/v1/uploads/{}", sid), "alice", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", &format!("/api/v1/uploads/{}", sid), "alice", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sweep_and_health() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/v1/maintenance/sweep", "ops", None).await;
        assert_eq!(status, StatusCode::OK);
        let result = envelope::<SweepResult>(&body).data.unwrap();
        assert_eq!(result.expired_sessions, 0);

        let (status, body) = call(&app, "GET", "/health", "ops", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["storage"], "memory");

        let (status, _) = call(&app, "GET", "/objects/files/none.txt", "ops", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
