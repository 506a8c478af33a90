// 上传协议客户端
//
// HttpUploadClient 走 HTTP 接口，LocalTransport 直接调用进程内的 UploadService

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{
    AckResponse, ApiResponse, ChunkPayload, FinalizeResponse, InitUploadRequest,
    InitUploadResponse, ProtocolError, SessionStatusResponse, UploadChunkRequest,
    UploadChunkResponse, UploadService,
};

/// 调用方身份请求头
pub const USER_ID_HEADER: &str = "X-User-Id";

/// 单次请求的兜底超时，分片级超时由自适应控制器另行约束
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// 客户端侧协议错误
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// 会话不存在或已过期，需要重新 init
    #[error("上传会话已失效: {0}")]
    SessionGone(String),

    #[error("服务端拒绝请求 ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("网络错误: {0}")]
    Network(String),

    #[error("请求超时")]
    Timeout,

    #[error("响应解析失败: {0}")]
    Decode(String),
}

impl TransportError {
    /// 可以在分片级别重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Rejected { status, .. } => *status >= 500 || *status == 429,
            TransportError::SessionGone(_) | TransportError::Decode(_) => false,
        }
    }

    pub fn is_session_gone(&self) -> bool {
        matches!(self, TransportError::SessionGone(_))
    }

    fn from_status(status: u16, message: String) -> Self {
        match status {
            404 | 410 => TransportError::SessionGone(message),
            _ => TransportError::Rejected { status, message },
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::from_status(e.http_status(), e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// 分片上传协议的客户端接口
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn init(&self, req: &InitUploadRequest) -> TransportResult<InitUploadResponse>;

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkPayload,
    ) -> TransportResult<UploadChunkResponse>;

    async fn finalize(&self, session_id: &str) -> TransportResult<FinalizeResponse>;

    async fn cancel(&self, session_id: &str) -> TransportResult<AckResponse>;

    async fn status(&self, session_id: &str) -> TransportResult<SessionStatusResponse>;

    async fn pause(&self, session_id: &str) -> TransportResult<AckResponse>;
}

/// HTTP 协议客户端
#[derive(Debug, Clone)]
pub struct HttpUploadClient {
    client: Client,
    base_url: String,
    user_id: String,
}

impl HttpUploadClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `server_url` - 服务地址，例如 `http://127.0.0.1:18890`
    /// * `user_id` - 通过 `X-User-Id` 发送的调用方标识
    pub fn new(server_url: &str, user_id: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("{}/api/v1/uploads", server_url.trim_end_matches('/')),
            user_id: user_id.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> TransportResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(USER_ID_HEADER, &self.user_id);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!("{} {} -> {}", method, url, status);

        parse_envelope(status, &text)
    }
}

/// 解析统一响应信封
fn parse_envelope<T: DeserializeOwned>(status: StatusCode, text: &str) -> TransportResult<T> {
    let envelope: Option<ApiResponse<T>> = serde_json::from_str(text).ok();

    if !status.is_success() {
        let message = envelope
            .map(|e| e.message)
            .unwrap_or_else(|| text.chars().take(200).collect());
        return Err(TransportError::from_status(status.as_u16(), message));
    }

    let envelope = envelope.ok_or_else(|| {
        TransportError::Decode(format!("无法解析响应: {}", text.chars().take(200).collect::<String>()))
    })?;
    if envelope.code != 0 {
        return Err(TransportError::Rejected {
            status: status.as_u16(),
            message: envelope.message,
        });
    }
    envelope
        .data
        .ok_or_else(|| TransportError::Decode("响应缺少 data 字段".to_string()))
}

#[async_trait]
impl UploadTransport for HttpUploadClient {
    async fn init(&self, req: &InitUploadRequest) -> TransportResult<InitUploadResponse> {
        self.send(Method::POST, "/init", Some(req)).await
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkPayload,
    ) -> TransportResult<UploadChunkResponse> {
        let body = UploadChunkRequest {
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            data: BASE64.encode(&chunk.data),
            checksum: chunk.checksum.clone(),
        };
        self.send(Method::POST, &format!("/{}/chunks", session_id), Some(&body))
            .await
    }

    async fn finalize(&self, session_id: &str) -> TransportResult<FinalizeResponse> {
        self.send::<(), _>(Method::POST, &format!("/{}/finalize", session_id), None)
            .await
    }

    async fn cancel(&self, session_id: &str) -> TransportResult<AckResponse> {
        self.send::<(), _>(Method::DELETE, &format!("/{}", session_id), None)
            .await
    }

    async fn status(&self, session_id: &str) -> TransportResult<SessionStatusResponse> {
        self.send::<(), _>(Method::GET, &format!("/{}", session_id), None)
            .await
    }

    async fn pause(&self, session_id: &str) -> TransportResult<AckResponse> {
        self.send::<(), _>(Method::POST, &format!("/{}/pause", session_id), None)
            .await
    }
}

/// 进程内协议客户端
#[derive(Clone)]
pub struct LocalTransport {
    service: Arc<UploadService>,
    user_id: String,
}

impl LocalTransport {
    pub fn new(service: Arc<UploadService>, user_id: impl Into<String>) -> Self {
        Self {
            service,
            user_id: user_id.into(),
        }
    }

    pub fn service(&self) -> &Arc<UploadService> {
        &self.service
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn init(&self, req: &InitUploadRequest) -> TransportResult<InitUploadResponse> {
        Ok(self.service.init(&self.user_id, req.clone()).await?)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkPayload,
    ) -> TransportResult<UploadChunkResponse> {
        Ok(self
            .service
            .upload_chunk(&self.user_id, session_id, chunk.clone())
            .await?)
    }

    async fn finalize(&self, session_id: &str) -> TransportResult<FinalizeResponse> {
        Ok(self.service.finalize(&self.user_id, session_id).await?)
    }

    async fn cancel(&self, session_id: &str) -> TransportResult<AckResponse> {
        Ok(self.service.cancel(&self.user_id, session_id).await?)
    }

    async fn status(&self, session_id: &str) -> TransportResult<SessionStatusResponse> {
        Ok(self.service.status(&self.user_id, session_id).await?)
    }

    async fn pause(&self, session_id: &str) -> TransportResult<AckResponse> {
        Ok(self.service.pause(&self.user_id, session_id).await?)
    }
}
