// 上传执行器
//
// 队列管理器按上传类别调用对应的执行器，执行器负责跑完一次分片上传协议：
// init（或复用会话）→ 分批上传分片 → finalize
//
// 执行器只通过 ProgressReporter 回报会话绑定与续传点，不直接修改上传项

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::protocol::{ChunkPayload, DomainRecord, InitUploadRequest};
use crate::session::{SessionStatus, UploadSession};
use crate::uploader::adaptive::AdaptiveController;
use crate::uploader::chunk::{read_chunk, ChunkPlan};
use crate::uploader::client::{TransportError, UploadTransport};
use crate::uploader::task::UploadItem;

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(DomainRecord),
    Failed(String),
    /// 协作式取消（暂停或取消），不算失败
    Cancelled,
}

/// 执行过程中回报给管理器的进度
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// init 成功，绑定服务端会话
    SessionBound { session_id: String },
    /// 一批分片完成
    Chunk {
        /// 连续确认的分片数，即下次续传的起点
        resume_point: u32,
        completed_chunks: u32,
        total_chunks: u32,
        uploaded_bytes: u64,
        /// 字节/秒
        speed: u64,
    },
}

/// 进度接收方
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, item_id: &str, run_id: u64, update: ProgressUpdate);
}

/// 绑定到某一次执行的进度回报器
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Option<Arc<dyn ProgressSink>>,
    item_id: String,
    run_id: u64,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, item_id: impl Into<String>, run_id: u64) -> Self {
        Self {
            sink: Some(sink),
            item_id: item_id.into(),
            run_id,
        }
    }

    /// 不回报任何进度
    pub fn detached(item_id: impl Into<String>) -> Self {
        Self {
            sink: None,
            item_id: item_id.into(),
            run_id: 0,
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn report(&self, update: ProgressUpdate) {
        if let Some(sink) = &self.sink {
            sink.on_progress(&self.item_id, self.run_id, update);
        }
    }
}

/// 执行上下文
pub struct ExecutionContext {
    /// 启动时的上传项快照
    pub item: UploadItem,
    /// 暂停时记录的续传点
    pub resume_from_chunk: Option<u32>,
    pub cancel: CancellationToken,
    pub reporter: ProgressReporter,
}

/// 按上传类别注册的执行器
#[async_trait]
pub trait UploadExecutor: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> ExecutionOutcome;

    /// 取消后释放服务端会话，尽力而为
    async fn release(&self, _session_id: &str) {}

    /// 暂停时通知服务端，尽力而为
    async fn suspend(&self, _session_id: &str) {}
}

/// 分片上传参数
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// 单个分片的重试次数
    pub chunk_retries: u32,
    /// 第 n 次重试前等待 n * chunk_retry_delay
    pub chunk_retry_delay: Duration,
    /// 用户配置的并行分片数（1-3）
    pub parallel_chunks: usize,
    /// 每次执行使用独立的自适应控制器
    pub per_upload_adaptive: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            chunk_retries: 3,
            chunk_retry_delay: Duration::from_millis(1000),
            parallel_chunks: 1,
            per_upload_adaptive: false,
        }
    }
}

impl From<&UploadConfig> for ExecutorOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_retries: config.chunk_retries,
            chunk_retry_delay: Duration::from_millis(config.chunk_retry_delay_ms),
            parallel_chunks: config.clamped_parallelism(),
            per_upload_adaptive: config.per_upload_adaptive,
        }
    }
}

/// 执行中断原因
#[derive(Debug)]
enum RunError {
    Cancelled,
    SessionGone(String),
    Failed(String),
}

impl From<TransportError> for RunError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::SessionGone(msg) => RunError::SessionGone(msg),
            other => RunError::Failed(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for RunError {
    fn from(e: anyhow::Error) -> Self {
        RunError::Failed(format!("{:#}", e))
    }
}

/// 服务端会话信息
struct BoundSession {
    session_id: String,
    chunk_size: u64,
    total_chunks: u32,
    received: Vec<u32>,
}

/// 分片上传执行器
pub struct ChunkedUploadExecutor {
    transport: Arc<dyn UploadTransport>,
    controller: Arc<AdaptiveController>,
    options: ExecutorOptions,
}

impl ChunkedUploadExecutor {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        controller: Arc<AdaptiveController>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            transport,
            controller,
            options,
        }
    }

    pub fn controller(&self) -> &Arc<AdaptiveController> {
        &self.controller
    }

    fn controller_for_run(&self) -> Arc<AdaptiveController> {
        if self.options.per_upload_adaptive {
            Arc::new(AdaptiveController::with_pacer(self.controller.pacer().clone()))
        } else {
            self.controller.clone()
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<DomainRecord, RunError> {
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let item = &ctx.item;
        let meta = tokio::fs::metadata(&item.local_path)
            .await
            .map_err(|e| RunError::Failed(format!("无法读取源文件 {:?}: {}", item.local_path, e)))?;
        if meta.len() != item.file_size {
            return Err(RunError::Failed(format!(
                "源文件大小已变化: 期望 {}, 实际 {}",
                item.file_size,
                meta.len()
            )));
        }

        let controller = self.controller_for_run();
        let mut reused = item.session_id.clone();

        loop {
            let (session, from_reuse) = match reused.take() {
                Some(sid) => match self.reuse_session(item, &sid).await? {
                    Some(session) => {
                        info!(
                            "复用上传会话: item={}, session={}, 服务端已有 {} 片, 续传点 {:?}",
                            item.id,
                            sid,
                            session.received.len(),
                            ctx.resume_from_chunk
                        );
                        (session, true)
                    }
                    None => (self.init_session(ctx).await?, false),
                },
                None => (self.init_session(ctx).await?, false),
            };

            match self.transfer(ctx, &controller, &session).await {
                Err(RunError::SessionGone(msg)) if from_reuse => {
                    // 复用的会话在传输中失效，重新 init 一次
                    warn!("上传会话已失效，重新初始化: item={}, {}", item.id, msg);
                    continue;
                }
                other => return other,
            }
        }
    }

    /// 查询已绑定会话，失效时返回 None
    async fn reuse_session(
        &self,
        item: &UploadItem,
        session_id: &str,
    ) -> Result<Option<BoundSession>, RunError> {
        let status = match self.transport.status(session_id).await {
            Ok(status) => status,
            Err(e) if e.is_session_gone() => {
                info!("上传会话已不存在，将重新初始化: item={}, session={}", item.id, session_id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if status.status == SessionStatus::Expired {
            info!("上传会话已过期，将重新初始化: item={}, session={}", item.id, session_id);
            return Ok(None);
        }
        if UploadSession::chunk_count(item.file_size, status.chunk_size) != status.total_chunks {
            warn!("会话分片数与本地文件不符，重新初始化: session={}", session_id);
            return Ok(None);
        }

        Ok(Some(BoundSession {
            session_id: status.session_id,
            chunk_size: status.chunk_size,
            total_chunks: status.total_chunks,
            received: status.received_chunks,
        }))
    }

    async fn init_session(&self, ctx: &ExecutionContext) -> Result<BoundSession, RunError> {
        let item = &ctx.item;
        let req = InitUploadRequest {
            filename: item.filename.clone(),
            mime_type: item.mime_type.clone(),
            total_size: item.file_size,
        };
        let resp = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(RunError::Cancelled),
            r = self.transport.init(&req) => r.map_err(|e| RunError::Failed(e.to_string()))?,
        };

        info!(
            "上传会话已创建: item={}, session={}, 共 {} 片",
            item.id, resp.session_id, resp.total_chunks
        );
        ctx.reporter.report(ProgressUpdate::SessionBound {
            session_id: resp.session_id.clone(),
        });

        Ok(BoundSession {
            session_id: resp.session_id,
            chunk_size: resp.chunk_size,
            total_chunks: resp.total_chunks,
            received: Vec::new(),
        })
    }

    async fn transfer(
        &self,
        ctx: &ExecutionContext,
        controller: &Arc<AdaptiveController>,
        session: &BoundSession,
    ) -> Result<DomainRecord, RunError> {
        let item = &ctx.item;
        let mut plan = ChunkPlan::new(item.file_size, session.chunk_size, session.total_chunks)
            .with_received(session.received.iter().copied());

        let started = Instant::now();
        let base_bytes = plan.uploaded_bytes();
        self.report_chunks(ctx, &plan, 0);

        loop {
            let pending = plan.pending();
            if pending.is_empty() {
                break;
            }
            if ctx.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let degree = controller.concurrency(self.options.parallel_chunks);
            let batch: Vec<u32> = pending.into_iter().take(degree).collect();
            debug!("上传分片批次: item={}, 分片={:?}", item.id, batch);

            let mut join_set = JoinSet::new();
            for index in &batch {
                let job = ChunkJob {
                    transport: self.transport.clone(),
                    controller: controller.clone(),
                    path: item.local_path.clone(),
                    session_id: session.session_id.clone(),
                    index: *index,
                    total_chunks: plan.chunk_count(),
                    range: plan.range(*index),
                    retries: self.options.chunk_retries,
                    retry_delay: self.options.chunk_retry_delay,
                    cancel: ctx.cancel.clone(),
                };
                join_set.spawn(job.run());
            }

            let mut first_error = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((index, Ok(()))) => plan.mark_acked(index),
                    Ok((_, Err(e))) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(RunError::Failed(format!("分片任务异常退出: {}", e)));
                        }
                    }
                }
            }

            let elapsed = started.elapsed().as_secs_f64().max(0.001);
            let speed = ((plan.uploaded_bytes() - base_bytes) as f64 / elapsed) as u64;
            self.report_chunks(ctx, &plan, speed);

            if let Some(e) = first_error {
                return Err(e);
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let resp = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(RunError::Cancelled),
            r = self.transport.finalize(&session.session_id) => r?,
        };
        resp.into_record()
            .ok_or_else(|| RunError::Failed("finalize 响应缺少记录 id".to_string()))
    }

    fn report_chunks(&self, ctx: &ExecutionContext, plan: &ChunkPlan, speed: u64) {
        ctx.reporter.report(ProgressUpdate::Chunk {
            resume_point: plan.resume_point(),
            completed_chunks: plan.completed_count(),
            total_chunks: plan.chunk_count(),
            uploaded_bytes: plan.uploaded_bytes(),
            speed,
        });
    }
}

#[async_trait]
impl UploadExecutor for ChunkedUploadExecutor {
    async fn run(&self, ctx: ExecutionContext) -> ExecutionOutcome {
        info!("开始上传: item={}, 文件={}", ctx.item.id, ctx.item.filename);

        match self.execute(&ctx).await {
            Ok(record) => {
                info!("上传成功: item={}, 记录={}", ctx.item.id, record.id);
                ExecutionOutcome::Completed(record)
            }
            Err(RunError::Cancelled) => {
                info!("上传已中止: item={}", ctx.item.id);
                ExecutionOutcome::Cancelled
            }
            Err(_) if ctx.cancel.is_cancelled() => ExecutionOutcome::Cancelled,
            Err(RunError::SessionGone(msg)) | Err(RunError::Failed(msg)) => {
                error!("上传失败: item={}, 错误: {}", ctx.item.id, msg);
                ExecutionOutcome::Failed(msg)
            }
        }
    }

    async fn release(&self, session_id: &str) {
        if let Err(e) = self.transport.cancel(session_id).await {
            warn!("释放上传会话失败: session={}, 错误: {}", session_id, e);
        }
    }

    async fn suspend(&self, session_id: &str) {
        if let Err(e) = self.transport.pause(session_id).await {
            debug!("通知服务端暂停失败: session={}, 错误: {}", session_id, e);
        }
    }
}

/// 单个分片的上传任务
struct ChunkJob {
    transport: Arc<dyn UploadTransport>,
    controller: Arc<AdaptiveController>,
    path: PathBuf,
    session_id: String,
    index: u32,
    total_chunks: u32,
    range: std::ops::Range<u64>,
    retries: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl ChunkJob {
    async fn run(self) -> (u32, Result<(), RunError>) {
        let index = self.index;
        (index, self.upload().await)
    }

    async fn upload(self) -> Result<(), RunError> {
        let data = read_chunk(&self.path, self.range.clone()).await?;
        let len = data.len() as u64;
        let payload = ChunkPayload {
            chunk_index: self.index,
            total_chunks: self.total_chunks,
            checksum: Some(format!("{:x}", md5::compute(&data))),
            data,
        };

        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let started = Instant::now();
            let timeout = self.controller.timeout();
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
                r = tokio::time::timeout(timeout, self.transport.upload_chunk(&self.session_id, &payload)) => {
                    r.unwrap_or(Err(TransportError::Timeout))
                }
            };

            match result {
                Ok(_) => {
                    let elapsed = started.elapsed();
                    self.controller.record_success(len, elapsed);

                    let delay = self.controller.throttle_delay(len, started);
                    if !delay.is_zero() {
                        debug!("[分片#{}] 限速等待 {:?}", self.index, delay);
                        self.sleep(delay).await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.controller.record_failure();

                    if !e.is_retryable() || attempt >= self.retries {
                        warn!(
                            "[分片#{}] 上传失败，不再重试 (已重试 {} 次): {}",
                            self.index, attempt, e
                        );
                        return Err(e.into());
                    }

                    attempt += 1;
                    let delay = self.retry_delay * attempt;
                    warn!(
                        "[分片#{}] 上传失败，{:?} 后重试 ({}/{}): {}",
                        self.index, delay, attempt, self.retries, e
                    );
                    self.sleep(delay).await?;
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<(), RunError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RunError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
