// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认分片大小: 2MB
///
/// 分片以 base64 编码后放在 JSON 请求体中传输，编码后约 2.67MB，
/// 加上信封开销仍远低于默认的 4MB 请求体上限
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 默认请求体上限: 4MB
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// 请求体中 JSON 信封的预留空间
const ENVELOPE_OVERHEAD_BYTES: u64 = 64 * 1024;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 会话配置（服务端）
    #[serde(default)]
    pub session: SessionConfig,
    /// 上传配置（客户端）
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// 单个请求体上限（字节），必须能容纳编码后的分片
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18890
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// 本地文件系统
    Local,
    /// 进程内存（重启即丢失，用于测试和演示）
    Memory,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 存储后端
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// 本地存储根目录
    #[serde(default = "default_storage_root")]
    pub root_dir: PathBuf,
    /// 对外可访问的文件 URL 前缀
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/objects")
}

fn default_public_base_url() -> String {
    format!("http://{}:{}/objects", default_host(), default_port())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root_dir: default_storage_root(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// 会话配置（服务端）
///
/// 控制分片大小、会话有效期以及过期清理任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 会话数据库路径
    #[serde(default = "default_session_db_path")]
    pub db_path: PathBuf,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 会话有效期（小时），每收到一个分片都会向后顺延
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
    /// 无活动多久视为废弃（小时），废弃会话无视 expires_at 直接回收
    #[serde(default = "default_abandon_after_hours")]
    pub abandon_after_hours: u64,
    /// 清理任务执行间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 单文件大小上限（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_session_db_path() -> PathBuf {
    PathBuf::from("data/meta/sessions.db")
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_session_ttl_hours() -> u64 {
    7 * 24
}

fn default_abandon_after_hours() -> u64 {
    48
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_max_file_size() -> u64 {
    20 * 1024 * 1024 * 1024 // 20GB
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: default_session_db_path(),
            chunk_size: default_chunk_size(),
            session_ttl_hours: default_session_ttl_hours(),
            abandon_after_hours: default_abandon_after_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours as i64)
    }

    pub fn abandon_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.abandon_after_hours as i64)
    }
}

/// 上传配置（客户端）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 服务端地址
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// 调用方标识（通过 X-User-Id 头传递）
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 任务级自动重试次数上限
    #[serde(default = "default_max_auto_retries")]
    pub max_auto_retries: u32,
    /// 自动重试初始退避（毫秒），每次翻倍
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 自动重试最大退避（毫秒）
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// 单个分片的重试次数
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
    /// 分片重试延迟步长（毫秒），第 n 次重试等待 n 倍步长
    #[serde(default = "default_chunk_retry_delay_ms")]
    pub chunk_retry_delay_ms: u64,
    /// 单个文件的并行分片数（1-3）
    #[serde(default = "default_parallel_chunks")]
    pub parallel_chunks: usize,
    /// 带宽上限（字节/秒），0 表示不限速
    ///
    /// 所有并发上传和并行分片合计计算
    #[serde(default)]
    pub bandwidth_limit_bytes_per_sec: i64,
    /// 是否为每个上传单独维护自适应状态
    #[serde(default)]
    pub per_upload_adaptive: bool,
    /// 调度器 tick 间隔（毫秒）
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 恢复快照文件路径
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// 上传历史数据库路径
    #[serde(default = "default_history_db_path")]
    pub history_db_path: PathBuf,
    /// 上传文件夹时是否跳过隐藏文件（以.开头的文件/文件夹）
    #[serde(default)]
    pub skip_hidden_files: bool,
}

fn default_server_url() -> String {
    format!("http://{}:{}", default_host(), default_port())
}

fn default_user_id() -> String {
    "anonymous".to_string()
}

fn default_max_concurrent_uploads() -> usize {
    3
}

fn default_max_auto_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_chunk_retry_delay_ms() -> u64 {
    1_000
}

fn default_parallel_chunks() -> usize {
    1
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/client/queue_snapshot.json")
}

fn default_history_db_path() -> PathBuf {
    PathBuf::from("data/client/history.db")
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            user_id: default_user_id(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_auto_retries: default_max_auto_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            chunk_retries: default_chunk_retries(),
            chunk_retry_delay_ms: default_chunk_retry_delay_ms(),
            parallel_chunks: default_parallel_chunks(),
            bandwidth_limit_bytes_per_sec: 0,
            per_upload_adaptive: false,
            tick_interval_ms: default_tick_interval_ms(),
            snapshot_path: default_snapshot_path(),
            history_db_path: default_history_db_path(),
            skip_hidden_files: false,
        }
    }
}

impl UploadConfig {
    /// 第 attempt 次自动重试前的退避时长（attempt 从 1 开始）
    ///
    /// # 延迟序列（默认配置）
    /// - attempt=1: 2s
    /// - attempt=2: 4s
    /// - attempt=3: 8s
    /// - 最大: 60s
    pub fn retry_backoff(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        std::time::Duration::from_millis(delay)
    }

    /// 并行分片数限制在 1-3
    pub fn clamped_parallelism(&self) -> usize {
        self.parallel_chunks.clamp(1, 3)
    }
}

impl AppConfig {
    /// 校验配置的一致性
    pub fn validate(&self) -> Result<()> {
        if self.session.chunk_size == 0 {
            anyhow::bail!("session.chunk_size 必须大于 0");
        }

        // base64 编码后长度为 4/3，加上信封必须放得进请求体
        let encoded = self.session.chunk_size.div_ceil(3) * 4;
        if encoded + ENVELOPE_OVERHEAD_BYTES > self.server.max_body_bytes as u64 {
            anyhow::bail!(
                "分片大小 {} 编码后约 {} 字节，超过请求体上限 {}",
                self.session.chunk_size,
                encoded,
                self.server.max_body_bytes
            );
        }

        // 分片序号是 u32，最大文件的分片数必须放得下
        let max_chunks = self.session.max_file_size.div_ceil(self.session.chunk_size);
        if max_chunks > u32::MAX as u64 {
            anyhow::bail!(
                "session.chunk_size {} 过小，{} 字节的文件需要 {} 个分片，超过上限 {}",
                self.session.chunk_size,
                self.session.max_file_size,
                max_chunks,
                u32::MAX
            );
        }

        if self.session.abandon_after_hours == 0 {
            anyhow::bail!("session.abandon_after_hours 必须大于 0");
        }

        if self.upload.max_concurrent_uploads == 0 {
            anyhow::bail!("upload.max_concurrent_uploads 必须大于 0");
        }

        if !(1..=3).contains(&self.upload.parallel_chunks) {
            tracing::warn!(
                "upload.parallel_chunks={} 超出范围，将按 {} 处理",
                self.upload.parallel_chunks,
                self.upload.clamped_parallelism()
            );
        }

        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
