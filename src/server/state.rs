// 应用状态

use std::sync::Arc;

use crate::config::AppConfig;
use crate::protocol::{LocalRecordCreator, ProtocolSettings, RecordCreator, UploadService};
use crate::session::{CleanupSweeper, SessionRegistry};
use crate::storage::{build_storage, ChunkStore, MemoryStorage, ObjectStorage};

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 分片上传服务
    pub service: Arc<UploadService>,
    /// 过期会话清理
    pub sweeper: Arc<CleanupSweeper>,
    /// 对象存储（用于读取已合并的文件）
    pub storage: Arc<dyn ObjectStorage>,
    /// 应用配置
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 按配置创建存储后端与会话数据库
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let storage = build_storage(&config.storage)?;
        let registry = Arc::new(SessionRegistry::open(&config.session.db_path)?);
        Ok(Self::assemble(config, storage, registry))
    }

    /// 全部放在内存中，用于测试和嵌入式场景
    pub fn in_memory(config: AppConfig) -> anyhow::Result<Self> {
        let storage: Arc<dyn ObjectStorage> = Arc::new(MemoryStorage::new());
        let registry = Arc::new(SessionRegistry::in_memory()?);
        Ok(Self::assemble(config, storage, registry))
    }

    fn assemble(
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let chunks = ChunkStore::new(storage.clone());
        let records: Arc<dyn RecordCreator> =
            Arc::new(LocalRecordCreator::new(config.storage.public_base_url.clone()));
        let service = UploadService::new(
            registry.clone(),
            chunks.clone(),
            records,
            ProtocolSettings::from(&config.session),
        );
        let sweeper = CleanupSweeper::new(registry, chunks, config.session.abandon_after());

        Self {
            service: Arc::new(service),
            sweeper: Arc::new(sweeper),
            storage,
            config: Arc::new(config),
        }
    }
}
