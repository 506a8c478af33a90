//! 对象存储模块
//!
//! 分片与合并后的文件都以 key 存放在 `ObjectStorage` 中，
//! `ChunkStore` 负责 key 的布局

mod local;
mod memory;

pub use local::LocalFileStorage;
pub use memory::MemoryStorage;

use crate::config::{StorageBackend, StorageConfig};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;

const MAX_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("对象不存在: {0}")]
    NotFound(String),
    #[error("非法的对象 key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 按 key 存取字节的存储后端
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// 写入对象，已存在则覆盖
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// 删除对象，key 不存在不算错误
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// 按顺序拼接 parts 写入 dest，返回总字节数
    async fn compose(&self, dest: &str, parts: &[String]) -> StorageResult<u64> {
        let mut buf = Vec::new();
        for part in parts {
            let data = self
                .get(part)
                .await?
                .ok_or_else(|| StorageError::NotFound(part.clone()))?;
            buf.extend_from_slice(&data);
        }
        let size = buf.len() as u64;
        self.put(dest, buf).await?;
        Ok(size)
    }

    fn backend_name(&self) -> &'static str;
}

/// 拒绝空 key、绝对路径、`..` 和控制字符
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let bad = key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key.starts_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// 根据配置创建存储后端
pub fn build_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStorage>> {
    let storage: Arc<dyn ObjectStorage> = match config.backend {
        StorageBackend::Local => {
            std::fs::create_dir_all(&config.root_dir)?;
            Arc::new(LocalFileStorage::new(config.root_dir.clone()))
        }
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    tracing::info!("存储后端: {}", storage.backend_name());
    Ok(storage)
}

/// 分片存储，约定 key 布局
///
/// - 分片: `chunks/<session>/<index:08>`
/// - 文件: `files/<user>/<session>/<filename>`
#[derive(Clone)]
pub struct ChunkStore {
    storage: Arc<dyn ObjectStorage>,
}

impl ChunkStore {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    pub fn chunk_key(session_id: &str, chunk_index: u32) -> String {
        format!("chunks/{}/{:08}", sanitize_segment(session_id), chunk_index)
    }

    pub fn file_key(user_id: &str, session_id: &str, filename: &str) -> String {
        format!(
            "files/{}/{}/{}",
            sanitize_segment(user_id),
            sanitize_segment(session_id),
            sanitize_segment(filename)
        )
    }

    /// 写入分片，返回存储 key
    pub async fn put_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> StorageResult<String> {
        let key = Self::chunk_key(session_id, chunk_index);
        self.storage.put(&key, data).await?;
        Ok(key)
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        self.storage.delete(key).await
    }

    /// 按给定顺序合并分片，返回文件大小
    pub async fn assemble(&self, dest: &str, chunk_keys: &[String]) -> StorageResult<u64> {
        self.storage.compose(dest, chunk_keys).await
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }
}

/// 把任意字符串变成单个安全的路径段
fn sanitize_segment(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.starts_with('.') {
        out.insert(0, '_');
    }
    out
}
