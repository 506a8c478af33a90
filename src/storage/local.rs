use super::{validate_key, ObjectStorage, StorageError, StorageResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 本地文件系统存储，key 直接映射为 root 下的相对路径
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        path.with_file_name(name)
    }
}

#[async_trait]
impl ObjectStorage for LocalFileStorage {
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        // 先写临时文件再 rename，读者不会看到写了一半的分片
        let tmp = Self::temp_path(&path);
        fs::write(&tmp, &data).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // 目录空了顺手删掉，非空时失败忽略
        if let Some(parent) = path.parent() {
            if parent != self.root {
                let _ = fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn compose(&self, dest: &str, parts: &[String]) -> StorageResult<u64> {
        let dest_path = self.path_for(dest)?;
        Self::ensure_parent(&dest_path).await?;

        let tmp = Self::temp_path(&dest_path);
        let result = async {
            let mut out = File::create(&tmp).await?;
            let mut total = 0u64;
            for part in parts {
                let part_path = self.path_for(part)?;
                let mut input = match File::open(&part_path).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        return Err(StorageError::NotFound(part.clone()))
                    }
                    Err(e) => return Err(e.into()),
                };
                total += tokio::io::copy(&mut input, &mut out).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok(total)
        }
        .await;

        match result {
            Ok(total) => {
                fs::rename(&tmp, &dest_path).await?;
                debug!("合并完成: {} ({} 个分片, {} 字节)", dest, parts.len(), total);
                Ok(total)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
