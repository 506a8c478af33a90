use super::{validate_key, ObjectStorage, StorageResult};
use async_trait::async_trait;
use dashmap::DashMap;

/// 进程内存存储
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// 以某前缀开头的 key 数量
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.objects.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.objects.contains_key(key))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = MemoryStorage::new();
        storage.put("a/b", vec![1, 2, 3]).await.unwrap();
        assert!(storage.exists("a/b").await.unwrap());
        assert_eq!(storage.get("a/b").await.unwrap(), Some(vec![1, 2, 3]));

        storage.delete("a/b").await.unwrap();
        assert!(storage.get("a/b").await.unwrap().is_none());
        // 重复删除不报错
        storage.delete("a/b").await.unwrap();
        assert!(storage.is_empty());
    }
}
