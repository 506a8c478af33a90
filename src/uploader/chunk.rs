// 上传分片规划
//
// 按服务端给定的分片大小切分文件，记录哪些分片已被服务端确认

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

/// 分片规划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
    /// 已确认的分片序号
    acked: BTreeSet<u32>,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64, total_chunks: u32) -> Self {
        Self {
            total_size,
            chunk_size,
            total_chunks,
            acked: BTreeSet::new(),
        }
    }

    /// 合入服务端已持有的分片，越界序号忽略
    pub fn with_received(mut self, indices: impl IntoIterator<Item = u32>) -> Self {
        let total = self.total_chunks;
        self.acked.extend(indices.into_iter().filter(|i| *i < total));
        self
    }

    pub fn chunk_count(&self) -> u32 {
        self.total_chunks
    }

    /// 分片字节范围
    pub fn range(&self, index: u32) -> Range<u64> {
        let start = (index as u64 * self.chunk_size).min(self.total_size);
        let end = (start + self.chunk_size).min(self.total_size);
        start..end
    }

    pub fn chunk_len(&self, index: u32) -> u64 {
        let r = self.range(index);
        r.end - r.start
    }

    /// 尚未确认的分片，升序
    pub fn pending(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.acked.contains(i))
            .collect()
    }

    pub fn mark_acked(&mut self, index: u32) {
        if index < self.total_chunks {
            self.acked.insert(index);
        }
    }

    pub fn completed_count(&self) -> u32 {
        self.acked.len() as u32
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.acked.iter().map(|i| self.chunk_len(*i)).sum()
    }

    /// 续传点：最小的未确认序号
    ///
    /// 并行上传时确认可能乱序，只有连续前缀之后的位置才可靠
    pub fn resume_point(&self) -> u32 {
        let mut next = 0;
        for &i in &self.acked {
            if i != next {
                break;
            }
            next += 1;
        }
        next
    }

    pub fn is_complete(&self) -> bool {
        self.acked.len() as u32 == self.total_chunks
    }
}

/// 读取分片数据
///
/// 阻塞 IO 放到 spawn_blocking 中执行
pub async fn read_chunk(path: &Path, range: Range<u64>) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file =
            std::fs::File::open(&path).with_context(|| format!("无法打开文件: {:?}", path))?;
        file.seek(SeekFrom::Start(range.start))
            .context("文件定位失败")?;

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buffer).context("读取分片数据失败")?;

        debug!("读取分片: {:?} bytes={}..{}", path, range.start, range.end);
        Ok(buffer)
    })
    .await
    .context("读取任务异常退出")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        let plan = ChunkPlan::new(25, 10, 3);
        assert_eq!(plan.range(0), 0..10);
        assert_eq!(plan.range(2), 20..25);
        assert_eq!(plan.chunk_len(2), 5);
    }

    #[test]
    fn test_pending_and_resume_point() {
        let mut plan = ChunkPlan::new(100, 10, 10).with_received([0, 1, 2, 5, 42]);
        assert_eq!(plan.completed_count(), 4);
        assert_eq!(plan.resume_point(), 3);
        assert_eq!(plan.pending(), vec![3, 4, 6, 7, 8, 9]);

        plan.mark_acked(4);
        plan.mark_acked(3);
        assert_eq!(plan.resume_point(), 6);
        assert_eq!(plan.uploaded_bytes(), 60);
        assert!(!plan.is_complete());

        for i in plan.pending() {
            plan.mark_acked(i);
        }
        assert!(plan.is_complete());
        assert_eq!(plan.resume_point(), 10);
    }

    #[tokio::test]
    async fn test_read_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"0123456789abc").unwrap();

        let data = read_chunk(&path, 10..13).await.unwrap();
        assert_eq!(data, b"abc");

        // 文件比预期短
        assert!(read_chunk(&path, 10..20).await.is_err());
    }
}
