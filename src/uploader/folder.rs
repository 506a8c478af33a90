//! 文件夹扫描
//!
//! 递归列出待上传的文件，交给队列管理器批量入队

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 扫描到的文件
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub local_path: PathBuf,
    /// 相对于扫描根目录
    pub relative_path: PathBuf,
    pub size: u64,
}

/// 扫描选项
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub follow_symlinks: bool,
    /// 超过此大小的文件跳过
    pub max_file_size: Option<u64>,
    /// 达到数量后停止扫描
    pub max_files: Option<usize>,
    /// 跳过以 . 开头的文件和目录
    pub skip_hidden: bool,
}

/// 文件夹扫描器
#[derive(Debug, Clone, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描，结果按相对路径排序
    pub fn scan<P: AsRef<Path>>(&self, root: P) -> Result<Vec<ScannedFile>> {
        let root = root.as_ref();
        if !root.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root.display());
        }

        info!("开始扫描文件夹: {}", root.display());

        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(root)
            .follow_links(self.options.follow_symlinks)
            .into_iter()
            .filter_entry(|e| !(skip_hidden && e.depth() > 0 && is_hidden(e)));

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("跳过无法读取的条目: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("读取文件元数据失败: {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if let Some(max) = self.options.max_file_size {
                if size > max {
                    warn!("跳过超大文件: {} ({} bytes)", entry.path().display(), size);
                    continue;
                }
            }

            let relative_path = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            debug!("扫描到文件: {} ({} bytes)", relative_path.display(), size);

            files.push(ScannedFile {
                local_path: entry.path().to_path_buf(),
                relative_path,
                size,
            });

            if let Some(max) = self.options.max_files {
                if files.len() >= max {
                    warn!("已达到最大文件数量限制 ({}), 停止扫描", max);
                    break;
                }
            }
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        info!("文件夹扫描完成: {} 个文件", files.len());
        Ok(files)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}
