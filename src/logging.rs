//! 日志系统
//!
//! 控制台输出 + 按大小滚动的文件输出，启动时清理过期日志

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_PREFIX: &str = "resumable-upload.";
const LOG_SUFFIX: &str = ".log";
const TIMER_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 滚动写入状态
struct RotatingState {
    /// 进程启动时间戳（YYYY-MM-DD-HHMMSS），同一次启动的文件共用
    started: String,
    dir: PathBuf,
    file: Option<File>,
    /// 0 为首个文件，之后每滚动一次加 1
    seq: u32,
    limit: u64,
    written: u64,
}

impl RotatingState {
    fn open(dir: PathBuf, limit: u64) -> io::Result<Self> {
        let mut state = Self {
            started: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            dir,
            file: None,
            seq: 0,
            limit,
            written: 0,
        };
        state.open_current()?;
        Ok(state)
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(log_file_name(&self.started, self.seq))
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 当前文件非空且写入后超限时换新文件
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            if let Some(mut old) = self.file.take() {
                old.flush()?;
            }
            self.seq += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 按大小滚动的日志写入器，可作为 tracing-appender 的输出目标
#[derive(Clone)]
pub struct RotatingLogWriter {
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingLogWriter {
    pub fn new(dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            state: Arc::new(Mutex::new(RotatingState::open(dir, max_file_size)?)),
        })
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write_bytes(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().flush()
    }
}

/// 日志守卫，drop 后后台写线程退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化全局日志订阅器
///
/// RUST_LOG 环境变量优先于配置中的级别。
/// 文件输出初始化失败时退回仅控制台输出。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| RotatingLogWriter::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| eprintln!("日志文件初始化失败: {:?}, 错误: {}, 仅输出到控制台", config.log_dir, e))
            .ok()
    } else {
        None
    };

    let Some(writer) = writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = remove_expired_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

fn log_file_name(started: &str, seq: u32) -> String {
    if seq == 0 {
        format!("{}{}{}", LOG_PREFIX, started, LOG_SUFFIX)
    } else {
        format!("{}{}_{}{}", LOG_PREFIX, started, seq, LOG_SUFFIX)
    }
}

/// 解析日志文件名中的日期
///
/// resumable-upload.2024-05-01-120000_3.log -> 2024-05-01
fn log_file_date(filename: &str) -> Option<NaiveDate> {
    let stem = filename.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// 删除早于保留期的日志文件，返回删除数量
///
/// 文件名无法解析日期的跳过，不碰不属于本程序的文件
fn remove_expired_logs(dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", dir, e);
            return 0;
        }
    };

    let keep = chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(log_file_date)
        else {
            continue;
        };

        if today.signed_duration_since(date) <= keep {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(_) => {
                removed += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }

    removed
}
