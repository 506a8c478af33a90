// 上传代理
//
// 用法: upload_agent [--at <RFC3339 时间>] <文件或文件夹>...
//
// 启动时先恢复上次中断的上传（源文件仍在时从断点续传），
// 再把命令行给出的路径入队，全部结束后退出

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use resumable_upload::config::AppConfig;
use resumable_upload::events::UploadEvent;
use resumable_upload::logging;
use resumable_upload::persistence::{JsonFileSnapshotStore, SqliteHistoryRecorder};
use resumable_upload::uploader::{
    AdaptiveController, ChunkedUploadExecutor, ExecutorOptions, HttpUploadClient,
    LogNotificationSink, ScanOptions, UploadCategory, UploadExecutor, UploadQueueManager,
    UploadStatus, UploadTransport,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

struct AgentArgs {
    scheduled_for: Option<DateTime<Utc>>,
    paths: Vec<PathBuf>,
}

fn parse_args() -> anyhow::Result<AgentArgs> {
    let mut scheduled_for = None;
    let mut paths = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        if arg == "--at" {
            let value = args.next().context("--at 需要一个时间参数")?;
            let at = DateTime::parse_from_rfc3339(&value)
                .with_context(|| format!("无法解析时间: {}", value))?;
            scheduled_for = Some(at.with_timezone(&Utc));
        } else {
            paths.push(PathBuf::from(arg));
        }
    }

    Ok(AgentArgs {
        scheduled_for,
        paths,
    })
}

/// 把队列事件写入日志
fn spawn_event_logger(manager: &Arc<UploadQueueManager>, shutdown: CancellationToken) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(UploadEvent::Progress {
                    item_id,
                    progress,
                    speed,
                    ..
                }) => debug!("[{}] {:.1}% {} KB/s", item_id, progress, speed / 1024),
                Ok(UploadEvent::RetryCountdown {
                    item_id,
                    remaining_secs,
                    ..
                }) => debug!("[{}] {} 秒后重试", item_id, remaining_secs),
                Ok(UploadEvent::StatusChanged {
                    item_id,
                    old_status,
                    new_status,
                }) => info!("[{}] {} -> {}", item_id, old_status, new_status),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("事件订阅落后，丢弃 {} 条", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let _log_guard = logging::init_logging(&config.log);
    config.validate()?;
    let upload = config.upload.clone();

    info!("上传代理启动: 服务端 {}", upload.server_url);

    let transport: Arc<dyn UploadTransport> =
        Arc::new(HttpUploadClient::new(&upload.server_url, &upload.user_id)?);
    let controller = Arc::new(AdaptiveController::new(upload.bandwidth_limit_bytes_per_sec));
    let executor: Arc<dyn UploadExecutor> = Arc::new(ChunkedUploadExecutor::new(
        transport,
        controller,
        ExecutorOptions::from(&upload),
    ));
    let history = Arc::new(SqliteHistoryRecorder::new(&upload.history_db_path)?);

    let manager = UploadQueueManager::builder(upload.clone())
        .executor(UploadCategory::File, executor.clone())
        .executor(UploadCategory::Video, executor)
        .snapshot_store(Arc::new(JsonFileSnapshotStore::new(upload.snapshot_path.clone())))
        .history_recorder(history)
        .notification_sink(Arc::new(LogNotificationSink))
        .build();

    let shutdown = CancellationToken::new();
    spawn_event_logger(&manager, shutdown.clone());

    // 恢复上次中断的上传
    for entry in manager.recover_interrupted()? {
        let exists = entry.local_path.as_ref().map(|p| p.is_file()).unwrap_or(false);
        if !exists {
            warn!("源文件已不存在，放弃恢复: {}", entry.filename);
            continue;
        }
        match manager.restore_interrupted(&entry) {
            Ok(id) => {
                // 定时项等 tick 到点启动
                let paused = manager
                    .get(&id)
                    .map(|item| item.status == UploadStatus::Paused)
                    .unwrap_or(false);
                if paused {
                    if let Err(e) = manager.resume(&id) {
                        warn!("恢复上传失败: {}: {:#}", entry.filename, e);
                    }
                } else {
                    info!("已恢复定时上传: {} ({:?})", entry.filename, entry.scheduled_for);
                }
            }
            Err(e) => warn!("恢复上传失败: {}: {:#}", entry.filename, e),
        }
    }

    for path in &args.paths {
        let result = if path.is_dir() {
            let options = ScanOptions {
                skip_hidden: upload.skip_hidden_files,
                ..Default::default()
            };
            manager
                .enqueue_folder(path, options, args.scheduled_for)
                .map(|ids| ids.len())
        } else {
            manager.enqueue_file(path, args.scheduled_for).map(|_| 1)
        };
        match result {
            Ok(n) => info!("已入队 {} 个文件: {:?}", n, path),
            Err(e) => error!("入队失败: {:?}: {:#}", path, e),
        }
    }

    let ticker = manager.run_ticker(shutdown.clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，未完成的上传将在下次启动时恢复");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !manager.stats().has_unfinished() {
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    let _ = ticker.await;

    let stats = manager.stats();
    info!(
        "上传代理退出: 完成 {}, 失败 {}, 取消 {}, 未完成 {}",
        stats.completed,
        stats.error,
        stats.cancelled,
        stats.total - stats.completed - stats.error - stats.cancelled
    );
    Ok(())
}
