// 上传队列管理器
//
// 负责：
// - 上传项的状态机（定时、排队、上传、重试、暂停、完成、失败、取消）
// - 全局并发上限，按入队顺序提升 pending 项
// - 自动重试的指数退避与倒计时
// - 每次变化后写入恢复快照
//
// 队列状态只在一把锁后修改，锁从不跨 await 持有；
// 每次执行有自己的 run_id 和 CancellationToken，过期执行的回报直接丢弃

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::events::{EventBus, ProgressThrottler, UploadEvent};
use crate::persistence::snapshot::{MemorySnapshotStore, SnapshotEntry, SnapshotStore};
use crate::uploader::collaborators::{
    HistoryEntry, HistoryRecorder, Notification, NotificationSink,
};
use crate::uploader::executor::{
    ExecutionContext, ExecutionOutcome, ProgressReporter, ProgressSink, ProgressUpdate,
    UploadExecutor,
};
use crate::uploader::folder::{FolderScanner, ScanOptions};
use crate::uploader::task::{UploadCategory, UploadItem, UploadStatus};

/// 执行结束后对服务端会话的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterRun {
    Nothing,
    /// 暂停：通知服务端暂停会话
    Suspend,
    /// 取消：释放服务端会话
    Release,
}

/// 正在执行的上传
#[derive(Debug)]
struct ActiveRun {
    run_id: u64,
    cancel: CancellationToken,
    category: UploadCategory,
    session_id: Option<String>,
    after: AfterRun,
}

#[derive(Default)]
struct QueueState {
    items: HashMap<String, UploadItem>,
    /// 入队顺序
    order: Vec<String>,
    active: HashMap<String, ActiveRun>,
    /// 手动重试中的上传项，失败后直接进入 error
    manual_retry: HashSet<String>,
    throttlers: HashMap<String, ProgressThrottler>,
    next_run_id: u64,
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub scheduled: usize,
    pub pending: usize,
    pub uploading: usize,
    pub retrying: usize,
    pub paused: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
    /// uploading / retrying 项的合计进度（0-100）
    pub combined_progress: f64,
    /// 字节/秒
    pub total_speed: u64,
}

impl QueueStats {
    /// 还有未结束的上传项
    pub fn has_unfinished(&self) -> bool {
        self.completed + self.error + self.cancelled < self.total
    }
}

/// 队列管理器构建器
pub struct UploadQueueManagerBuilder {
    config: UploadConfig,
    executors: HashMap<UploadCategory, Arc<dyn UploadExecutor>>,
    snapshot: Option<Arc<dyn SnapshotStore>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    history: Option<Arc<dyn HistoryRecorder>>,
    events: Option<EventBus>,
}

impl UploadQueueManagerBuilder {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            executors: HashMap::new(),
            snapshot: None,
            notifier: None,
            history: None,
            events: None,
        }
    }

    /// 为上传类别注册执行器
    pub fn executor(mut self, category: UploadCategory, executor: Arc<dyn UploadExecutor>) -> Self {
        self.executors.insert(category, executor);
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot = Some(store);
        self
    }

    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(sink);
        self
    }

    pub fn history_recorder(mut self, recorder: Arc<dyn HistoryRecorder>) -> Self {
        self.history = Some(recorder);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Arc<UploadQueueManager> {
        Arc::new(UploadQueueManager {
            state: Mutex::new(QueueState::default()),
            persist_lock: Mutex::new(()),
            executors: self.executors,
            config: self.config,
            events: self.events.unwrap_or_default(),
            snapshot: self
                .snapshot
                .unwrap_or_else(|| Arc::new(MemorySnapshotStore::new())),
            notifier: self.notifier,
            history: self.history,
        })
    }
}

/// 上传队列管理器
pub struct UploadQueueManager {
    state: Mutex<QueueState>,
    /// 串行化快照写入，保证后写的快照不会被旧快照覆盖
    persist_lock: Mutex<()>,
    executors: HashMap<UploadCategory, Arc<dyn UploadExecutor>>,
    config: UploadConfig,
    events: EventBus,
    snapshot: Arc<dyn SnapshotStore>,
    notifier: Option<Arc<dyn NotificationSink>>,
    history: Option<Arc<dyn HistoryRecorder>>,
}

impl UploadQueueManager {
    pub fn builder(config: UploadConfig) -> UploadQueueManagerBuilder {
        UploadQueueManagerBuilder::new(config)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    // =====================================================
    // 入队
    // =====================================================

    /// 添加上传项，`scheduled_for` 在未来时进入 scheduled
    pub fn enqueue(
        self: &Arc<Self>,
        item: UploadItem,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let id = self.insert(item, scheduled_for, Utc::now())?;
        self.persist();
        self.schedule();
        Ok(id)
    }

    /// 批量添加，全部入队后只扫描一次
    pub fn enqueue_many(
        self: &Arc<Self>,
        items: Vec<UploadItem>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(self.insert(item, scheduled_for, now)?);
        }
        info!("批量入队 {} 个上传项", ids.len());
        self.persist();
        self.schedule();
        Ok(ids)
    }

    /// 读取本地文件信息后入队
    pub fn enqueue_file(
        self: &Arc<Self>,
        path: &Path,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let item = UploadItem::from_path(path)?;
        self.enqueue(item, scheduled_for)
    }

    /// 扫描文件夹，把其中的文件批量入队
    pub fn enqueue_folder(
        self: &Arc<Self>,
        dir: &Path,
        options: ScanOptions,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        let files = FolderScanner::with_options(options).scan(dir)?;
        let mut items = Vec::with_capacity(files.len());
        for file in files {
            match UploadItem::from_path(&file.local_path) {
                Ok(item) => items.push(item),
                Err(e) => warn!("跳过文件 {:?}: {:#}", file.local_path, e),
            }
        }
        self.enqueue_many(items, scheduled_for)
    }

    fn insert(
        &self,
        mut item: UploadItem,
        scheduled_for: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        match scheduled_for {
            Some(at) if at > now => item.mark_scheduled(at),
            _ => item.mark_pending(),
        }

        let mut state = self.state.lock();
        if state.items.contains_key(&item.id) {
            anyhow::bail!("上传项已存在: {}", item.id);
        }

        let id = item.id.clone();
        debug!(
            "上传项入队: id={}, 文件={}, 状态={}",
            id, item.filename, item.status
        );
        self.events.publish(UploadEvent::Created {
            item_id: id.clone(),
            filename: item.filename.clone(),
            file_size: item.file_size,
            category: item.category,
            status: item.status,
        });
        state.order.push(id.clone());
        state.items.insert(id.clone(), item);
        Ok(id)
    }

    // =====================================================
    // 用户操作
    // =====================================================

    /// 取消上传项，进行中的传输协作式中止
    pub fn cancel(self: &Arc<Self>, id: &str) -> Result<()> {
        let release = {
            let mut state = self.state.lock();
            self.cancel_locked(&mut state, id, Utc::now())?
        };
        if let Some((category, session_id)) = release {
            self.release_session(category, session_id);
        }
        self.persist();
        self.schedule();
        Ok(())
    }

    /// 取消所有未结束的上传项，返回数量
    pub fn cancel_all(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let mut releases = Vec::new();
        let mut count = 0;
        {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .order
                .iter()
                .filter(|id| {
                    state
                        .items
                        .get(*id)
                        .map(|i| !i.status.is_terminal())
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            for id in ids {
                match self.cancel_locked(&mut state, &id, now) {
                    Ok(release) => {
                        count += 1;
                        releases.extend(release);
                    }
                    Err(e) => warn!("取消上传项失败: {}: {:#}", id, e),
                }
            }
        }
        for (category, session_id) in releases {
            self.release_session(category, session_id);
        }
        info!("已取消 {} 个上传项", count);
        self.persist();
        count
    }

    /// 返回需要立即释放的会话
    fn cancel_locked(
        &self,
        state: &mut QueueState,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(UploadCategory, String)>> {
        let item = state
            .items
            .get_mut(id)
            .with_context(|| format!("上传项不存在: {}", id))?;
        if item.status.is_terminal() {
            anyhow::bail!("上传项已结束: {} ({})", id, item.status);
        }

        let old = item.status;
        let category = item.category;
        let session_id = item.session_id.clone();
        item.mark_cancelled(now);
        let entry = HistoryEntry::from_item(item, now);
        state.manual_retry.remove(id);

        let release = match state.active.get_mut(id) {
            Some(run) => {
                run.after = AfterRun::Release;
                run.cancel.cancel();
                None
            }
            None => session_id.map(|s| (category, s)),
        };

        info!("上传项已取消: {}", id);
        self.publish_status(id, old, UploadStatus::Cancelled);
        self.events.publish(UploadEvent::Cancelled {
            item_id: id.to_string(),
        });
        self.record_history(entry);
        Ok(release)
    }

    /// 暂停 uploading / retrying 项
    pub fn pause(self: &Arc<Self>, id: &str) -> Result<()> {
        let suspend = {
            let mut state = self.state.lock();
            let item = state
                .items
                .get_mut(id)
                .with_context(|| format!("上传项不存在: {}", id))?;
            if !item.status.is_active() {
                anyhow::bail!("当前状态不能暂停: {} ({})", id, item.status);
            }

            let old = item.status;
            let category = item.category;
            let paused_at_chunk = item.paused_at_chunk;
            let session_id = item.session_id.clone();
            item.mark_paused();

            let suspend = match state.active.get_mut(id) {
                Some(run) => {
                    run.after = AfterRun::Suspend;
                    run.cancel.cancel();
                    None
                }
                None => session_id.map(|s| (category, s)),
            };

            info!("上传项已暂停: {}, 续传点 {:?}", id, paused_at_chunk);
            self.publish_status(id, old, UploadStatus::Paused);
            self.events.publish(UploadEvent::Paused {
                item_id: id.to_string(),
                paused_at_chunk,
            });
            suspend
        };

        if let Some((category, session_id)) = suspend {
            self.suspend_session(category, session_id);
        }
        self.persist();
        self.schedule();
        Ok(())
    }

    /// 恢复暂停的上传项
    pub fn resume(self: &Arc<Self>, id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let item = state
                .items
                .get_mut(id)
                .with_context(|| format!("上传项不存在: {}", id))?;
            if item.status != UploadStatus::Paused {
                anyhow::bail!("当前状态不能恢复: {} ({})", id, item.status);
            }
            item.mark_pending();
            info!("上传项已恢复: {}, 续传点 {:?}", id, item.paused_at_chunk);
            self.publish_status(id, UploadStatus::Paused, UploadStatus::Pending);
            self.events.publish(UploadEvent::Resumed {
                item_id: id.to_string(),
            });
        }
        self.persist();
        self.schedule();
        Ok(())
    }

    /// 手动重试失败项
    ///
    /// 只再尝试一次：retry_count 不重置，再失败直接回到 error
    pub fn retry(self: &Arc<Self>, id: &str) -> Result<()> {
        let stale_session = {
            let mut state = self.state.lock();
            let item = state
                .items
                .get_mut(id)
                .with_context(|| format!("上传项不存在: {}", id))?;
            if item.status != UploadStatus::Error {
                anyhow::bail!("只有失败的上传项可以重试: {} ({})", id, item.status);
            }
            let category = item.category;
            let stale = item.session_id.clone().map(|s| (category, s));
            item.reset_for_manual_retry();
            state.manual_retry.insert(id.to_string());

            info!("手动重试上传项: {}", id);
            self.publish_status(id, UploadStatus::Error, UploadStatus::Pending);
            stale
        };

        if let Some((category, session_id)) = stale_session {
            self.release_session(category, session_id);
        }
        self.persist();
        self.schedule();
        Ok(())
    }

    /// 取消定时，立即进入排队
    pub fn cancel_schedule(self: &Arc<Self>, id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let item = state
                .items
                .get_mut(id)
                .with_context(|| format!("上传项不存在: {}", id))?;
            if item.status != UploadStatus::Scheduled {
                anyhow::bail!("上传项不是定时状态: {} ({})", id, item.status);
            }
            item.mark_pending();
            self.publish_status(id, UploadStatus::Scheduled, UploadStatus::Pending);
        }
        self.persist();
        self.schedule();
        Ok(())
    }

    /// 移除上传项，未结束的先取消
    pub fn remove(self: &Arc<Self>, id: &str) -> Result<()> {
        let release = {
            let mut state = self.state.lock();
            let status = state
                .items
                .get(id)
                .map(|i| i.status)
                .with_context(|| format!("上传项不存在: {}", id))?;
            let release = if status.is_terminal() {
                None
            } else {
                self.cancel_locked(&mut state, id, Utc::now())?
            };

            state.items.remove(id);
            state.order.retain(|x| x != id);
            state.throttlers.remove(id);
            self.events.publish(UploadEvent::Removed {
                item_id: id.to_string(),
            });
            release
        };

        if let Some((category, session_id)) = release {
            self.release_session(category, session_id);
        }
        self.persist();
        self.schedule();
        Ok(())
    }

    /// 清除已结束的上传项，返回数量
    pub fn clear_finished(&self) -> usize {
        let removed: Vec<String> = {
            let mut state = self.state.lock();
            let removed: Vec<String> = state
                .order
                .iter()
                .filter(|id| {
                    state
                        .items
                        .get(*id)
                        .map(|i| i.status.is_terminal())
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            let QueueState {
                items,
                order,
                throttlers,
                ..
            } = &mut *state;
            for id in &removed {
                items.remove(id);
                throttlers.remove(id);
            }
            order.retain(|id| items.contains_key(id));
            removed
        };

        for id in &removed {
            self.events.publish(UploadEvent::Removed {
                item_id: id.clone(),
            });
        }
        if !removed.is_empty() {
            info!("已清除 {} 个已结束的上传项", removed.len());
            self.persist();
        }
        removed.len()
    }

    // =====================================================
    // 查询
    // =====================================================

    pub fn get(&self, id: &str) -> Option<UploadItem> {
        self.state.lock().items.get(id).cloned()
    }

    /// 按入队顺序列出
    pub fn list(&self) -> Vec<UploadItem> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        let mut active_size = 0u64;
        let mut active_uploaded = 0u64;

        for item in state.items.values() {
            stats.total += 1;
            match item.status {
                UploadStatus::Scheduled => stats.scheduled += 1,
                UploadStatus::Pending => stats.pending += 1,
                UploadStatus::Uploading => stats.uploading += 1,
                UploadStatus::Retrying => stats.retrying += 1,
                UploadStatus::Paused => stats.paused += 1,
                UploadStatus::Completed => stats.completed += 1,
                UploadStatus::Error => stats.error += 1,
                UploadStatus::Cancelled => stats.cancelled += 1,
            }
            if item.status.is_active() {
                active_size += item.file_size;
                active_uploaded += item.uploaded_bytes;
                stats.total_speed += item.speed;
            }
        }
        stats.combined_progress = UploadItem::progress_of(active_uploaded, active_size);
        stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    // =====================================================
    // 恢复
    // =====================================================

    /// 读取上次退出时的快照并丢弃
    ///
    /// 需要在第一次入队前调用，否则快照已被新状态覆盖
    pub fn recover_interrupted(&self) -> Result<Vec<SnapshotEntry>> {
        let _guard = self.persist_lock.lock();
        let entries = self.snapshot.load()?;
        self.snapshot.clear()?;
        if !entries.is_empty() {
            info!("发现 {} 个中断的上传项", entries.len());
        }
        Ok(entries)
    }

    /// 按快照重新入队为 paused，保留会话绑定以便续传
    ///
    /// 定时项恢复为 scheduled，仍按原定时间启动
    pub fn restore_interrupted(self: &Arc<Self>, entry: &SnapshotEntry) -> Result<String> {
        let path: &PathBuf = entry
            .local_path
            .as_ref()
            .with_context(|| format!("快照缺少源文件路径: {}", entry.filename))?;
        let mut item = UploadItem::from_path(path)?;
        if item.file_size != entry.file_size {
            anyhow::bail!(
                "源文件已变化: {:?} (期望 {} 字节, 实际 {} 字节)",
                path,
                entry.file_size,
                item.file_size
            );
        }

        item.id = entry.id.clone();
        item.mime_type = entry.mime_type.clone();
        item.category = entry.category;
        item.retry_count = entry.retry_count;
        item.session_id = entry.session_id.clone();
        item.paused_at_chunk = entry.paused_at_chunk;
        // 定时项保持定时，到点由 tick 提升；其余一律暂停等待恢复
        match (entry.status, entry.scheduled_for) {
            (UploadStatus::Scheduled, Some(at)) => item.mark_scheduled(at),
            _ => item.mark_paused(),
        }

        let id = {
            let mut state = self.state.lock();
            if state.items.contains_key(&item.id) {
                anyhow::bail!("上传项已存在: {}", item.id);
            }
            let id = item.id.clone();
            self.events.publish(UploadEvent::Created {
                item_id: id.clone(),
                filename: item.filename.clone(),
                file_size: item.file_size,
                category: item.category,
                status: item.status,
            });
            state.order.push(id.clone());
            state.items.insert(id.clone(), item);
            id
        };

        info!("已恢复中断的上传项: {} ({})", entry.filename, id);
        self.persist();
        Ok(id)
    }

    // =====================================================
    // 定时器
    // =====================================================

    /// 处理到期的定时项和重试项，发布重试倒计时
    pub fn tick_at(self: &Arc<Self>, now: DateTime<Utc>) {
        let mut changed = false;
        {
            let mut state = self.state.lock();
            let max_attempts = self.config.max_auto_retries;
            let ids = state.order.clone();

            for id in ids {
                let Some(item) = state.items.get_mut(&id) else {
                    continue;
                };
                match item.status {
                    UploadStatus::Scheduled => {
                        if item.scheduled_for.map(|at| at <= now).unwrap_or(true) {
                            item.mark_pending();
                            info!("定时上传到点: {}", item.filename);
                            self.notify(Notification::ScheduledStarted {
                                item_id: id.clone(),
                                filename: item.filename.clone(),
                            });
                            self.publish_status(&id, UploadStatus::Scheduled, UploadStatus::Pending);
                            changed = true;
                        }
                    }
                    UploadStatus::Retrying => match item.retry_at {
                        Some(at) if at > now => {
                            let remaining = (at - now).num_milliseconds().max(0) as u64;
                            self.events.publish(UploadEvent::RetryCountdown {
                                item_id: id.clone(),
                                attempt: item.retry_count,
                                max_attempts,
                                remaining_secs: remaining.div_ceil(1000),
                            });
                        }
                        _ => {
                            item.mark_pending();
                            debug!("重试等待结束: {}", id);
                            self.publish_status(&id, UploadStatus::Retrying, UploadStatus::Pending);
                            changed = true;
                        }
                    },
                    _ => {}
                }
            }
        }

        if changed {
            self.persist();
        }
        self.schedule();
    }

    /// 周期性调用 tick_at，直到 token 取消
    pub fn run_ticker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = Duration::from_millis(self.config.tick_interval_ms.max(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("队列定时器已停止");
                        break;
                    }
                    _ = interval.tick() => manager.tick_at(Utc::now()),
                }
            }
        })
    }

    // =====================================================
    // 调度
    // =====================================================

    /// 按空闲槽位提升 pending 项
    fn schedule(self: &Arc<Self>) {
        let now = Utc::now();
        let launches = {
            let mut state = self.state.lock();
            let uploading = state
                .items
                .values()
                .filter(|i| i.status == UploadStatus::Uploading)
                .count();
            let slots = self.config.max_concurrent_uploads.saturating_sub(uploading);
            if slots == 0 {
                return;
            }

            let candidates: Vec<String> = state
                .order
                .iter()
                .filter(|id| !state.active.contains_key(*id))
                .filter(|id| {
                    state
                        .items
                        .get(*id)
                        .map(|i| {
                            i.status == UploadStatus::Pending
                                && self.executors.contains_key(&i.category)
                        })
                        .unwrap_or(false)
                })
                .take(slots)
                .cloned()
                .collect();

            let mut launches = Vec::with_capacity(candidates.len());
            for id in candidates {
                state.next_run_id += 1;
                let run_id = state.next_run_id;
                let cancel = CancellationToken::new();

                let Some(item) = state.items.get_mut(&id) else {
                    continue;
                };
                let resume = item.paused_at_chunk;
                item.mark_uploading(now);
                let snapshot = item.clone();

                state.active.insert(
                    id.clone(),
                    ActiveRun {
                        run_id,
                        cancel: cancel.clone(),
                        category: snapshot.category,
                        session_id: snapshot.session_id.clone(),
                        after: AfterRun::Nothing,
                    },
                );
                self.publish_status(&id, UploadStatus::Pending, UploadStatus::Uploading);
                launches.push((snapshot, resume, run_id, cancel));
            }
            launches
        };

        if launches.is_empty() {
            return;
        }
        for (item, resume, run_id, cancel) in launches {
            self.launch(item, resume, run_id, cancel);
        }
        self.persist();
    }

    fn launch(
        self: &Arc<Self>,
        item: UploadItem,
        resume_from_chunk: Option<u32>,
        run_id: u64,
        cancel: CancellationToken,
    ) {
        let Some(executor) = self.executors.get(&item.category).cloned() else {
            return;
        };
        let sink: Arc<dyn ProgressSink> = self.clone();
        let reporter = ProgressReporter::new(sink, item.id.clone(), run_id);
        let manager = self.clone();
        let id = item.id.clone();

        info!(
            "启动上传: id={}, 文件={}, 续传点 {:?}, run={}",
            id, item.filename, resume_from_chunk, run_id
        );
        tokio::spawn(async move {
            let ctx = ExecutionContext {
                item,
                resume_from_chunk,
                cancel,
                reporter,
            };
            let outcome = match tokio::spawn(async move { executor.run(ctx).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("执行器异常退出: id={}, {}", id, e);
                    ExecutionOutcome::Failed(format!("执行器异常退出: {}", e))
                }
            };
            manager.finish(&id, run_id, outcome);
        });
    }

    /// 执行结束
    fn finish(self: &Arc<Self>, id: &str, run_id: u64, outcome: ExecutionOutcome) {
        let now = Utc::now();
        let after = {
            let mut state = self.state.lock();
            let current = state
                .active
                .get(id)
                .map(|run| run.run_id == run_id)
                .unwrap_or(false);
            if !current {
                debug!("忽略过期执行的结果: id={}, run={}", id, run_id);
                return;
            }
            let Some(run) = state.active.remove(id) else {
                return;
            };
            state.throttlers.remove(id);
            let manual = state.manual_retry.remove(id);

            let after = match run.after {
                AfterRun::Nothing => None,
                after => run.session_id.map(|s| (after, run.category, s)),
            };

            if let Some(item) = state.items.get_mut(id) {
                self.apply_outcome(item, outcome, manual, now);
            }
            after
        };

        match after {
            Some((AfterRun::Release, category, session)) => self.release_session(category, session),
            Some((AfterRun::Suspend, category, session)) => self.suspend_session(category, session),
            _ => {}
        }
        self.persist();
        self.schedule();
    }

    fn apply_outcome(
        &self,
        item: &mut UploadItem,
        outcome: ExecutionOutcome,
        manual: bool,
        now: DateTime<Utc>,
    ) {
        let id = item.id.clone();
        let old = item.status;

        match outcome {
            ExecutionOutcome::Completed(record) => {
                if old == UploadStatus::Cancelled {
                    warn!("上传项已取消但服务端已完成: id={}, 记录={}", id, record.id);
                    return;
                }
                item.mark_completed(record.clone(), now);
                info!("上传完成: {} -> {}", item.filename, record.url);
                self.publish_status(&id, old, UploadStatus::Completed);
                self.events.publish(UploadEvent::Completed {
                    item_id: id.clone(),
                    record: record.clone(),
                    completed_at: now.timestamp_millis(),
                });
                self.notify(Notification::Completed {
                    item_id: id,
                    filename: item.filename.clone(),
                    url: record.url,
                });
                self.record_history(HistoryEntry::from_item(item, now));
            }
            _ if old != UploadStatus::Uploading => {
                // 执行期间已被暂停或取消
                debug!("执行结束时上传项已是 {}: {}", old, id);
            }
            ExecutionOutcome::Cancelled => {
                item.mark_paused();
                self.publish_status(&id, old, UploadStatus::Paused);
                self.events.publish(UploadEvent::Paused {
                    item_id: id,
                    paused_at_chunk: item.paused_at_chunk,
                });
            }
            ExecutionOutcome::Failed(message) => {
                let will_retry = !manual && item.retry_count < self.config.max_auto_retries;
                if will_retry {
                    let delay = self.config.retry_backoff(item.retry_count + 1);
                    let retry_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    item.mark_retrying(message.clone(), retry_at);
                    warn!(
                        "上传失败，{:?} 后自动重试 ({}/{}): {}, {}",
                        delay, item.retry_count, self.config.max_auto_retries, item.filename, message
                    );
                    self.publish_status(&id, old, UploadStatus::Retrying);
                } else {
                    item.mark_error(message.clone(), now);
                    error!("上传失败: {}, {}", item.filename, message);
                    self.publish_status(&id, old, UploadStatus::Error);
                    self.notify(Notification::Failed {
                        item_id: id.clone(),
                        filename: item.filename.clone(),
                        error: message.clone(),
                    });
                    self.record_history(HistoryEntry::from_item(item, now));
                }
                self.events.publish(UploadEvent::Failed {
                    item_id: id,
                    error: message,
                    retry_count: item.retry_count,
                    will_retry,
                });
            }
        }
    }

    // =====================================================
    // 副作用
    // =====================================================

    fn publish_status(&self, id: &str, old: UploadStatus, new: UploadStatus) {
        self.events.publish(UploadEvent::StatusChanged {
            item_id: id.to_string(),
            old_status: old,
            new_status: new,
        });
    }

    fn notify(&self, notification: Notification) {
        if let Some(notifier) = self.notifier.clone() {
            tokio::spawn(async move { notifier.notify(notification).await });
        }
    }

    fn record_history(&self, entry: HistoryEntry) {
        if let Some(history) = self.history.clone() {
            tokio::spawn(async move {
                if let Err(e) = history.record(entry).await {
                    warn!("写入上传历史失败: {:#}", e);
                }
            });
        }
    }

    fn release_session(&self, category: UploadCategory, session_id: String) {
        if let Some(executor) = self.executors.get(&category).cloned() {
            debug!("释放服务端会话: {}", session_id);
            tokio::spawn(async move { executor.release(&session_id).await });
        }
    }

    fn suspend_session(&self, category: UploadCategory, session_id: String) {
        if let Some(executor) = self.executors.get(&category).cloned() {
            tokio::spawn(async move { executor.suspend(&session_id).await });
        }
    }

    /// 写入恢复快照
    fn persist(&self) {
        let _guard = self.persist_lock.lock();
        let entries: Vec<SnapshotEntry> = {
            let state = self.state.lock();
            state
                .order
                .iter()
                .filter_map(|id| state.items.get(id))
                .filter_map(SnapshotEntry::from_item)
                .collect()
        };
        if let Err(e) = self.snapshot.save(&entries) {
            warn!("写入队列快照失败: {:#}", e);
        }
    }
}

impl ProgressSink for UploadQueueManager {
    fn on_progress(&self, item_id: &str, run_id: u64, update: ProgressUpdate) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(run) = state
                .active
                .get_mut(item_id)
                .filter(|run| run.run_id == run_id)
            else {
                debug!("忽略过期执行的进度: id={}, run={}", item_id, run_id);
                return;
            };
            let Some(item) = state.items.get_mut(item_id) else {
                return;
            };

            match update {
                ProgressUpdate::SessionBound { session_id } => {
                    run.session_id = Some(session_id.clone());
                    item.session_id = Some(session_id);
                    item.paused_at_chunk = None;
                }
                ProgressUpdate::Chunk {
                    resume_point,
                    completed_chunks,
                    total_chunks,
                    uploaded_bytes,
                    speed,
                } => {
                    if item.status != UploadStatus::Uploading {
                        return;
                    }
                    item.paused_at_chunk = Some(resume_point);
                    item.update_progress(uploaded_bytes, speed);

                    let throttler = state.throttlers.entry(item_id.to_string()).or_default();
                    if completed_chunks == total_chunks || throttler.should_emit() {
                        self.events.publish(UploadEvent::Progress {
                            item_id: item_id.to_string(),
                            uploaded_bytes: item.uploaded_bytes,
                            file_size: item.file_size,
                            progress: item.progress,
                            speed: item.speed,
                            eta: item.eta,
                            completed_chunks,
                            total_chunks,
                        });
                    }
                }
            }
        }
        self.persist();
    }
}
