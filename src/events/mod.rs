//! 事件模块
//!
//! - `types.rs`: 上传事件
//! - `throttle.rs`: 进度事件节流

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;

use tokio::sync::broadcast;
use tracing::trace;

/// 默认事件通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// 事件总线，订阅者落后太多时会丢最旧的事件
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 发布事件，没有订阅者时直接丢弃
    pub fn publish(&self, event: UploadEvent) {
        trace!("发布事件: {} item={}", event.event_type_name(), event.item_id());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
