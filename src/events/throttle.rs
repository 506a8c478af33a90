//! 进度事件节流
//!
//! 进度回调可能每个分片触发多次，发布前先过节流器

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 每次进度更新时调用 `should_emit()`，返回 true 才发布
#[derive(Debug)]
pub struct ProgressThrottler {
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Mutex::new(None),
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    pub fn should_emit(&self) -> bool {
        self.should_emit_at(Instant::now())
    }

    /// 距离上次发布超过间隔时返回 true 并记录本次时间
    pub fn should_emit_at(&self, now: Instant) -> bool {
        let mut last = self.last_emit.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// 不看间隔直接发布（最后一次进度）
    pub fn force_emit(&self) {
        *self.last_emit.lock() = Some(Instant::now());
    }

    pub fn reset(&self) {
        *self.last_emit.lock() = None;
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
