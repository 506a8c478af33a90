// 自适应网络控制器
//
// 根据最近的分片结果调整：
// - 单个分片的超时时间
// - 单个文件的并行分片数
// - 限速需要补的等待时间
//
// 状态只活在进程内，重启后回到默认值

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 初始超时
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
/// 超时下限
pub const MIN_TIMEOUT_MS: u64 = 30_000;
/// 超时上限
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// 连续成功多少次后收紧超时
const SUCCESS_STREAK_TO_TIGHTEN: u32 = 5;
const TIGHTEN_FACTOR: f64 = 0.8;
const RELAX_FACTOR: f64 = 1.5;

/// 速度窗口大小
const SPEED_WINDOW_SIZE: usize = 10;
/// 结果窗口大小
const OUTCOME_WINDOW_SIZE: usize = 20;
/// 判定网络质量所需的最少速度样本
const MIN_SPEED_SAMPLES: usize = 3;

/// 500 KB/s
const GOOD_SPEED_BPS: f64 = 500.0 * 1024.0;
/// 100 KB/s
const FAIR_SPEED_BPS: f64 = 100.0 * 1024.0;
const GOOD_MAX_FAILURE_RATE: f64 = 0.10;
const FAIR_MAX_FAILURE_RATE: f64 = 0.30;

/// 连续失败达到该次数时强制串行
const SEQUENTIAL_AFTER_FAILURES: u32 = 3;

/// 并行分片数的配置范围
pub const MAX_PARALLEL_CHUNKS: usize = 3;

/// 自适应参数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    pub timeout_ms: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

/// 网络质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
    Unknown,
}

#[derive(Debug, Default)]
struct ControllerState {
    settings: AdaptiveSettings,
    /// 最近的分片速度（字节/秒）
    speeds: VecDeque<f64>,
    /// 最近的分片结果，true 为成功
    outcomes: VecDeque<bool>,
}

impl ControllerState {
    fn push_outcome(&mut self, ok: bool) {
        if self.outcomes.len() == OUTCOME_WINDOW_SIZE {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    fn push_speed(&mut self, bps: f64) {
        if self.speeds.len() == SPEED_WINDOW_SIZE {
            self.speeds.pop_front();
        }
        self.speeds.push_back(bps);
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn quality(&self) -> NetworkQuality {
        if self.speeds.len() < MIN_SPEED_SAMPLES {
            return NetworkQuality::Unknown;
        }
        let avg = self.speeds.iter().sum::<f64>() / self.speeds.len() as f64;
        let failure_rate = self.failure_rate();

        if avg > GOOD_SPEED_BPS && failure_rate < GOOD_MAX_FAILURE_RATE {
            NetworkQuality::Good
        } else if avg > FAIR_SPEED_BPS && failure_rate < FAIR_MAX_FAILURE_RATE {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }
}

/// 带宽配额
///
/// 所有分片按完成顺序排队占用发送时间，并行分片和并发上传合计不超过上限
#[derive(Debug)]
pub struct BandwidthPacer {
    /// 限速（字节/秒），<= 0 表示不限速
    limit: i64,
    /// 已分配出去的发送时间的终点
    next_free: Mutex<Option<Instant>>,
}

impl BandwidthPacer {
    pub fn new(limit_bytes_per_sec: i64) -> Self {
        Self {
            limit: limit_bytes_per_sec,
            next_free: Mutex::new(None),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// 为 `started` 开始发送的 `bytes` 字节分配时间，返回还需等待多久
    pub fn reserve(&self, bytes: u64, started: Instant) -> Duration {
        let target = throttle_delay(bytes, Duration::ZERO, self.limit);
        if target.is_zero() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let mut next_free = self.next_free.lock();
        let begin = match *next_free {
            Some(t) if t > started => t,
            _ => started,
        };
        let end = begin + target;
        *next_free = Some(end);
        end.saturating_duration_since(now)
    }
}

/// 自适应网络控制器
///
/// 默认在所有上传之间共享一个实例
#[derive(Debug)]
pub struct AdaptiveController {
    state: Mutex<ControllerState>,
    pacer: Arc<BandwidthPacer>,
}

impl AdaptiveController {
    pub fn new(bandwidth_limit_bytes_per_sec: i64) -> Self {
        Self::with_pacer(Arc::new(BandwidthPacer::new(bandwidth_limit_bytes_per_sec)))
    }

    /// 独立的自适应状态，带宽配额与其他控制器共享
    pub fn with_pacer(pacer: Arc<BandwidthPacer>) -> Self {
        Self {
            state: Mutex::new(ControllerState::default()),
            pacer,
        }
    }

    pub fn pacer(&self) -> &Arc<BandwidthPacer> {
        &self.pacer
    }

    /// 记录一次分片成功
    pub fn record_success(&self, bytes: u64, elapsed: Duration) {
        let mut state = self.state.lock();
        let secs = elapsed.as_secs_f64().max(0.001);
        state.push_speed(bytes as f64 / secs);
        state.push_outcome(true);

        let s = &mut state.settings;
        s.total_successes += 1;
        s.consecutive_failures = 0;
        s.consecutive_successes += 1;

        if s.consecutive_successes >= SUCCESS_STREAK_TO_TIGHTEN {
            let before = s.timeout_ms;
            s.timeout_ms = scale_timeout(s.timeout_ms, TIGHTEN_FACTOR);
            s.consecutive_successes = 0;
            debug!("网络稳定，超时收紧: {}ms -> {}ms", before, s.timeout_ms);
        }
    }

    /// 记录一次分片失败
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.push_outcome(false);

        let s = &mut state.settings;
        s.total_failures += 1;
        s.consecutive_successes = 0;
        s.consecutive_failures += 1;

        let before = s.timeout_ms;
        s.timeout_ms = scale_timeout(s.timeout_ms, RELAX_FACTOR);
        debug!(
            "分片失败，超时放宽: {}ms -> {}ms (连续失败 {})",
            before, s.timeout_ms, s.consecutive_failures
        );
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.state.lock().settings.timeout_ms)
    }

    pub fn quality(&self) -> NetworkQuality {
        self.state.lock().quality()
    }

    /// 根据网络质量和连续失败次数决定并行分片数
    ///
    /// - poor 或连续失败 >= 3: 1
    /// - fair: 不超过 2
    /// - 其余: 配置值
    pub fn concurrency(&self, configured: usize) -> usize {
        let configured = configured.clamp(1, MAX_PARALLEL_CHUNKS);
        let state = self.state.lock();
        let quality = state.quality();

        if quality == NetworkQuality::Poor
            || state.settings.consecutive_failures >= SEQUENTIAL_AFTER_FAILURES
        {
            return 1;
        }
        if quality == NetworkQuality::Fair {
            return configured.min(2);
        }
        configured
    }

    /// 按配置的限速计算下一个分片前需要等待的时间
    /// 分片发送完后需要补的限速等待
    pub fn throttle_delay(&self, bytes: u64, started: Instant) -> Duration {
        self.pacer.reserve(bytes, started)
    }

    pub fn settings(&self) -> AdaptiveSettings {
        self.state.lock().settings
    }

    pub fn bandwidth_limit(&self) -> i64 {
        self.pacer.limit()
    }
}

impl Default for AdaptiveController {
    fn default() -> Self {
        Self::new(0)
    }
}

fn scale_timeout(current_ms: u64, factor: f64) -> u64 {
    let scaled = (current_ms as f64 * factor).round() as u64;
    scaled.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

/// 限速等待时间
///
/// 目标耗时 = bytes / cap，实际更快时补足差值；cap <= 0 不限速
pub fn throttle_delay(bytes: u64, actual: Duration, cap_bytes_per_sec: i64) -> Duration {
    if cap_bytes_per_sec <= 0 {
        return Duration::ZERO;
    }
    let target = Duration::from_secs_f64(bytes as f64 / cap_bytes_per_sec as f64);
    target.saturating_sub(actual)
}
