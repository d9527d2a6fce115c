//! 进度事件节流器
//!
//! 控制进度事件与续传记录写入的频率，避免事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 250;

/// 尚未发布过
const NEVER: u64 = u64::MAX;

/// 进度事件节流器
///
/// 线程安全，使用原子操作避免锁竞争。
/// 典型用法：每次聚合进度时调用 `should_emit()`，返回 true 时才发布；
/// 状态切换时调用 `force_emit()`。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 时间基准，所有时间戳都相对它计算（跨线程一致）
    origin: Instant,
    /// 上次发布的时间戳（相对 origin 的纳秒）
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 距离上次发布超过节流间隔（或从未发布）时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        let due = last == NEVER || now.saturating_sub(last) >= self.interval_nanos;
        if !due {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（状态切换、最后一次更新）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos.store(self.now_nanos(), Ordering::Relaxed);
        true
    }

    fn now_nanos(&self) -> u64 {
        // NEVER 作为哨兵值保留
        (self.origin.elapsed().as_nanos() as u64).min(NEVER - 1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
