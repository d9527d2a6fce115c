//! 下载速度计算
//!
//! 滑动窗口统计最近一段时间内写入的字节数，暂停或限速会立即反映到速度上

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 默认统计窗口：1 秒
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(1);

/// 滑动窗口速度计算器
#[derive(Debug)]
pub struct SpeedCalculator {
    window: Duration,
    /// (时间点, 字节数)
    samples: VecDeque<(Instant, u64)>,
    /// 窗口内字节总数
    window_bytes: u64,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            window_bytes: 0,
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }

    /// 记录一次写入
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    fn add_sample_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.window_bytes += bytes;
        self.evict(at);
    }

    /// 当前速度（字节/秒）
    pub fn speed(&mut self) -> u64 {
        self.speed_at(Instant::now())
    }

    fn speed_at(&mut self, now: Instant) -> u64 {
        self.evict(now);
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.window_bytes as f64 / secs) as u64
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.window_bytes = 0;
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::with_default_window()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_within_window() {
        let mut calc = SpeedCalculator::with_default_window();
        let t0 = Instant::now();
        calc.add_sample_at(t0, 500);
        calc.add_sample_at(t0 + Duration::from_millis(200), 500);
        assert_eq!(calc.speed_at(t0 + Duration::from_millis(400)), 1000);
    }

    #[test]
    fn test_old_samples_expire() {
        let mut calc = SpeedCalculator::with_default_window();
        let t0 = Instant::now();
        calc.add_sample_at(t0, 4096);

        // 停止写入后速度归零，而不是累计平均值
        assert_eq!(calc.speed_at(t0 + Duration::from_millis(1500)), 0);
    }

    #[test]
    fn test_reset() {
        let mut calc = SpeedCalculator::with_default_window();
        calc.add_sample(100);
        calc.reset();
        assert_eq!(calc.speed(), 0);
    }
}
