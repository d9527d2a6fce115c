//! 重试策略
//!
//! 分段级与任务级各用一份独立的策略，互不嵌套：
//! - 分段级：网络错误按指数退避重试，长度不匹配单独计数
//! - 任务级：分段重试耗尽后，从续传记录重新规划整个任务

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;

/// 指数退避重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 退避基准，第 n 次重试等待 base * 2^n
    pub base_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// 分段级策略
    pub fn segment(config: &DownloadConfig) -> Self {
        Self::new(
            config.segment_max_retries,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// 任务级策略
    pub fn task(config: &DownloadConfig) -> Self {
        Self::new(
            config.task_max_retries,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// 第 `attempt` 次重试（从 0 开始）前的等待时间
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 移位溢出时饱和到上限
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 是否还能继续重试
    pub fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

/// 可取消的退避等待
///
/// 返回 false 表示等待期间被取消
pub async fn backoff(delay: Duration, token: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
