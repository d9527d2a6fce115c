//! 分段规划
//!
//! 把资源包的字节区间 `[0, size)` 切分为连续、互不重叠的分段，
//! 每个分段独立下载、独立记录已写入的字节数，用于并发与断点续传

use crate::error::EngineError;
use tracing::{debug, info};

/// 分段：字节区间 `[start, end)` 及区间内已写入的字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    /// 已写入字节数（相对 start），`0 <= written <= len()`
    pub written: u64,
}

impl Segment {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            written: 0,
        }
    }

    /// 分段长度
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 下一个待写入字节的绝对位置，始终在 `[start, end]` 内
    pub fn offset(&self) -> u64 {
        self.start + self.written
    }

    pub fn remaining(&self) -> u64 {
        self.len() - self.written
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.len()
    }
}

/// 分段规划器
#[derive(Debug, Clone, Copy)]
pub struct SegmentPlanner {
    /// 最小分段大小，避免小文件被切得过碎
    min_segment_size: u64,
}

impl SegmentPlanner {
    pub fn new(min_segment_size: u64) -> Self {
        Self {
            min_segment_size: min_segment_size.max(1),
        }
    }

    /// 生成分段布局
    ///
    /// 历史布局完整覆盖 `[0, declared_size)` 时原样复用（续传），否则重新规划
    pub fn plan(
        &self,
        declared_size: u64,
        concurrency: usize,
        prior: Option<&[Segment]>,
    ) -> Result<Vec<Segment>, EngineError> {
        if declared_size == 0 {
            return Err(EngineError::invalid_entry("", "声明大小必须大于 0"));
        }

        if let Some(prior) = prior {
            if Self::covers(prior, declared_size) {
                let written: u64 = prior.iter().map(|s| s.written).sum();
                info!(
                    "复用续传分段布局: {} 个分段, 已写入 {}/{} bytes",
                    prior.len(),
                    written,
                    declared_size
                );
                return Ok(prior.to_vec());
            }
            debug!("历史分段布局与声明大小不一致，重新规划");
        }

        let by_size = declared_size.div_ceil(self.min_segment_size);
        let count = (concurrency.max(1) as u64).min(by_size);
        let segments = Self::split(declared_size, count);

        debug!(
            "规划分段: 文件大小={} bytes, 分段数量={}",
            declared_size,
            segments.len()
        );
        Ok(segments)
    }

    /// 等分为 `count` 段（限制在 `[1, size]`），最后一段吸收余数
    pub fn split(size: u64, count: u64) -> Vec<Segment> {
        if size == 0 {
            return Vec::new();
        }
        let count = count.clamp(1, size);
        let base = size / count;

        (0..count)
            .map(|i| {
                let start = i * base;
                let end = if i == count - 1 { size } else { start + base };
                Segment::new(start, end)
            })
            .collect()
    }

    /// 布局是否从 0 开始连续覆盖到 `size`，且已写入量都在分段内
    pub fn covers(segments: &[Segment], size: u64) -> bool {
        let mut expected_start = 0;
        for segment in segments {
            if segment.start != expected_start
                || segment.end <= segment.start
                || segment.written > segment.len()
            {
                return false;
            }
            expected_start = segment.end;
        }
        !segments.is_empty() && expected_start == size
    }
}
