//! 分段下载器
//!
//! 对单个分段发起 Range 请求，把响应流按偏移写入目标文件。
//! 多个分段并发写同一个文件，各自只写自己的区间，因此写入无需加锁。

use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::retry::{backoff, RetryPolicy};
use super::segment::Segment;
use crate::error::TransferError;

/// 单次分段下载的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 分段已全部写入
    Completed,
    /// 收到取消信号（暂停或取消），已写入的字节保留
    Cancelled,
}

/// 分段下载器
#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    client: Client,
    /// 超过该时间没有收到任何数据视为网络错误
    stall_timeout: Duration,
}

impl SegmentFetcher {
    pub fn new(client: Client, stall_timeout: Duration) -> Self {
        Self {
            client,
            stall_timeout,
        }
    }

    /// 下载分段的剩余部分 `[start + written, end)`
    ///
    /// 每块数据写入并 flush 之后才推进 `segment.written` 并回调 `on_bytes`，
    /// 上报的进度不会超前于文件内容。出错时 `segment.written` 保留已落盘的进度。
    ///
    /// 服务器忽略 Range 返回 200 时，只有从文件开头的分段可以继续：
    /// 跳过响应开头已写入的部分。其余分段返回 `RangeUnsupported`。
    pub async fn fetch<F>(
        &self,
        url: &str,
        path: &Path,
        segment: &mut Segment,
        on_bytes: &F,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, TransferError>
    where
        F: Fn(u64) + Sync,
    {
        if segment.is_complete() {
            return Ok(FetchOutcome::Completed);
        }
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }

        let offset = segment.offset();
        let expected = segment.remaining();
        debug!(
            "下载分段 [{}, {}): bytes={}-{}",
            segment.start,
            segment.end,
            offset,
            segment.end - 1
        );

        // 1. 发送 Range 请求（等待响应头同样受停滞超时约束）
        let request = self
            .client
            .get(url)
            .header(header::RANGE, format!("bytes={}-{}", offset, segment.end - 1));

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
            result = tokio::time::timeout(self.stall_timeout, request.send()) => match result {
                Ok(resp) => resp?,
                Err(_) => {
                    return Err(TransferError::Network(format!(
                        "等待响应超时（{}s）",
                        self.stall_timeout.as_secs()
                    )))
                }
            },
        };

        let mut skip = Self::check_response(&resp, segment.start, offset)?;
        if skip > 0 {
            debug!("服务器忽略 Range，跳过响应开头 {} bytes", skip);
        }

        // 2. 打开文件并定位（文件已由任务控制器预分配）
        let mut file = File::options().write(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        // 3. 流式写入
        let mut stream = resp.bytes_stream();
        let mut received = 0u64;

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(FetchOutcome::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    break Err(TransferError::Network(format!(
                        "{}s 内未收到数据",
                        self.stall_timeout.as_secs()
                    )))
                }
                Ok(None) => break Ok(FetchOutcome::Completed),
                Ok(Some(Err(e))) => break Err(TransferError::Network(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let head = (chunk.len() as u64).min(skip) as usize;
            skip -= head as u64;
            let data = &chunk[head..];

            // 绝不越过分段末尾
            let take = (data.len() as u64).min(segment.remaining()) as usize;
            if take > 0 {
                if let Err(e) = file.write_all(&data[..take]).await {
                    break Err(TransferError::Io(e));
                }
                // 交给操作系统之后才算写入，续传记录不会超前于文件
                if let Err(e) = file.flush().await {
                    break Err(TransferError::Io(e));
                }
                segment.written += take as u64;
                received += take as u64;
                on_bytes(take as u64);
            }

            if segment.is_complete() {
                break Ok(FetchOutcome::Completed);
            }
            if cancel.is_cancelled() {
                break Ok(FetchOutcome::Cancelled);
            }
        };

        let outcome = result?;

        if outcome == FetchOutcome::Completed && !segment.is_complete() {
            return Err(TransferError::ShortRead { expected, received });
        }

        if outcome == FetchOutcome::Completed {
            debug!("分段 [{}, {}) 下载完成，本次写入 {} bytes", segment.start, segment.end, received);
        }
        Ok(outcome)
    }

    /// 带分段级重试的下载
    ///
    /// - 网络错误（含停滞、408/429/5xx）按指数退避重试 `policy.max_retries` 次
    /// - 长度不匹配重试 `short_read_retries` 次
    /// - 其余错误直接返回
    ///
    /// 每次重试都从 `segment.written` 继续，不会丢弃已下载的数据
    pub async fn fetch_with_retry<F>(
        &self,
        url: &str,
        path: &Path,
        segment: &mut Segment,
        on_bytes: &F,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        short_read_retries: u32,
    ) -> Result<FetchOutcome, TransferError>
    where
        F: Fn(u64) + Sync,
    {
        let mut network_retries = 0u32;
        let mut short_reads = 0u32;

        loop {
            let err = match self.fetch(url, path, segment, on_bytes, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            let delay = match &err {
                TransferError::ShortRead { .. } if short_reads < short_read_retries => {
                    short_reads += 1;
                    Duration::ZERO
                }
                e if e.is_transient() && policy.allows(network_retries) => {
                    let delay = policy.delay_for_attempt(network_retries);
                    network_retries += 1;
                    delay
                }
                _ => return Err(err),
            };

            warn!(
                "⚠ 分段 [{}, {}) 下载失败，{}ms 后从 {} 继续重试 (网络重试 {}/{}, 长度重试 {}/{}): {}",
                segment.start,
                segment.end,
                delay.as_millis(),
                segment.offset(),
                network_retries,
                policy.max_retries,
                short_reads,
                short_read_retries,
                err
            );

            if !backoff(delay, cancel).await {
                return Ok(FetchOutcome::Cancelled);
            }
        }
    }

    /// 检查响应状态与返回的区间
    ///
    /// 返回响应体开头需要跳过的字节数
    fn check_response(
        resp: &reqwest::Response,
        segment_start: u64,
        offset: u64,
    ) -> Result<u64, TransferError> {
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                let start = resp
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_start);
                match start {
                    Some(start) if start != offset => Err(TransferError::RangeUnsupported),
                    _ => Ok(0),
                }
            }
            // 服务器忽略 Range，响应从文件开头开始
            StatusCode::OK if segment_start == 0 => Ok(offset),
            StatusCode::OK => Err(TransferError::RangeUnsupported),
            status => Err(TransferError::Status(status.as_u16())),
        }
    }
}

/// 解析 `Content-Range: bytes <start>-<end>/<total>` 的起始位置
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_start("bytes 100-199/1000"), Some(100));
        assert_eq!(parse_content_range_start("bytes 0-0/1"), Some(0));
        assert_eq!(parse_content_range_start("bytes */1000"), None);
        assert_eq!(parse_content_range_start("items 1-2/3"), None);
    }

    #[tokio::test]
    async fn test_complete_segment_skips_request() {
        let fetcher = SegmentFetcher::new(Client::new(), Duration::from_secs(1));
        let mut segment = Segment::new(0, 10);
        segment.written = 10;

        // 不会发出请求，URL 不可达也无妨
        let outcome = fetcher
            .fetch(
                "http://127.0.0.1:9/never",
                Path::new("/nonexistent"),
                &mut segment,
                &|_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fetcher = SegmentFetcher::new(Client::new(), Duration::from_secs(1));
        let mut segment = Segment::new(0, 10);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = fetcher
            .fetch(
                "http://127.0.0.1:9/never",
                Path::new("/nonexistent"),
                &mut segment,
                &|_| {},
                &token,
            )
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Cancelled);
        assert_eq!(segment.written, 0);
    }
}
