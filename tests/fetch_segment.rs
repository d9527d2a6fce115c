//! 分段下载器集成测试

mod common;

use common::*;
use pack_installer::downloader::{FetchOutcome, Segment, SegmentFetcher};
use pack_installer::TransferError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const KB: u64 = 1024;

fn fetcher() -> SegmentFetcher {
    SegmentFetcher::new(reqwest::Client::new(), Duration::from_secs(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reported_bytes_are_already_in_file() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start().await;
    let data = test_data(256 * KB as usize, 21);
    let url = server.add_file("flush.bin", data.clone());
    let path = dir.path().join("flush.bin");
    std::fs::write(&path, vec![0u8; data.len()]).unwrap();

    let mut segment = Segment::new(64 * KB, 192 * KB);
    let reported = AtomicU64::new(0);
    let behind = AtomicU64::new(0);
    let on_bytes = |bytes: u64| {
        // 每次上报时，文件中已有上报范围内的全部数据
        let total = reported.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let range = 64 * KB as usize..(64 * KB + total) as usize;
        let on_disk = std::fs::read(&path).unwrap();
        if on_disk[range.clone()] != data[range] {
            behind.fetch_add(1, Ordering::SeqCst);
        }
    };

    let outcome = fetcher()
        .fetch(&url, &path, &mut segment, &on_bytes, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, FetchOutcome::Completed);
    assert_eq!(behind.load(Ordering::SeqCst), 0);
    assert_eq!(reported.load(Ordering::SeqCst), 128 * KB);
    assert_eq!(segment.written, 128 * KB);

    // 只写自己的区间
    let on_disk = std::fs::read(&path).unwrap();
    assert!(on_disk[..64 * KB as usize].iter().all(|b| *b == 0));
    assert_eq!(
        &on_disk[64 * KB as usize..192 * KB as usize],
        &data[64 * KB as usize..192 * KB as usize]
    );
    assert!(on_disk[192 * KB as usize..].iter().all(|b| *b == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_response_skips_written_prefix() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start().await;
    server.set_ignore_range(true);
    let data = test_data(128 * KB as usize, 22);
    let url = server.add_file("whole.bin", data.clone());
    let path = dir.path().join("whole.bin");

    // 前 32KB 已经写好
    let mut partial = data[..32 * KB as usize].to_vec();
    partial.resize(data.len(), 0);
    std::fs::write(&path, partial).unwrap();

    let mut segment = Segment::new(0, 128 * KB);
    segment.written = 32 * KB;
    let outcome = fetcher()
        .fetch(&url, &path, &mut segment, &|_| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, FetchOutcome::Completed);
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_response_rejected_for_inner_segment() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start().await;
    server.set_ignore_range(true);
    let data = test_data(128 * KB as usize, 23);
    let url = server.add_file("inner.bin", data.clone());
    let path = dir.path().join("inner.bin");
    std::fs::write(&path, vec![0u8; data.len()]).unwrap();

    let mut segment = Segment::new(64 * KB, 128 * KB);
    let result = fetcher()
        .fetch(&url, &path, &mut segment, &|_| {}, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(TransferError::RangeUnsupported)));
    assert_eq!(segment.written, 0);
}
