//! 集成测试公共工具：支持 Range 请求的本地文件服务器

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::{Path as UrlPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use pack_installer::{
    downloader::{ArchiveExtractor, DownloadTask},
    error::ExtractError,
    AppConfig, InstallOrchestrator, Manifest, Pack, TaskStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CHUNK_SIZE: usize = 16 * 1024;

/// 服务器收到的一次 Range 请求（闭区间）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub file: String,
    pub start: u64,
    pub end: u64,
}

impl RangeRequest {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    /// 以连接错误中断
    Disconnect,
    /// 正常结束响应，且不声明 Content-Length
    EarlyEof,
    /// 不再发送任何数据
    Stall,
}

/// 对起点为 `start` 的请求，发送 `after_bytes` 字节后触发故障（只生效一次）
#[derive(Debug, Clone)]
struct Fault {
    file: String,
    start: u64,
    after_bytes: usize,
    kind: FaultKind,
}

#[derive(Default)]
struct ServerState {
    files: Mutex<HashMap<String, Bytes>>,
    requests: Mutex<Vec<RangeRequest>>,
    faults: Mutex<Vec<Fault>>,
    /// 每个数据块之间的延迟，用于制造"传输中"的窗口
    chunk_delay: Mutex<Option<Duration>>,
    /// 单个文件的数据块延迟，优先于 `chunk_delay`
    file_delays: Mutex<HashMap<String, Duration>>,
    /// 忽略 Range 头，总是返回完整文件
    ignore_range: Mutex<bool>,
}

/// 测试用文件服务器
#[derive(Clone)]
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/files/:name", get(serve_file))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// 注册文件，返回下载地址（带模拟的签名参数）
    pub fn add_file(&self, name: &str, data: Vec<u8>) -> String {
        self.state
            .files
            .lock()
            .insert(name.to_string(), Bytes::from(data));
        format!("http://{}/files/{}?auth_key=test-signature", self.addr, name)
    }

    fn inject(&self, file: &str, start: u64, after_bytes: usize, kind: FaultKind) {
        self.state.faults.lock().push(Fault {
            file: file.to_string(),
            start,
            after_bytes,
            kind,
        });
    }

    pub fn inject_disconnect(&self, file: &str, start: u64, after_bytes: usize) {
        self.inject(file, start, after_bytes, FaultKind::Disconnect);
    }

    /// 发送 `after_bytes` 字节后干净地结束响应（长度不足）
    pub fn inject_early_eof(&self, file: &str, start: u64, after_bytes: usize) {
        self.inject(file, start, after_bytes, FaultKind::EarlyEof);
    }

    /// 发送 `after_bytes` 字节后停住，连接保持打开
    pub fn inject_stall(&self, file: &str, start: u64, after_bytes: usize) {
        self.inject(file, start, after_bytes, FaultKind::Stall);
    }

    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        *self.state.chunk_delay.lock() = delay;
    }

    pub fn set_file_delay(&self, file: &str, delay: Option<Duration>) {
        let mut delays = self.state.file_delays.lock();
        match delay {
            Some(delay) => delays.insert(file.to_string(), delay),
            None => delays.remove(file),
        };
    }

    pub fn set_ignore_range(&self, ignore: bool) {
        *self.state.ignore_range.lock() = ignore;
    }

    pub fn requests(&self, file: &str) -> Vec<RangeRequest> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.file == file)
            .cloned()
            .collect()
    }

    /// 某个文件被请求的总字节数
    pub fn requested_bytes(&self, file: &str) -> u64 {
        self.requests(file).iter().map(RangeRequest::len).sum()
    }

    pub fn clear_requests(&self) {
        self.state.requests.lock().clear();
    }
}

fn parse_range(headers: &HeaderMap, total: u64) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total - 1
    } else {
        end.parse::<u64>().ok()?.min(total - 1)
    };
    (start <= end).then_some((start, end))
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let Some(data) = state.files.lock().get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let total = data.len() as u64;

    let range = if *state.ignore_range.lock() {
        None
    } else {
        parse_range(&headers, total)
    };
    let (start, end) = range.unwrap_or((0, total - 1));

    state.requests.lock().push(RangeRequest {
        file: name.clone(),
        start,
        end,
    });

    let fault = {
        let mut faults = state.faults.lock();
        faults
            .iter()
            .position(|f| f.file == name && f.start == start)
            .map(|i| faults.remove(i))
    };

    let body = data.slice(start as usize..=end as usize);
    let body = match &fault {
        Some(f) => body.slice(..f.after_bytes.min(body.len())),
        None => body,
    };

    let delay = state
        .file_delays
        .lock()
        .get(&name)
        .copied()
        .or(*state.chunk_delay.lock());
    let chunks: Vec<Bytes> = (0..body.len())
        .step_by(CHUNK_SIZE)
        .map(|i| body.slice(i..(i + CHUNK_SIZE).min(body.len())))
        .collect();
    let data_stream = futures::stream::iter(chunks).then(move |chunk| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, io::Error>(chunk)
    });

    let kind = fault.map(|f| f.kind);
    let stream = match kind {
        Some(FaultKind::Disconnect) => data_stream
            .chain(futures::stream::once(async {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected disconnect"))
            }))
            .boxed(),
        Some(FaultKind::Stall) => data_stream
            .chain(futures::stream::once(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Bytes::new())
            }))
            .boxed(),
        Some(FaultKind::EarlyEof) | None => data_stream.boxed(),
    };

    let mut response = Response::builder().header(header::ACCEPT_RANGES, "bytes");
    if kind != Some(FaultKind::EarlyEof) {
        response = response.header(header::CONTENT_LENGTH, end - start + 1);
    }
    response = if range.is_some() {
        response.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, total),
        )
    } else {
        response.status(StatusCode::OK)
    };
    response.body(Body::from_stream(stream)).unwrap()
}

/// 不做任何事的解压器
pub struct NoopExtractor;

impl ArchiveExtractor for NoopExtractor {
    fn extract(&self, _archive: &Path, _dest_dir: &Path) -> Result<(), ExtractError> {
        Ok(())
    }
}

/// 确定性的测试数据
pub fn test_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64 * 31 + seed as u64) % 251) as u8)
        .collect()
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.persistence.resume_dir = dir.join("resume");
    config.persistence.persist_interval_ms = 50;
    config.download.min_segment_size = 64 * 1024;
    config.download.segment_concurrency = 4;
    config.download.progress_interval_ms = 20;
    config.download.retry_base_delay_ms = 10;
    config.download.retry_max_delay_ms = 50;
    config.download.stall_timeout_secs = 5;
    config.log.enabled = false;
    config
}

pub fn noop_orchestrator(config: &AppConfig) -> InstallOrchestrator {
    InstallOrchestrator::with_extractor(config, Arc::new(NoopExtractor)).unwrap()
}

pub fn manifest(packs: Vec<Pack>) -> Manifest {
    Manifest {
        game_id: "1001".to_string(),
        version: "2.0.1".to_string(),
        total_size: packs.iter().map(|p| p.size).sum(),
        packs,
        game_files_md5: String::new(),
        file_path: String::new(),
    }
}

/// 轮询直到任务满足条件，超时则 panic
pub async fn wait_task<F>(orchestrator: &InstallOrchestrator, task_id: &str, pred: F) -> DownloadTask
where
    F: Fn(&DownloadTask) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(task) = orchestrator.get_task(task_id) {
            if pred(&task) {
                return task;
            }
        }
        if Instant::now() > deadline {
            panic!(
                "等待任务超时: {:?}",
                orchestrator.get_task(task_id).map(|t| (t.status, t.downloaded_size))
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_status(
    orchestrator: &InstallOrchestrator,
    task_id: &str,
    status: TaskStatus,
) -> DownloadTask {
    wait_task(orchestrator, task_id, |t| t.status == status).await
}
