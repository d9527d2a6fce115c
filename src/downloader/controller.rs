//! 任务控制器
//!
//! 一个控制器独占一个下载任务：驱动状态机、调度分段下载、聚合进度、
//! 写续传记录，并对外提供暂停 / 恢复 / 取消。
//!
//! 锁顺序：`run_state` → `task`，两者都不跨 await 持有。

use parking_lot::{Mutex, RwLock};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checksum::ChecksumVerifier;
use super::fetcher::{FetchOutcome, SegmentFetcher};
use super::progress::SpeedCalculator;
use super::retry::{backoff, RetryPolicy};
use super::segment::{Segment, SegmentPlanner};
use super::task::{DownloadTask, TaskStatus};
use crate::config::DownloadConfig;
use crate::error::{EngineError, TransferError};
use crate::events::{ProgressBus, ProgressEvent, ProgressThrottler};
use crate::manifest::Pack;
use crate::persistence::{ResumeState, ResumeStore, SegmentRecord};

/// 任务所属的安装批次信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallInfo {
    pub install_id: String,
    pub game_id: String,
    pub version: String,
    /// 安装目录（解压目标）
    pub dest_dir: PathBuf,
}

/// 控制器共享的依赖
#[derive(Debug, Clone)]
pub struct ControllerContext {
    pub fetcher: SegmentFetcher,
    pub store: ResumeStore,
    pub bus: ProgressBus,
    pub config: Arc<DownloadConfig>,
    /// 续传记录最小写入间隔
    pub persist_interval: Duration,
}

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Pause,
    Cancel,
}

#[derive(Debug, Default)]
struct RunState {
    /// 当前运行的取消令牌，未运行时为 None
    token: Option<CancellationToken>,
    stop: Option<StopReason>,
}

/// 一次运行的结果
enum DriveOutcome {
    Verified,
    Stopped,
}

/// 当前分段布局及各分段已写入字节数
///
/// 分段下载器通过 `add` 上报进度，控制器按需读取快照做聚合与持久化
#[derive(Debug)]
struct SegmentTable {
    layout: Vec<Segment>,
    written: Vec<AtomicU64>,
}

impl SegmentTable {
    fn new(segments: &[Segment]) -> Self {
        Self {
            layout: segments.to_vec(),
            written: segments.iter().map(|s| AtomicU64::new(s.written)).collect(),
        }
    }

    fn add(&self, index: usize, bytes: u64) {
        self.written[index].fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<Segment> {
        self.layout
            .iter()
            .zip(&self.written)
            .map(|(s, w)| Segment {
                written: w.load(Ordering::Relaxed).min(s.len()),
                ..*s
            })
            .collect()
    }

    fn total_written(&self) -> u64 {
        self.snapshot().iter().map(|s| s.written).sum()
    }
}

/// 任务控制器
pub struct TaskController {
    task: RwLock<DownloadTask>,
    pack: Arc<Pack>,
    install: Arc<InstallInfo>,
    ctx: ControllerContext,
    run_state: Mutex<RunState>,
    /// 是否有运行中的下载（保证同一任务同时最多一个传输）
    running: watch::Sender<bool>,
    speed: Mutex<SpeedCalculator>,
    publish_throttle: ProgressThrottler,
    persist_throttle: ProgressThrottler,
    table: Mutex<Option<Arc<SegmentTable>>>,
    /// 服务器不支持 Range，改为单连接从头下载
    single_stream: AtomicBool,
}

impl TaskController {
    /// 为资源包创建新任务
    pub fn new(pack: Arc<Pack>, install: Arc<InstallInfo>, ctx: ControllerContext) -> Arc<Self> {
        let dest_path = install.dest_dir.join(&pack.filename);
        let task = DownloadTask::new(&install.install_id, &install.game_id, &pack, dest_path);
        Self::with_task(task, pack, install, ctx)
    }

    /// 从续传记录恢复（状态为暂停，不会自动开始）
    pub fn from_resume_state(state: &ResumeState, ctx: ControllerContext) -> Arc<Self> {
        let pack = Arc::new(Pack {
            url: state.url.clone(),
            md5: state.digest.clone(),
            size: state.declared_size,
            filename: state.filename.clone(),
        });
        let install = Arc::new(InstallInfo {
            install_id: state.install_id.clone(),
            game_id: state.game_id.clone(),
            version: state.version.clone(),
            dest_dir: state.dest_dir.clone(),
        });
        Self::with_task(DownloadTask::from_resume_state(state), pack, install, ctx)
    }

    fn with_task(
        task: DownloadTask,
        pack: Arc<Pack>,
        install: Arc<InstallInfo>,
        ctx: ControllerContext,
    ) -> Arc<Self> {
        let interval = ctx.config.progress_interval();
        let persist_interval = ctx.persist_interval;
        Arc::new(Self {
            task: RwLock::new(task),
            pack,
            install,
            ctx,
            run_state: Mutex::new(RunState::default()),
            running: watch::channel(false).0,
            speed: Mutex::new(SpeedCalculator::with_default_window()),
            publish_throttle: ProgressThrottler::new(interval),
            persist_throttle: ProgressThrottler::new(persist_interval),
            table: Mutex::new(None),
            single_stream: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> String {
        self.task.read().id.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.read().status
    }

    /// 任务快照
    pub fn snapshot(&self) -> DownloadTask {
        self.task.read().clone()
    }

    pub fn pack(&self) -> &Arc<Pack> {
        &self.pack
    }

    pub fn install(&self) -> &Arc<InstallInfo> {
        &self.install
    }

    pub fn dest_path(&self) -> PathBuf {
        self.task.read().dest_path.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    // ========================================================================
    // 对外控制
    // ========================================================================

    /// 运行任务直到完成、暂停、失败或取消
    ///
    /// 仅当任务处于 Pending 且没有其他运行实例时才会开始，否则立即返回
    pub async fn run(self: Arc<Self>) {
        let token = {
            let mut rs = self.run_state.lock();
            let mut task = self.task.write();
            if task.status != TaskStatus::Pending || *self.running.borrow() {
                debug!("任务 {} 当前状态 {:?}，跳过启动", task.id, task.status);
                return;
            }
            let token = CancellationToken::new();
            rs.token = Some(token.clone());
            rs.stop = None;
            task.mark_downloading();
            self.running.send_replace(true);
            info!("开始下载任务: {} ({})", task.id, task.name);
            token
        };
        self.speed.lock().reset();
        self.publish_now();

        let result = self.drive(&token).await;
        self.finish(result).await;
    }

    /// 暂停任务
    ///
    /// 下载中：通知所有分段停止，等待续传记录落盘后返回；
    /// 排队中：直接转为暂停；其余状态（包括校验中）为空操作
    pub async fn pause(&self) {
        let action = {
            let mut rs = self.run_state.lock();
            let mut task = self.task.write();
            match task.status {
                TaskStatus::Downloading => {
                    if rs.stop.is_none() {
                        rs.stop = Some(StopReason::Pause);
                    }
                    if let Some(token) = &rs.token {
                        token.cancel();
                    }
                    info!("暂停下载任务: {}", task.id);
                    Action::WaitIdle
                }
                TaskStatus::Pending => {
                    task.mark_paused();
                    Action::Settle
                }
                _ => Action::Nothing,
            }
        };

        match action {
            Action::WaitIdle => self.wait_idle().await,
            Action::Settle => {
                // 先持久化，再发布事件
                self.persist(None).await;
                self.publish_now();
                info!("排队任务已暂停: {}", self.id());
            }
            Action::Nothing => {}
        }
    }

    /// 取消任务：中止传输，删除部分文件与续传记录
    ///
    /// 已完成或已取消的任务为空操作
    pub async fn cancel(&self) {
        let action = {
            let mut rs = self.run_state.lock();
            let mut task = self.task.write();
            match task.status {
                TaskStatus::Downloading | TaskStatus::Verifying => {
                    rs.stop = Some(StopReason::Cancel);
                    if let Some(token) = &rs.token {
                        token.cancel();
                    }
                    info!("取消下载任务: {}", task.id);
                    Action::WaitIdle
                }
                TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Error => {
                    task.mark_cancelled();
                    Action::Settle
                }
                TaskStatus::Completed | TaskStatus::Cancelled => Action::Nothing,
            }
        };

        match action {
            Action::WaitIdle => self.wait_idle().await,
            Action::Settle => {
                self.discard_artifacts().await;
                self.publish_now();
                info!("已取消任务: {}", self.id());
            }
            Action::Nothing => {}
        }
    }

    /// 准备恢复：暂停或失败的任务回到 Pending，等待调度
    ///
    /// 返回任务是否处于可调度的 Pending 状态
    pub fn prepare_resume(&self) -> bool {
        let _rs = self.run_state.lock();
        let mut task = self.task.write();
        match task.status {
            TaskStatus::Paused | TaskStatus::Error if !*self.running.borrow() => {
                task.mark_pending();
                drop(task);
                self.publish_now();
                true
            }
            TaskStatus::Pending => true,
            _ => false,
        }
    }

    /// 等待当前运行结束
    pub async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    // ========================================================================
    // 运行流程
    // ========================================================================

    async fn drive(self: &Arc<Self>, token: &CancellationToken) -> Result<DriveOutcome, EngineError> {
        let policy = RetryPolicy::task(&self.ctx.config);
        let mut retries = 0u32;

        loop {
            match self.download_segments(token).await {
                Ok(FetchOutcome::Completed) => break,
                Ok(FetchOutcome::Cancelled) => return Ok(DriveOutcome::Stopped),
                Err(EngineError::Transfer(TransferError::RangeUnsupported))
                    if !self.single_stream.load(Ordering::Relaxed) =>
                {
                    self.single_stream.store(true, Ordering::Relaxed);
                    warn!("⚠ 服务器不支持 Range，任务 {} 改为单连接从头下载", self.id());
                }
                Err(e) if e.is_transient() && policy.allows(retries) => {
                    let delay = policy.delay_for_attempt(retries);
                    retries += 1;
                    warn!(
                        "⚠ 任务 {} 下载失败，{}ms 后从续传记录重新规划 ({}/{}): {}",
                        self.id(),
                        delay.as_millis(),
                        retries,
                        policy.max_retries,
                        e
                    );
                    if !backoff(delay, token).await {
                        return Ok(DriveOutcome::Stopped);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // 所有分段写完后才进入校验；进入前再确认没有收到停止信号
        {
            let rs = self.run_state.lock();
            if rs.stop.is_some() || token.is_cancelled() {
                return Ok(DriveOutcome::Stopped);
            }
            self.task.write().mark_verifying();
        }
        self.publish_now();
        info!("任务 {} 下载完成，开始校验 MD5", self.id());

        let path = self.dest_path();
        ChecksumVerifier::verify(&path, &self.pack.md5).await?;
        Ok(DriveOutcome::Verified)
    }

    /// 规划分段并并发下载，直到全部完成、收到停止信号或出现不可恢复的错误
    async fn download_segments(
        self: &Arc<Self>,
        token: &CancellationToken,
    ) -> Result<FetchOutcome, EngineError> {
        let config = self.ctx.config.clone();
        let size = self.pack.size;
        let path = self.dest_path();

        // 单连接模式只能续传从文件开头开始的单个分段
        let single_stream = self.single_stream.load(Ordering::Relaxed);
        let prior = self
            .load_prior(&path)
            .await
            .filter(|segments| !single_stream || segments.len() == 1);
        let concurrency = if single_stream { 1 } else { config.segment_concurrency };
        let segments = SegmentPlanner::new(config.min_segment_size)
            .plan(size, concurrency, prior.as_deref())
            .map_err(|_| EngineError::invalid_entry(&self.pack.filename, "声明大小必须大于 0"))?;

        if prior.is_none() {
            prepare_file(&path, size).await?;
        }

        let table = Arc::new(SegmentTable::new(&segments));
        *self.table.lock() = Some(table.clone());
        self.task.write().reset_progress(table.total_written());
        self.persist(None).await;
        self.publish_now();

        let child = token.child_token();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let segment_policy = RetryPolicy::segment(&config);
        let short_read_retries = config.short_read_retries;
        let mut set = JoinSet::new();

        for (index, mut segment) in segments.into_iter().enumerate() {
            if segment.is_complete() {
                continue;
            }
            let this = Arc::clone(self);
            let table = table.clone();
            let semaphore = semaphore.clone();
            let child = child.clone();
            let path = path.clone();
            let url = self.pack.url.clone();

            set.spawn(async move {
                let _permit = tokio::select! {
                    _ = child.cancelled() => return Ok(FetchOutcome::Cancelled),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Ok(FetchOutcome::Cancelled),
                    },
                };
                let on_bytes = |bytes: u64| {
                    table.add(index, bytes);
                    this.speed.lock().add_sample(bytes);
                };
                this.ctx
                    .fetcher
                    .fetch_with_retry(
                        &url,
                        &path,
                        &mut segment,
                        &on_bytes,
                        &child,
                        &segment_policy,
                        short_read_retries,
                    )
                    .await
            });
        }

        debug!("任务 {} 启动 {} 个分段下载", self.id(), set.len());

        let mut ticker = tokio::time::interval(config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failure: Option<EngineError> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(FetchOutcome::Completed))) => {}
                    Some(Ok(Ok(FetchOutcome::Cancelled))) => cancelled = true,
                    Some(Ok(Err(e))) => {
                        if failure.is_none() {
                            error!("✗ 任务 {} 分段下载失败: {}", self.id(), e);
                            failure = Some(e.into());
                            child.cancel();
                        }
                    }
                    Some(Err(join_err)) => {
                        if failure.is_none() {
                            error!("✗ 任务 {} 分段下载异常退出: {}", self.id(), join_err);
                            failure = Some(EngineError::Io(io::Error::new(
                                io::ErrorKind::Other,
                                join_err.to_string(),
                            )));
                            child.cancel();
                        }
                    }
                },
                _ = ticker.tick() => self.on_tick(&table).await,
            }
        }

        self.refresh_progress(&table);

        if let Some(e) = failure {
            // 精确记录失败时的进度，重试只请求剩余字节
            self.persist(Some(e.to_string())).await;
            return Err(e);
        }
        if cancelled || token.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }

        let written = table.total_written();
        if written < size {
            self.persist(None).await;
            return Err(TransferError::ShortRead {
                expected: size,
                received: written,
            }
            .into());
        }
        Ok(FetchOutcome::Completed)
    }

    /// 运行结束后的状态收尾
    async fn finish(&self, result: Result<DriveOutcome, EngineError>) {
        let stop = self.run_state.lock().stop;
        let id = self.id();

        // 文件与记录的清理先于状态切换
        let next = match (stop, result) {
            (Some(StopReason::Cancel), _) => {
                self.discard_artifacts().await;
                info!("任务 {} 已取消，部分文件与续传记录已删除", id);
                Next::Cancelled
            }
            (_, Ok(DriveOutcome::Verified)) => {
                // 先在批次记录中登记完成，再删除续传记录，重启后仍能找回待解压的资源包
                let install_id = self.install.install_id.clone();
                let task_id = id.clone();
                let result = self
                    .ctx
                    .store
                    .spawn_blocking(move |store| {
                        store.mark_pack_completed(&install_id, &task_id)?;
                        store.delete(&task_id)
                    })
                    .await;
                if let Err(e) = result {
                    warn!("更新续传记录失败: task_id={}, 错误: {}", id, e);
                }
                info!("✓ 任务 {} 下载并校验完成", id);
                Next::Completed
            }
            (_, Err(e @ EngineError::ChecksumMismatch { .. })) => {
                // 损坏的文件绝不保留；记录归零并保留失败原因
                self.remove_file().await;
                self.task.write().reset_progress(0);
                let fresh = SegmentPlanner::split(self.pack.size, 1);
                self.persist_segments(Some(fresh), Some(e.to_string())).await;
                error!("✗ 任务 {} 校验失败: {}", id, e);
                Next::Error(e.to_string())
            }
            (Some(StopReason::Pause), _) | (None, Ok(DriveOutcome::Stopped)) => {
                self.persist(None).await;
                info!("任务 {} 已暂停，续传记录已保存", id);
                Next::Paused
            }
            (None, Err(e)) => {
                self.persist(Some(e.to_string())).await;
                error!("✗ 任务 {} 失败: {}", id, e);
                Next::Error(e.to_string())
            }
        };

        *self.table.lock() = None;

        let mut rs = self.run_state.lock();
        {
            let mut task = self.task.write();
            match next {
                Next::Completed => task.mark_completed(),
                Next::Paused => task.mark_paused(),
                Next::Cancelled => task.mark_cancelled(),
                Next::Error(msg) => task.mark_error(msg),
            }
        }
        rs.token = None;
        rs.stop = None;
        // 状态与运行标志在同一把锁内切换，恢复请求不会看到中间态
        self.publish_now();
        self.running.send_replace(false);
    }

    // ========================================================================
    // 进度与持久化
    // ========================================================================

    async fn on_tick(&self, table: &SegmentTable) {
        self.refresh_progress(table);
        if self.publish_throttle.should_emit() {
            self.publish(&self.snapshot());
        }
        if self.persist_throttle.should_emit() {
            self.persist(None).await;
        }
    }

    fn refresh_progress(&self, table: &SegmentTable) {
        let speed = self.speed.lock().speed();
        self.task.write().update_progress(table.total_written(), speed);
    }

    /// 立即发布（状态切换时调用）
    pub(crate) fn publish_now(&self) {
        self.publish_throttle.force_emit();
        self.publish(&self.snapshot());
    }

    fn publish(&self, task: &DownloadTask) {
        self.ctx.bus.publish(ProgressEvent::from_task(task));
    }

    /// 按当前分段进度写入续传记录
    async fn persist(&self, last_error: Option<String>) {
        self.persist_segments(None, last_error).await;
    }

    /// 写入续传记录
    ///
    /// 未指定分段时依次取当前分段表、已有记录、整个文件一个分段。
    /// 写入在阻塞线程池上执行，失败只记录警告，不影响任务本身
    async fn persist_segments(
        &self,
        segments: Option<Vec<Segment>>,
        last_error: Option<String>,
    ) {
        self.persist_throttle.force_emit();

        let segments = segments.or_else(|| self.table.lock().as_ref().map(|t| t.snapshot()));
        let task = self.snapshot();
        let mut state = ResumeState {
            task_id: task.id.clone(),
            install_id: self.install.install_id.clone(),
            game_id: self.install.game_id.clone(),
            version: self.install.version.clone(),
            filename: self.pack.filename.clone(),
            url: self.pack.url.clone(),
            destination_path: task.dest_path.clone(),
            dest_dir: self.install.dest_dir.clone(),
            declared_size: self.pack.size,
            digest: self.pack.md5.clone(),
            last_error,
            created_at: chrono::DateTime::<chrono::Utc>::from_timestamp(task.created_at, 0)
                .unwrap_or_else(chrono::Utc::now),
            updated_at: chrono::Utc::now(),
            segments: segments
                .unwrap_or_default()
                .iter()
                .map(SegmentRecord::from)
                .collect(),
        };

        let size = self.pack.size;
        let result = self
            .ctx
            .store
            .spawn_blocking(move |store| {
                if state.segments.is_empty() {
                    state.segments = match store.load(&state.task_id) {
                        Ok(Some(prev)) => prev.segments,
                        _ => SegmentPlanner::split(size, 1)
                            .iter()
                            .map(SegmentRecord::from)
                            .collect(),
                    };
                }
                store.save(&state)
            })
            .await;

        if let Err(e) = result {
            warn!("保存续传记录失败: task_id={}, 错误: {}", task.id, e);
        }
    }

    /// 读取并校验历史续传记录
    ///
    /// 只有大小、摘要一致、分段完整覆盖且部分文件仍在时才复用
    async fn load_prior(&self, path: &Path) -> Option<Vec<Segment>> {
        let id = self.id();
        let task_id = id.clone();
        let loaded = self
            .ctx
            .store
            .spawn_blocking(move |store| store.load(&task_id))
            .await;
        let state = match loaded {
            Ok(Some(state)) => state,
            Ok(None) => return None,
            Err(e) => {
                warn!("读取续传记录失败: task_id={}, 错误: {}", id, e);
                return None;
            }
        };

        if state.declared_size != self.pack.size || !state.digest.eq_ignore_ascii_case(&self.pack.md5) {
            warn!("续传记录与资源包不一致，重新下载: task_id={}", id);
            return None;
        }

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() == self.pack.size => {}
            _ => {
                warn!("部分文件缺失或大小不符，重新下载: {:?}", path);
                return None;
            }
        }

        let segments = state.to_segments();
        if !SegmentPlanner::covers(&segments, self.pack.size) {
            warn!("续传记录分段不完整，重新下载: task_id={}", id);
            return None;
        }
        Some(segments)
    }

    /// 删除部分文件与续传记录
    async fn discard_artifacts(&self) {
        self.remove_file().await;

        let id = self.id();
        let task_id = id.clone();
        let result = self
            .ctx
            .store
            .spawn_blocking(move |store| store.delete(&task_id))
            .await;
        if let Err(e) = result {
            warn!("删除续传记录失败: task_id={}, 错误: {}", id, e);
        }
    }

    async fn remove_file(&self) {
        let path = self.dest_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("已删除文件: {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除文件失败: {:?}, 错误: {}", path, e),
        }
    }
}

/// 暂停 / 取消请求在锁外要做的事
enum Action {
    /// 等待运行中的传输退出
    WaitIdle,
    /// 未在运行，直接收尾
    Settle,
    Nothing,
}

/// 收尾后的目标状态
enum Next {
    Completed,
    Paused,
    Cancelled,
    Error(String),
}

/// 创建目标文件并预分配到声明大小
async fn prepare_file(path: &Path, size: u64) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size).await?;
    debug!("已预分配文件: {:?} ({} bytes)", path, size);
    Ok(())
}
