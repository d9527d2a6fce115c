//! 安装编排器
//!
//! 一份清单对应一个安装批次：每个资源包一个下载任务，
//! 所有任务共享一个全局并发上限（与任务内的分段并发相互独立），
//! 批次内所有任务结束后解压已完成的资源包。
//!
//! 每个批次在磁盘上有一份批次记录，重启后据此重建批次，
//! 已完成但尚未解压的资源包不会丢失。

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::controller::{ControllerContext, InstallInfo, TaskController};
use super::extract::{ArchiveExtractor, ZipExtractor};
use super::fetcher::SegmentFetcher;
use super::task::{DownloadTask, TaskStatus};
use crate::config::{AppConfig, DownloadConfig};
use crate::error::{EngineError, ExtractError};
use crate::events::{EventSubscriber, InstallBus, InstallEvent, ProgressBus, ProgressEvent};
use crate::manifest::Manifest;
use crate::persistence::{InstallPackRecord, InstallRecord, ResumeStore};

/// 安装批次
#[derive(Debug)]
struct InstallGroup {
    info: Arc<InstallInfo>,
    /// 按清单顺序排列的 (task_id, 资源包路径)
    packs: Vec<(String, PathBuf)>,
    /// 不在任务列表中的任务最后状态（已移除，或重启前已完成）
    outcomes: HashMap<String, TaskStatus>,
    /// 已解压的任务
    extracted: HashSet<String>,
    /// 正在解压，防止重复触发
    extracting: bool,
    /// 已发布安装完成事件
    finished: bool,
}

impl InstallGroup {
    fn new(info: Arc<InstallInfo>) -> Self {
        Self {
            info,
            packs: Vec::new(),
            outcomes: HashMap::new(),
            extracted: HashSet::new(),
            extracting: false,
            finished: false,
        }
    }
}

/// 安装编排器
#[derive(Clone)]
pub struct InstallOrchestrator {
    config: Arc<DownloadConfig>,
    ctx: ControllerContext,
    install_bus: InstallBus,
    extractor: Arc<dyn ArchiveExtractor>,
    /// 所有任务（task_id -> 控制器）
    tasks: Arc<RwLock<HashMap<String, Arc<TaskController>>>>,
    /// 安装批次（install_id -> 批次）
    installs: Arc<RwLock<HashMap<String, Arc<Mutex<InstallGroup>>>>>,
    /// 等待全局名额的任务
    waiting_queue: Arc<Mutex<VecDeque<String>>>,
    /// 正在传输的任务数，只在等待队列锁内增加
    active_count: Arc<AtomicUsize>,
}

impl InstallOrchestrator {
    /// 使用 ZIP 解压器创建编排器
    pub fn new(config: &AppConfig) -> Result<Self, EngineError> {
        let extractor = Arc::new(ZipExtractor::new(
            config.download.remove_archive_after_extract,
        ));
        Self::with_extractor(config, extractor)
    }

    /// 使用自定义解压器创建编排器
    pub fn with_extractor(
        config: &AppConfig,
        extractor: Arc<dyn ArchiveExtractor>,
    ) -> Result<Self, EngineError> {
        config
            .download
            .validate()
            .map_err(EngineError::InvalidConfig)?;

        let download = Arc::new(config.download.clone());
        let client = download.build_client()?;
        let ctx = ControllerContext {
            fetcher: SegmentFetcher::new(client, download.stall_timeout()),
            store: ResumeStore::new(&config.persistence.resume_dir),
            bus: ProgressBus::new(download.event_buffer),
            config: download.clone(),
            persist_interval: Duration::from_millis(config.persistence.persist_interval_ms),
        };

        info!(
            "安装编排器已创建: 最大同时下载 {} 个资源包, 每个资源包 {} 个分段, 续传目录 {:?}",
            download.max_concurrent_tasks, download.segment_concurrency, config.persistence.resume_dir
        );

        Ok(Self {
            install_bus: InstallBus::new(download.event_buffer),
            config: download,
            ctx,
            extractor,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            installs: Arc::new(RwLock::new(HashMap::new())),
            waiting_queue: Arc::new(Mutex::new(VecDeque::new())),
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    // ========================================================================
    // 安装
    // ========================================================================

    /// 开始安装
    ///
    /// 先校验整个清单，任何条目不合法都不会创建任务。
    /// 立即返回任务 ID 列表，进度通过进度总线推送。
    pub fn start_install(
        &self,
        manifest: &Manifest,
        dest_dir: impl AsRef<Path>,
    ) -> Result<Vec<String>, EngineError> {
        manifest.validate()?;

        let info = Arc::new(InstallInfo {
            install_id: Uuid::new_v4().to_string(),
            game_id: manifest.game_id.clone(),
            version: manifest.version.clone(),
            dest_dir: dest_dir.as_ref().to_path_buf(),
        });
        let mut group = InstallGroup::new(info.clone());
        let mut controllers = Vec::with_capacity(manifest.packs.len());

        for pack in &manifest.packs {
            let ctrl = TaskController::new(Arc::new(pack.clone()), info.clone(), self.ctx.clone());
            group.packs.push((ctrl.id(), ctrl.dest_path()));
            controllers.push(ctrl);
        }

        let task_ids: Vec<String> = group.packs.iter().map(|(id, _)| id.clone()).collect();

        let record = InstallRecord {
            install_id: info.install_id.clone(),
            game_id: info.game_id.clone(),
            version: info.version.clone(),
            dest_dir: info.dest_dir.clone(),
            packs: group
                .packs
                .iter()
                .map(|(task_id, path)| InstallPackRecord {
                    task_id: task_id.clone(),
                    archive_path: path.clone(),
                })
                .collect(),
            completed: Vec::new(),
            extracted: Vec::new(),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.ctx.store.save_install(&record) {
            warn!("保存安装批次记录失败: install_id={}, 错误: {}", info.install_id, e);
        }

        self.installs
            .write()
            .insert(info.install_id.clone(), Arc::new(Mutex::new(group)));
        {
            let mut tasks = self.tasks.write();
            for ctrl in &controllers {
                tasks.insert(ctrl.id(), ctrl.clone());
            }
        }
        for ctrl in &controllers {
            ctrl.publish_now();
        }
        self.waiting_queue.lock().extend(task_ids.iter().cloned());

        info!(
            "开始安装: game_id={}, version={}, install_id={}, {} 个资源包共 {} bytes -> {:?}",
            info.game_id,
            info.version,
            info.install_id,
            task_ids.len(),
            manifest.packs_size(),
            info.dest_dir
        );

        self.try_start_waiting();
        Ok(task_ids)
    }

    /// 从等待队列中启动任务，直到达到全局并发上限
    fn try_start_waiting(&self) {
        let ceiling = self.config.max_concurrent_tasks;
        loop {
            let ctrl = {
                let mut queue = self.waiting_queue.lock();
                loop {
                    if self.active_count.load(Ordering::SeqCst) >= ceiling {
                        return;
                    }
                    let Some(task_id) = queue.pop_front() else {
                        return;
                    };
                    let ctrl = self.tasks.read().get(&task_id).cloned();
                    match ctrl {
                        Some(ctrl) if ctrl.status() == TaskStatus::Pending => {
                            self.active_count.fetch_add(1, Ordering::SeqCst);
                            break ctrl;
                        }
                        // 排队期间被暂停或取消
                        _ => debug!("跳过不可启动的排队任务: {}", task_id),
                    }
                }
            };
            self.launch(ctrl);
        }
    }

    fn launch(&self, ctrl: Arc<TaskController>) {
        let this = self.clone();
        tokio::spawn(async move {
            ctrl.clone().run().await;
            this.active_count.fetch_sub(1, Ordering::SeqCst);
            // 先让出名额，再处理解压
            this.try_start_waiting();
            this.check_install(&ctrl.install().install_id).await;
        });
    }

    // ========================================================================
    // 任务控制
    // ========================================================================

    /// 暂停任务（已暂停或已结束的任务为空操作）
    pub async fn pause(&self, task_id: &str) -> Result<(), EngineError> {
        match self.get_controller(task_id) {
            Some(ctrl) => {
                ctrl.pause().await;
                Ok(())
            }
            // 仅存在于磁盘上的记录本就是暂停状态
            None if self.ctx.store.exists(task_id) => Ok(()),
            None => Err(EngineError::TaskNotFound(task_id.to_string())),
        }
    }

    /// 恢复任务
    ///
    /// 暂停或失败的任务重新排队，复用续传记录；失败任务即以此方式重试。
    /// 运行中或已完成的任务为空操作。
    pub async fn resume(&self, task_id: &str) -> Result<(), EngineError> {
        let ctrl = match self.get_controller(task_id) {
            Some(ctrl) => ctrl,
            None => self.restore_one(task_id).await?,
        };

        if !ctrl.prepare_resume() {
            debug!("任务 {} 当前状态 {:?}，无需恢复", task_id, ctrl.status());
            return Ok(());
        }

        {
            let mut queue = self.waiting_queue.lock();
            if !queue.iter().any(|id| id == task_id) {
                queue.push_back(task_id.to_string());
            }
        }
        info!("恢复下载任务: {}", task_id);
        self.try_start_waiting();
        Ok(())
    }

    /// 取消任务
    ///
    /// 中止传输、删除部分文件与续传记录并从任务列表移除；
    /// 已完成的任务只从列表移除，不删除文件。重复调用为空操作。
    pub async fn cancel(&self, task_id: &str) -> Result<(), EngineError> {
        let Some(ctrl) = self.get_controller(task_id) else {
            self.purge_record(task_id);
            return Ok(());
        };

        // 运行中的任务结束后由启动它的协程检查安装批次
        let was_running = ctrl.is_running();
        let status = if ctrl.status() == TaskStatus::Completed {
            TaskStatus::Completed
        } else {
            ctrl.cancel().await;
            TaskStatus::Cancelled
        };

        self.evict(&ctrl, status);
        self.waiting_queue.lock().retain(|id| id != task_id);
        info!("任务 {} 已从任务列表移除 ({:?})", task_id, status);

        if status == TaskStatus::Cancelled && !was_running {
            self.check_install(&ctrl.install().install_id).await;
        }
        Ok(())
    }

    /// 暂停所有任务（退出前调用，保证续传记录落盘）
    pub async fn pause_all(&self) {
        self.waiting_queue.lock().clear();
        let controllers: Vec<_> = self.tasks.read().values().cloned().collect();
        futures::future::join_all(controllers.iter().map(|c| c.pause())).await;
        info!("已暂停所有任务 ({} 个)", controllers.len());
    }

    /// 清除已完成的任务，返回清除数量
    pub fn clear_completed(&self) -> usize {
        let completed: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|c| c.status() == TaskStatus::Completed)
            .cloned()
            .collect();

        for ctrl in &completed {
            self.evict(ctrl, TaskStatus::Completed);
        }
        info!("清除了 {} 个已完成的任务", completed.len());
        completed.len()
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 所有任务快照
    ///
    /// 包含内存中的任务以及仅存在于续传记录中的任务（显示为暂停）
    pub fn list_tasks(&self) -> Vec<DownloadTask> {
        let mut list: Vec<DownloadTask> =
            self.tasks.read().values().map(|c| c.snapshot()).collect();

        match self.ctx.store.scan_all() {
            Ok(states) => {
                let known: HashSet<String> = list.iter().map(|t| t.id.clone()).collect();
                list.extend(
                    states
                        .iter()
                        .filter(|s| !known.contains(&s.task_id))
                        .map(DownloadTask::from_resume_state),
                );
            }
            Err(e) => warn!("扫描续传记录失败: {}", e),
        }

        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        list
    }

    pub fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.get_controller(task_id).map(|c| c.snapshot())
    }

    /// 正在传输的任务数
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn subscribe_progress(&self) -> EventSubscriber<ProgressEvent> {
        self.ctx.bus.subscribe()
    }

    pub fn subscribe_installs(&self) -> EventSubscriber<InstallEvent> {
        self.install_bus.subscribe()
    }

    // ========================================================================
    // 重启恢复
    // ========================================================================

    /// 从续传记录与批次记录恢复
    ///
    /// 恢复的任务为暂停状态（上次失败的为失败状态），需要用户显式恢复；
    /// 批次中已完成但尚未解压的资源包在批次其余任务结束后解压
    pub async fn restore(&self) -> Result<Vec<String>, EngineError> {
        let (mut states, records) = self
            .ctx
            .store
            .spawn_blocking(|store| Ok((store.scan_all()?, store.scan_installs()?)))
            .await?;
        states.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.filename.cmp(&b.filename))
        });

        let mut groups = Vec::new();
        for record in &records {
            if self.register_install_record(record) {
                groups.push(record.install_id.clone());
            }
        }

        let mut restored = Vec::new();
        for state in &states {
            if self.tasks.read().contains_key(&state.task_id) {
                continue;
            }
            let ctrl = TaskController::from_resume_state(state, self.ctx.clone());
            self.register_restored(&ctrl);
            restored.push(state.task_id.clone());
        }

        if !restored.is_empty() || !groups.is_empty() {
            info!(
                "从续传记录恢复了 {} 个任务, {} 个安装批次",
                restored.len(),
                groups.len()
            );
        }

        for install_id in &groups {
            self.check_install(install_id).await;
        }
        Ok(restored)
    }

    /// 恢复仅存在于磁盘上的任务（连同其所在批次）
    async fn restore_one(&self, task_id: &str) -> Result<Arc<TaskController>, EngineError> {
        if !self.ctx.store.exists(task_id) {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        }
        self.restore().await?;
        self.get_controller(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// 按批次记录重建批次；批次已在内存中时返回 false
    fn register_install_record(&self, record: &InstallRecord) -> bool {
        let mut installs = self.installs.write();
        if installs.contains_key(&record.install_id) {
            return false;
        }

        let info = Arc::new(InstallInfo {
            install_id: record.install_id.clone(),
            game_id: record.game_id.clone(),
            version: record.version.clone(),
            dest_dir: record.dest_dir.clone(),
        });
        let mut group = InstallGroup::new(info);
        for pack in &record.packs {
            group.packs.push((pack.task_id.clone(), pack.archive_path.clone()));
            if record.is_completed(&pack.task_id) {
                group.outcomes.insert(pack.task_id.clone(), TaskStatus::Completed);
            }
            if record.is_extracted(&pack.task_id) {
                group.extracted.insert(pack.task_id.clone());
            }
        }

        debug!(
            "恢复安装批次: install_id={}, {} 个资源包, 已完成 {}, 已解压 {}",
            record.install_id,
            record.packs.len(),
            record.completed.len(),
            record.extracted.len()
        );
        installs.insert(record.install_id.clone(), Arc::new(Mutex::new(group)));
        true
    }

    fn register_restored(&self, ctrl: &Arc<TaskController>) {
        let info = ctrl.install().clone();
        let group = self
            .installs
            .write()
            .entry(info.install_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(InstallGroup::new(info))))
            .clone();
        {
            let mut g = group.lock();
            let id = ctrl.id();
            if !g.packs.iter().any(|(task_id, _)| *task_id == id) {
                g.packs.push((id, ctrl.dest_path()));
            }
        }
        self.tasks.write().insert(ctrl.id(), ctrl.clone());
    }

    // ========================================================================
    // 解压
    // ========================================================================

    /// 重新解压安装批次中已完成但尚未解压的资源包（无需重新下载）
    pub async fn extract_install(&self, install_id: &str) -> Result<(), EngineError> {
        if !self.installs.read().contains_key(install_id) {
            if !self.ctx.store.install_path_for(install_id).exists() {
                return Err(EngineError::TaskNotFound(install_id.to_string()));
            }
            self.restore().await?;
        }
        self.check_install(install_id).await;
        Ok(())
    }

    /// 批次内所有任务结束后解压并发布结果
    ///
    /// 失败的资源包不解压；已解压的资源包不回滚
    async fn check_install(&self, install_id: &str) {
        let Some(group) = self.installs.read().get(install_id).cloned() else {
            return;
        };

        let (info, to_extract, mut failed, total) = {
            let mut g = group.lock();
            if g.extracting || g.finished {
                return;
            }

            let mut to_extract = Vec::new();
            let mut failed = Vec::new();
            for (index, (task_id, path)) in g.packs.iter().enumerate() {
                let status = self.pack_status(&g, task_id);
                if !status.is_terminal() {
                    // 仍有任务未结束
                    return;
                }
                if status != TaskStatus::Completed {
                    failed.push(task_id.clone());
                } else if !g.extracted.contains(task_id) {
                    to_extract.push((index + 1, task_id.clone(), path.clone()));
                }
            }

            g.extracting = true;
            (g.info.clone(), to_extract, failed, g.packs.len())
        };

        for (pack_index, task_id, path) in to_extract {
            let result = self.extract_one(&path, &info.dest_dir).await;
            let error = match result {
                Ok(()) => {
                    group.lock().extracted.insert(task_id.clone());
                    self.update_install_record(&info.install_id, &task_id).await;
                    None
                }
                Err(e) => {
                    error!("✗ 解压失败: {:?}, 错误: {}", path, e);
                    failed.push(task_id.clone());
                    Some(e.to_string())
                }
            };
            self.install_bus.publish(InstallEvent::ExtractProgress {
                install_id: info.install_id.clone(),
                game_id: info.game_id.clone(),
                task_id,
                pack_index,
                total_packs: total,
                error,
            });
        }

        // 失败的资源包都已取消时批次无法再完成，记录随之删除
        let retryable = {
            let g = group.lock();
            failed
                .iter()
                .any(|task_id| self.pack_status(&g, task_id) != TaskStatus::Cancelled)
        };
        if !retryable {
            self.remove_install_record(&info.install_id).await;
        }

        let mut g = group.lock();
        g.extracting = false;
        if failed.is_empty() {
            g.finished = true;
            info!(
                "✓ 安装完成: game_id={}, version={}, install_id={}",
                info.game_id, info.version, info.install_id
            );
            self.install_bus.publish(InstallEvent::Completed {
                install_id: info.install_id.clone(),
                game_id: info.game_id.clone(),
                version: info.version.clone(),
            });
        } else {
            warn!(
                "安装部分失败: install_id={}, 失败 {} / {} 个资源包",
                info.install_id,
                failed.len(),
                total
            );
            self.install_bus.publish(InstallEvent::PartialFailure {
                install_id: info.install_id.clone(),
                game_id: info.game_id.clone(),
                failed_task_ids: failed,
            });
        }
    }

    async fn extract_one(&self, archive: &Path, dest_dir: &Path) -> Result<(), ExtractError> {
        let extractor = self.extractor.clone();
        let archive = archive.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();
        info!("开始解压: {:?} -> {:?}", archive, dest_dir);

        tokio::task::spawn_blocking(move || extractor.extract(&archive, &dest_dir))
            .await
            .map_err(|e| {
                ExtractError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("解压任务执行失败: {}", e),
                ))
            })?
    }

    // ========================================================================
    // 内部工具
    // ========================================================================

    fn get_controller(&self, task_id: &str) -> Option<Arc<TaskController>> {
        self.tasks.read().get(task_id).cloned()
    }

    /// 批次中资源包的当前状态；不在任务列表中的取其最后状态
    fn pack_status(&self, group: &InstallGroup, task_id: &str) -> TaskStatus {
        match self.get_controller(task_id) {
            Some(ctrl) => ctrl.status(),
            None => group
                .outcomes
                .get(task_id)
                .copied()
                .unwrap_or(TaskStatus::Cancelled),
        }
    }

    async fn update_install_record(&self, install_id: &str, task_id: &str) {
        let (install, task) = (install_id.to_string(), task_id.to_string());
        let result = self
            .ctx
            .store
            .spawn_blocking(move |store| store.mark_pack_extracted(&install, &task))
            .await;
        if let Err(e) = result {
            warn!("更新安装批次记录失败: install_id={}, 错误: {}", install_id, e);
        }
    }

    async fn remove_install_record(&self, install_id: &str) {
        let install = install_id.to_string();
        let result = self
            .ctx
            .store
            .spawn_blocking(move |store| store.delete_install(&install))
            .await;
        if let Err(e) = result {
            warn!("删除安装批次记录失败: install_id={}, 错误: {}", install_id, e);
        }
    }

    /// 从任务列表移除，并在批次中记下最后状态
    fn evict(&self, ctrl: &Arc<TaskController>, status: TaskStatus) {
        let id = ctrl.id();
        self.tasks.write().remove(&id);
        if let Some(group) = self.installs.read().get(&ctrl.install().install_id) {
            group.lock().outcomes.insert(id, status);
        }
    }

    /// 删除仅存在于磁盘上的续传记录及其部分文件
    fn purge_record(&self, task_id: &str) {
        match self.ctx.store.load(task_id) {
            Ok(Some(state)) => {
                if let Err(e) = std::fs::remove_file(&state.destination_path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("删除文件失败: {:?}, 错误: {}", state.destination_path, e);
                    }
                }
                if let Err(e) = self.ctx.store.delete(task_id) {
                    warn!("删除续传记录失败: task_id={}, 错误: {}", task_id, e);
                }
                info!("已删除磁盘上的续传任务: {}", task_id);
            }
            Ok(None) => {}
            Err(e) => warn!("读取续传记录失败: task_id={}, 错误: {}", task_id, e),
        }
    }
}
