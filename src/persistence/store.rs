//! 续传记录存储
//!
//! 每个任务一个 JSON 文件：`{resume_dir}/{task_id}.resume`；
//! 每个安装批次一个 JSON 文件：`{resume_dir}/{install_id}.install`。
//! 写入先落临时文件再原子重命名，中途崩溃不会留下半个记录。
//!
//! 所有方法都是同步文件操作，异步代码经 [`ResumeStore::spawn_blocking`] 调用。

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::types::{InstallRecord, ResumeState};

/// 续传记录扩展名
const RESUME_EXTENSION: &str = "resume";
/// 安装批次记录扩展名
const INSTALL_EXTENSION: &str = "install";

/// 续传记录存储
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
    /// 串行化批次记录的读-改-写
    install_lock: Arc<Mutex<()>>,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            install_lock: Arc::new(Mutex::new(())),
        }
    }

    /// 在阻塞线程池上执行存储操作
    pub async fn spawn_blocking<R, F>(&self, f: F) -> io::Result<R>
    where
        F: FnOnce(&ResumeStore) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("存储任务执行失败: {}", e)))?
    }

    /// 记录文件路径：`{dir}/{task_id}.resume`
    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", task_id, RESUME_EXTENSION))
    }

    /// 批次记录路径：`{dir}/{install_id}.install`
    pub fn install_path_for(&self, install_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", install_id, INSTALL_EXTENSION))
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.path_for(task_id).exists()
    }

    // ========================================================================
    // 续传记录
    // ========================================================================

    /// 保存续传记录
    pub fn save(&self, state: &ResumeState) -> io::Result<()> {
        self.write_json(&self.path_for(&state.task_id), state)?;
        debug!(
            "已保存续传记录: task_id={}, 已写入 {}/{} bytes",
            state.task_id,
            state.written_bytes(),
            state.declared_size
        );
        Ok(())
    }

    /// 加载续传记录
    ///
    /// - `Ok(None)`: 记录不存在或已损坏（损坏时记录警告）
    pub fn load(&self, task_id: &str) -> io::Result<Option<ResumeState>> {
        Self::load_optional(&self.path_for(task_id))
    }

    /// 删除续传记录
    ///
    /// 返回是否确实删除了文件
    pub fn delete(&self, task_id: &str) -> io::Result<bool> {
        Self::remove(&self.path_for(task_id))
    }

    /// 扫描所有续传记录（跳过无法解析的文件）
    pub fn scan_all(&self) -> io::Result<Vec<ResumeState>> {
        self.scan(RESUME_EXTENSION)
    }

    // ========================================================================
    // 安装批次记录
    // ========================================================================

    pub fn save_install(&self, record: &InstallRecord) -> io::Result<()> {
        let _guard = self.install_lock.lock();
        self.write_json(&self.install_path_for(&record.install_id), record)?;
        debug!("已保存安装批次记录: install_id={}", record.install_id);
        Ok(())
    }

    pub fn load_install(&self, install_id: &str) -> io::Result<Option<InstallRecord>> {
        Self::load_optional(&self.install_path_for(install_id))
    }

    pub fn delete_install(&self, install_id: &str) -> io::Result<bool> {
        let _guard = self.install_lock.lock();
        Self::remove(&self.install_path_for(install_id))
    }

    pub fn scan_installs(&self) -> io::Result<Vec<InstallRecord>> {
        self.scan(INSTALL_EXTENSION)
    }

    /// 修改批次记录并写回；记录不存在时返回 `Ok(false)`
    pub fn update_install<F>(&self, install_id: &str, f: F) -> io::Result<bool>
    where
        F: FnOnce(&mut InstallRecord),
    {
        let _guard = self.install_lock.lock();
        let path = self.install_path_for(install_id);
        let Some(mut record) = Self::load_optional::<InstallRecord>(&path)? else {
            return Ok(false);
        };
        f(&mut record);
        self.write_json(&path, &record)?;
        Ok(true)
    }

    /// 标记资源包已下载并校验通过
    pub fn mark_pack_completed(&self, install_id: &str, task_id: &str) -> io::Result<bool> {
        self.update_install(install_id, |record| {
            if !record.is_completed(task_id) {
                record.completed.push(task_id.to_string());
            }
        })
    }

    /// 标记资源包已解压
    pub fn mark_pack_extracted(&self, install_id: &str, task_id: &str) -> io::Result<bool> {
        self.update_install(install_id, |record| {
            if !record.is_extracted(task_id) {
                record.extracted.push(task_id.to_string());
            }
        })
    }

    // ========================================================================
    // 文件读写
    // ========================================================================

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let temp_path = Self::temp_path(path);
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize record: {}", e),
            )
        })?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, path)
    }

    fn load_optional<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }

        match Self::load_from_path(path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("记录已损坏，忽略 {:?}: {}", path, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn load_from_path<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse record: {}", e),
            )
        })
    }

    fn remove(path: &Path) -> io::Result<bool> {
        let temp_path = Self::temp_path(path);
        if temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }

        match fs::remove_file(path) {
            Ok(()) => {
                debug!("已删除记录: {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `a.resume` -> `a.resume.tmp`
    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn scan<T: DeserializeOwned>(&self, extension: &str) -> io::Result<Vec<T>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut skipped = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != extension) {
                continue;
            }

            match Self::load_from_path(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("跳过无效记录 {:?}: {}", path, e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!("扫描 .{} 记录完成，跳过 {} 个无效文件", extension, skipped);
        }
        debug!("扫描到 {} 条 .{} 记录", records.len(), extension);

        Ok(records)
    }
}
