use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::manifest::Pack;
use crate::persistence::ResumeState;

/// 下载任务状态
///
/// ```text
/// Pending → Downloading ⇄ Paused → Verifying → Completed
///               ↓                      ↓
///             Error ←──────────────────┘
/// 任意非终态 → Cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待中（包括排队等待全局并发名额）
    Pending,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 校验中
    Verifying,
    /// 已完成
    Completed,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 不会再自行变化的状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// 下载任务
///
/// 由所属的任务控制器独占修改，外部只读快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 所属安装批次ID
    pub install_id: String,
    pub game_id: String,
    /// 资源包文件名
    pub name: String,
    /// 下载地址
    pub url: String,
    /// 本地保存路径
    pub dest_path: PathBuf,
    /// 声明大小
    pub total_size: u64,
    /// 已下载大小（所有分段已写入字节之和）
    pub downloaded_size: u64,
    /// 下载速度 (bytes/s)
    pub speed: u64,
    pub status: TaskStatus,
    /// 最近一次错误信息
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl DownloadTask {
    pub fn new(install_id: &str, game_id: &str, pack: &Pack, dest_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            install_id: install_id.to_string(),
            game_id: game_id.to_string(),
            name: pack.filename.clone(),
            url: pack.url.clone(),
            dest_path,
            total_size: pack.size,
            downloaded_size: 0,
            speed: 0,
            status: TaskStatus::Pending,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 从续传记录重建任务
    ///
    /// 重启后不会自动开始：记录中有失败原因的为失败状态，其余为暂停状态
    pub fn from_resume_state(state: &ResumeState) -> Self {
        let status = if state.last_error.is_some() {
            TaskStatus::Error
        } else {
            TaskStatus::Paused
        };

        Self {
            id: state.task_id.clone(),
            install_id: state.install_id.clone(),
            game_id: state.game_id.clone(),
            name: state.filename.clone(),
            url: state.url.clone(),
            dest_path: state.destination_path.clone(),
            total_size: state.declared_size,
            downloaded_size: state.written_bytes(),
            speed: 0,
            status,
            error: state.last_error.clone(),
            created_at: state.created_at.timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 计算进度百分比（限制在 0-100）
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        ((self.downloaded_size as f64 / self.total_size as f64) * 100.0).clamp(0.0, 100.0)
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.downloaded_size >= self.total_size {
            return None;
        }
        let remaining = self.total_size - self.downloaded_size;
        Some(remaining / self.speed)
    }

    /// 更新已下载大小（下载期间只增不减）
    pub fn update_progress(&mut self, downloaded: u64, speed: u64) {
        self.downloaded_size = self.downloaded_size.max(downloaded.min(self.total_size));
        self.speed = speed;
    }

    /// 续传时以持久化记录为准重置已下载大小
    pub fn reset_progress(&mut self, downloaded: u64) {
        self.downloaded_size = downloaded.min(self.total_size);
        self.speed = 0;
    }

    pub fn mark_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.error = None;
        self.speed = 0;
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    pub fn mark_verifying(&mut self) {
        self.status = TaskStatus::Verifying;
        self.speed = 0;
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.downloaded_size = self.total_size;
        self.speed = 0;
    }

    /// 标记为失败
    pub fn mark_error(&mut self, error: String) {
        self.status = TaskStatus::Error;
        self.error = Some(error);
        self.speed = 0;
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
        self.speed = 0;
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.speed = 0;
    }
}
