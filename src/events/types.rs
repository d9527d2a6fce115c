//! 事件类型定义

use crate::downloader::{DownloadTask, TaskStatus};
use serde::{Deserialize, Serialize};

/// 任务进度事件
///
/// 进度总线上唯一的消息类型；订阅方按 `task_id` 归并，
/// 只保证最终状态一致，不保证每次进度都送达
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub downloaded_size: u64,
    pub total_size: u64,
    /// 0.0 - 100.0
    pub progress: f64,
    /// 字节/秒
    pub speed: u64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            task_id: task.id.clone(),
            downloaded_size: task.downloaded_size,
            total_size: task.total_size,
            progress: task.progress(),
            speed: task.speed,
            status: task.status,
            error: task.error.clone(),
        }
    }
}

/// 安装事件（解压与整体结果）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum InstallEvent {
    /// 单个资源包解压完成（或失败）
    ExtractProgress {
        install_id: String,
        game_id: String,
        task_id: String,
        /// 从 1 开始
        pack_index: usize,
        total_packs: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 所有资源包下载、校验、解压均成功
    Completed {
        install_id: String,
        game_id: String,
        version: String,
    },
    /// 部分资源包失败；已解压的资源包不会回滚
    PartialFailure {
        install_id: String,
        game_id: String,
        failed_task_ids: Vec<String>,
    },
}

impl InstallEvent {
    pub fn install_id(&self) -> &str {
        match self {
            InstallEvent::ExtractProgress { install_id, .. }
            | InstallEvent::Completed { install_id, .. }
            | InstallEvent::PartialFailure { install_id, .. } => install_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_event_tagging() {
        let event = InstallEvent::Completed {
            install_id: "i1".to_string(),
            game_id: "1".to_string(),
            version: "2.0.1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "completed");
        assert_eq!(event.install_id(), "i1");
    }

    #[test]
    fn test_progress_event_omits_empty_error() {
        let event = ProgressEvent {
            task_id: "t".to_string(),
            downloaded_size: 5,
            total_size: 10,
            progress: 50.0,
            speed: 0,
            status: TaskStatus::Downloading,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains("\"status\":\"downloading\""));
    }
}
