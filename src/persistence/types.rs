//! 续传记录类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::downloader::Segment;

/// 单个分段的持久化记录
///
/// `written_offset` 为分段内已写入的字节数（相对 `start`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub start: u64,
    pub end: u64,
    pub written_offset: u64,
}

impl From<&Segment> for SegmentRecord {
    fn from(segment: &Segment) -> Self {
        Self {
            start: segment.start,
            end: segment.end,
            written_offset: segment.written,
        }
    }
}

impl From<&SegmentRecord> for Segment {
    fn from(record: &SegmentRecord) -> Self {
        Segment {
            start: record.start,
            end: record.end,
            written: record.written_offset,
        }
    }
}

/// 任务续传记录
///
/// 以 task_id 为键，一个任务一个文件；
/// 校验成功或用户取消时删除。校验失败时保留为零进度并记下失败原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub task_id: String,
    /// 所属安装批次
    pub install_id: String,
    pub game_id: String,
    #[serde(default)]
    pub version: String,
    /// 资源包文件名
    pub filename: String,
    pub url: String,
    pub destination_path: PathBuf,
    /// 安装目录（解压目标）
    pub dest_dir: PathBuf,
    pub declared_size: u64,
    /// 期望 MD5
    pub digest: String,
    /// 最近一次失败原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub segments: Vec<SegmentRecord>,
}

impl ResumeState {
    /// 已写入字节数（所有分段之和）
    pub fn written_bytes(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.written_offset.min(s.end.saturating_sub(s.start)))
            .sum()
    }

    /// 还原分段布局
    pub fn to_segments(&self) -> Vec<Segment> {
        self.segments.iter().map(Segment::from).collect()
    }
}

/// 安装批次中的一个资源包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPackRecord {
    pub task_id: String,
    /// 下载完成后的压缩包路径
    pub archive_path: PathBuf,
}

/// 安装批次记录
///
/// 以 install_id 为键，批次创建时写入。资源包校验成功后其续传记录即被删除，
/// 重启后靠这份记录找回已完成但尚未解压的资源包。
/// 批次安装完成，或失败的资源包都已无法恢复时删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub install_id: String,
    pub game_id: String,
    #[serde(default)]
    pub version: String,
    pub dest_dir: PathBuf,
    /// 按清单顺序
    pub packs: Vec<InstallPackRecord>,
    /// 已下载并校验通过的任务
    #[serde(default)]
    pub completed: Vec<String>,
    /// 已解压的任务
    #[serde(default)]
    pub extracted: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl InstallRecord {
    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.iter().any(|id| id == task_id)
    }

    pub fn is_extracted(&self, task_id: &str) -> bool {
        self.extracted.iter().any(|id| id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_bytes_clamps_to_segment_length() {
        let state = ResumeState {
            task_id: "t".to_string(),
            install_id: "i".to_string(),
            game_id: "1".to_string(),
            version: String::new(),
            filename: "a.zip".to_string(),
            url: "https://x/a.zip".to_string(),
            destination_path: PathBuf::from("/tmp/a.zip"),
            dest_dir: PathBuf::from("/tmp"),
            declared_size: 100,
            digest: "0".repeat(32),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            segments: vec![
                SegmentRecord { start: 0, end: 50, written_offset: 20 },
                SegmentRecord { start: 50, end: 100, written_offset: 80 },
            ],
        };
        assert_eq!(state.written_bytes(), 70);
    }

    #[test]
    fn test_install_record_defaults() {
        let json = r#"{
            "install_id": "i",
            "game_id": "1",
            "dest_dir": "/games",
            "packs": [{"task_id": "a", "archive_path": "/games/a.zip"}],
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let record: InstallRecord = serde_json::from_str(json).unwrap();
        assert!(record.completed.is_empty());
        assert!(!record.is_completed("a"));
        assert!(!record.is_extracted("a"));
        assert_eq!(record.packs[0].archive_path, PathBuf::from("/games/a.zip"));
    }
}
