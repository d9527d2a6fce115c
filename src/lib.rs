// 游戏资源包下载与安装引擎

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 安装清单
pub mod manifest;

// 进度 / 安装事件总线
pub mod events;

// 下载引擎模块
pub mod downloader;

// 断点续传持久化
pub mod persistence;

// 导出常用类型
pub use config::{AppConfig, DownloadConfig};
pub use downloader::{DownloadTask, InstallOrchestrator, TaskStatus};
pub use error::{EngineError, ExtractError, TransferError};
pub use events::{InstallEvent, ProgressEvent};
pub use manifest::{Manifest, ManifestSource, Pack};
