// 配置管理模块

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 断点续传持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
///
/// 两层并发相互独立：
/// - `max_concurrent_tasks`: 同时传输的资源包数量（全局上限）
/// - `segment_concurrency`: 单个资源包内部的分段并发数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 最大同时下载资源包数
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 单个任务的分段并发数
    #[serde(default = "default_segment_concurrency")]
    pub segment_concurrency: usize,
    /// 最小分段大小（字节），避免小文件被切得过碎
    #[serde(default = "default_min_segment_size")]
    pub min_segment_size: u64,
    /// 分段网络错误最大重试次数
    #[serde(default = "default_segment_max_retries")]
    pub segment_max_retries: u32,
    /// 分段长度不匹配时的重试次数
    #[serde(default = "default_short_read_retries")]
    pub short_read_retries: u32,
    /// 重试退避基准（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 重试退避上限（毫秒）
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// 任务级重试次数（分段重试耗尽后，从持久化状态重新规划）
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,
    /// 停滞超时（秒）：超过该时间未收到任何数据视为网络错误
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 进度事件最小间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 事件总线缓冲区大小（超出后丢弃最旧事件）
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 代理地址（http/https/socks5）
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// 解压成功后是否删除压缩包
    #[serde(default = "default_remove_archive")]
    pub remove_archive_after_extract: bool,
}

fn default_max_concurrent_tasks() -> usize {
    3
}
fn default_segment_concurrency() -> usize {
    8
}
fn default_min_segment_size() -> u64 {
    4 * 1024 * 1024
}
fn default_segment_max_retries() -> u32 {
    3
}
fn default_short_read_retries() -> u32 {
    1
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    8000
}
fn default_task_max_retries() -> u32 {
    1
}
fn default_stall_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_progress_interval_ms() -> u64 {
    250
}
fn default_event_buffer() -> usize {
    256
}
fn default_user_agent() -> String {
    format!("pack-installer/{}", env!("CARGO_PKG_VERSION"))
}
fn default_remove_archive() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            segment_concurrency: default_segment_concurrency(),
            min_segment_size: default_min_segment_size(),
            segment_max_retries: default_segment_max_retries(),
            short_read_retries: default_short_read_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            task_max_retries: default_task_max_retries(),
            stall_timeout_secs: default_stall_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            event_buffer: default_event_buffer(),
            user_agent: default_user_agent(),
            proxy_url: None,
            remove_archive_after_extract: default_remove_archive(),
        }
    }
}

impl DownloadConfig {
    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_tasks == 0 {
            return Err("最大同时下载数必须大于 0".to_string());
        }
        if self.segment_concurrency == 0 {
            return Err("分段并发数必须大于 0".to_string());
        }
        if self.min_segment_size == 0 {
            return Err("最小分段大小必须大于 0".to_string());
        }
        if self.progress_interval_ms == 0 {
            return Err("进度事件间隔必须大于 0".to_string());
        }
        if self.event_buffer == 0 {
            return Err("事件缓冲区大小必须大于 0".to_string());
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// 创建用于下载的 HTTP 客户端
    ///
    /// 不设置整体超时：大分段可能持续数分钟，停滞检测由分段下载器负责
    pub fn build_client(&self) -> reqwest::Result<Client> {
        let mut builder = Client::builder()
            .user_agent(self.user_agent.as_str())
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_max_idle_per_host(self.segment_concurrency * self.max_concurrent_tasks)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = self.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        builder.build()
    }
}

/// 断点续传持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 续传记录目录
    #[serde(default = "default_resume_dir")]
    pub resume_dir: PathBuf,
    /// 续传记录最小写入间隔（毫秒），暂停/取消/失败时总是立即写入
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
}

fn default_resume_dir() -> PathBuf {
    PathBuf::from("resume")
}

fn default_persist_interval_ms() -> u64 {
    1000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            resume_dir: default_resume_dir(),
            persist_interval_ms: default_persist_interval_ms(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate()
            .map_err(anyhow::Error::msg)
            .context("配置文件中的下载配置不合法")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate()
            .map_err(anyhow::Error::msg)
            .context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }
                default_config
            }
        }
    }
}
