use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pack_installer::{
    logging, AppConfig, EngineError, InstallEvent, InstallOrchestrator, Manifest,
    ManifestSource, TaskStatus,
};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 游戏资源包下载安装工具
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 按清单下载并安装一个游戏
    Install {
        /// 清单所在目录，读取 `{manifest_dir}/{game_id}.json`
        manifest_dir: PathBuf,
        game_id: String,
        /// 安装目录
        dest_dir: PathBuf,
    },
    /// 恢复上次未完成的任务
    Resume,
    /// 列出所有任务
    List,
}

/// 从本地目录读取清单：`{dir}/{game_id}.json`
struct FileManifestSource {
    dir: PathBuf,
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn fetch_manifest(&self, game_id: &str) -> Result<Manifest, EngineError> {
        let path = self.dir.join(format!("{}.json", game_id));
        let content = tokio::fs::read_to_string(&path).await?;
        let manifest: Manifest = serde_json::from_str(&content).map_err(|e| {
            EngineError::invalid_entry(game_id, format!("清单解析失败 {:?}: {}", path, e))
        })?;
        Ok(manifest)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Pack Installer v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let orchestrator = InstallOrchestrator::new(&config)?;

    match cli.command {
        Command::Install {
            manifest_dir,
            game_id,
            dest_dir,
        } => {
            let source = FileManifestSource { dir: manifest_dir };
            let manifest = source
                .fetch_manifest(&game_id)
                .await
                .context("获取清单失败")?;
            install(&orchestrator, &manifest, dest_dir).await
        }
        Command::Resume => resume_all(&orchestrator).await,
        Command::List => {
            list(&orchestrator);
            Ok(())
        }
    }
}

async fn install(
    orchestrator: &InstallOrchestrator,
    manifest: &Manifest,
    dest_dir: PathBuf,
) -> anyhow::Result<()> {
    // 先订阅，避免错过快速结束的安装
    let installs = orchestrator.subscribe_installs();
    let task_ids = orchestrator.start_install(manifest, &dest_dir)?;
    let install_ids: HashSet<String> = task_ids
        .iter()
        .filter_map(|id| orchestrator.get_task(id))
        .map(|t| t.install_id)
        .collect();

    wait_installs(orchestrator, installs, install_ids).await
}

async fn resume_all(orchestrator: &InstallOrchestrator) -> anyhow::Result<()> {
    let installs = orchestrator.subscribe_installs();
    let restored = orchestrator.restore().await?;
    if restored.is_empty() {
        info!("没有可恢复的任务");
        return Ok(());
    }

    let mut install_ids = HashSet::new();
    for task_id in &restored {
        if let Some(task) = orchestrator.get_task(task_id) {
            install_ids.insert(task.install_id);
        }
        orchestrator.resume(task_id).await?;
    }

    wait_installs(orchestrator, installs, install_ids).await
}

/// 等待所有安装批次结束；Ctrl+C 时暂停全部任务并退出
async fn wait_installs(
    orchestrator: &InstallOrchestrator,
    mut installs: pack_installer::events::EventSubscriber<InstallEvent>,
    mut pending: HashSet<String>,
) -> anyhow::Result<()> {
    let mut progress = orchestrator.subscribe_progress();
    let mut failed = false;

    while !pending.is_empty() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("收到退出信号，正在暂停所有任务...");
                orchestrator.pause_all().await;
                info!("续传记录已保存，下次使用 resume 继续");
                return Ok(());
            }
            event = progress.recv() => {
                if let Some(event) = event {
                    match event.status {
                        TaskStatus::Downloading => info!(
                            "[{}] {:.1}% ({}/{} bytes, {} B/s)",
                            event.task_id, event.progress, event.downloaded_size, event.total_size, event.speed
                        ),
                        TaskStatus::Error => warn!(
                            "[{}] 下载失败: {}",
                            event.task_id,
                            event.error.as_deref().unwrap_or("未知错误")
                        ),
                        status => info!("[{}] {:?}", event.task_id, status),
                    }
                }
            }
            event = installs.recv() => {
                let Some(event) = event else { break };
                match &event {
                    InstallEvent::ExtractProgress { pack_index, total_packs, error: None, .. } => {
                        info!("解压进度 {}/{}", pack_index, total_packs);
                    }
                    InstallEvent::ExtractProgress { task_id, error: Some(e), .. } => {
                        warn!("解压失败 [{}]: {}", task_id, e);
                    }
                    InstallEvent::Completed { game_id, version, .. } => {
                        info!("✓ 安装完成: game_id={}, version={}", game_id, version);
                    }
                    InstallEvent::PartialFailure { failed_task_ids, .. } => {
                        warn!("安装未完成，失败任务: {:?}", failed_task_ids);
                        failed = true;
                    }
                }
                if !matches!(event, InstallEvent::ExtractProgress { .. }) {
                    pending.remove(event.install_id());
                }
            }
        }
    }

    if failed {
        bail!("部分资源包安装失败，可使用 resume 重试");
    }
    Ok(())
}

fn list(orchestrator: &InstallOrchestrator) {
    let tasks = orchestrator.list_tasks();
    if tasks.is_empty() {
        println!("没有任务");
        return;
    }
    for task in tasks {
        println!(
            "{}  {:<10} {:>6.1}%  {}  {}",
            task.id,
            format!("{:?}", task.status),
            task.progress(),
            task.name,
            task.error.unwrap_or_default()
        );
    }
}
