use anyhow::Context;
use bucketsync_lib::core::{
    BucketResolver, Operation, PhaseSummary, ProgressEvent, RunReport, StaticOutputs, SyncEngine,
    TargetSet,
};
use bucketsync_lib::logging::init_logging;
use bucketsync_lib::storage::{create_store, StoreSettings};
use bucketsync_lib::{AppConfig, DEFAULT_CONFIG_FILE};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "bucketsync", version, about = "把本地目录同步到对象存储桶")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, env = "BUCKETSYNC_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// 覆盖配置中的 stage
    #[arg(short, long, env = "BUCKETSYNC_STAGE")]
    stage: Option<String>,

    /// 只处理指定的存储桶（bucketName 或 bucketNameKey）
    #[arg(short, long)]
    bucket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// 上传新增或变化的文件，删除孤立对象
    Sync,
    /// 只按规则更新对象元数据
    Metadata,
    /// 合并存储桶标签
    Tags,
    /// 依次执行 sync、metadata、tags
    Deploy,
    /// 删除存储桶前缀下的所有对象
    Clear,
}

impl Command {
    /// 单阶段命令对应的操作；deploy 由引擎按目标串联多个阶段
    fn operation(self) -> Option<Operation> {
        match self {
            Command::Sync => Some(Operation::Sync),
            Command::Metadata => Some(Operation::Metadata),
            Command::Tags => Some(Operation::Tags),
            Command::Clear => Some(Operation::Clear),
            Command::Deploy => None,
        }
    }
}

/// 配置文件所在目录，相对路径都基于它
fn config_base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// 相对的 file:// 地址基于配置目录
fn resolve_endpoint(endpoint: Option<String>, base_dir: &Path) -> Option<String> {
    let endpoint = endpoint?;
    match endpoint.strip_prefix("file://") {
        Some(root) if !root.is_empty() && Path::new(root).is_relative() => {
            Some(format!("file://{}", base_dir.join(root).display()))
        }
        _ => Some(endpoint),
    }
}

fn log_report(report: &RunReport) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(PhaseSummary::Skipped) => info!("[{}] {}: 跳过", outcome.operation, outcome.target),
            Ok(summary) => info!("[{}] {}: 成功 {:?}", outcome.operation, outcome.target, summary),
            Err(e) => error!("[{}] {}: 失败 - {}", outcome.operation, outcome.target, e),
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("无法加载配置文件 {}", cli.config.display()))?;
    let base_dir = config_base_dir(&cli.config);

    init_logging(&config.log, &base_dir);

    if let Some(stage) = cli.stage {
        config.stage = stage;
    }
    info!(
        "bucketsync v{} - 配置 {}, stage = {}",
        env!("CARGO_PKG_VERSION"),
        cli.config.display(),
        config.stage
    );

    let targets = TargetSet::from_values(&config.targets, &base_dir);
    let store = create_store(&StoreSettings {
        endpoint: resolve_endpoint(config.endpoint.clone(), &base_dir),
        region: config.region.clone(),
    })
    .await
    .context("无法初始化对象存储")?;
    let resolver = Arc::new(BucketResolver::new(Arc::new(StaticOutputs::new(
        config.outputs.clone(),
    ))));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Progress {
                    target,
                    phase,
                    percent,
                } => info!("{} [{}] {}%", target, phase, percent),
                ProgressEvent::Finished {
                    target,
                    phase,
                    success,
                } => info!(
                    "{} [{}] {}",
                    target,
                    phase,
                    if success { "完成" } else { "失败" }
                ),
            }
        }
    });

    let engine = SyncEngine::new(store, resolver, config.stage.clone(), base_dir)
        .with_no_sync(config.no_sync)
        .with_progress(Some(tx));

    let bucket = cli.bucket.as_deref();
    let reports = match cli.command.operation() {
        Some(operation) => vec![engine.run(&targets, operation, bucket).await],
        None => engine.deploy(&targets, bucket).await,
    };
    reports.iter().for_each(log_report);
    let succeeded = reports.iter().all(RunReport::succeeded);

    drop(engine);
    let _ = progress_task.await;
    Ok(succeeded)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
