//! 传输编排 - 对比、上传、删除孤立对象

use crate::core::comparator::plan_sync;
use crate::core::progress::{Phase, ProgressSender, ProgressTracker};
use crate::core::scanner::{scan_local_tree, LocalFile};
use crate::core::target::SyncTarget;
use crate::error::{Result, SyncError};
use crate::storage::{ObjectStore, PutRequest, DELETE_BATCH_SIZE};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// 每个目标同时进行的网络操作上限
pub const MAX_CONCURRENT_OPERATIONS: usize = 5;

/// 目标的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Idle,
    PreCommand,
    Diffing,
    Transferring,
    Deleting,
    Done,
    Failed,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetState::Idle => "idle",
            TargetState::PreCommand => "pre-command",
            TargetState::Diffing => "diffing",
            TargetState::Transferring => "transferring",
            TargetState::Deleting => "deleting",
            TargetState::Done => "done",
            TargetState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// 单个目标的同步结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub files_scanned: usize,
    pub files_uploaded: usize,
    pub bytes_uploaded: u64,
    pub files_unchanged: usize,
    pub files_excluded: usize,
    pub objects_deleted: usize,
}

/// 清空前缀的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSummary {
    pub objects_deleted: usize,
}

fn join_failure(e: JoinError) -> SyncError {
    SyncError::transfer("<task>", format!("任务异常结束: {}", e))
}

/// 有界并发执行：最多 MAX_CONCURRENT_OPERATIONS 个任务同时运行，其余按提交顺序排队。
///
/// 任一任务失败后不再派发新任务，并中止仍在运行的任务，返回第一个错误。
/// `op` 返回本次完成的进度量。
pub(crate) async fn run_bounded<T, F, Fut>(
    items: Vec<T>,
    tracker: Arc<ProgressTracker>,
    op: F,
) -> Result<usize>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_OPERATIONS));
    let op = Arc::new(op);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let mut completed = 0usize;

    for item in items {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SyncError::transfer("<semaphore>", e))?;

        // 派发前先收集已结束的任务，发现失败立即停止
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined.map_err(join_failure).and_then(|r| r) {
                tasks.abort_all();
                return Err(e);
            }
            completed += 1;
        }

        let op = op.clone();
        let tracker = tracker.clone();
        tasks.spawn(async move {
            let units = op(item).await?;
            tracker.advance(units);
            drop(permit);
            Ok(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.map_err(join_failure).and_then(|r| r) {
            tasks.abort_all();
            return Err(e);
        }
        completed += 1;
    }

    Ok(completed)
}

/// 执行前置命令，非零退出视为失败
pub async fn run_pre_command(command: &str, cwd: &Path) -> Result<()> {
    info!("执行前置命令: {}", command);

    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = tokio::process::Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = tokio::process::Command::new("sh");
        c.args(["-c", command]);
        c
    };

    let output = cmd
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| SyncError::PreCommand {
            command: command.to_string(),
            status: format!("无法启动: {}", e),
        })?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!("[pre-command] {}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        warn!("[pre-command] {}", line);
    }

    if !output.status.success() {
        return Err(SyncError::PreCommand {
            command: command.to_string(),
            status: output.status.to_string(),
        });
    }
    Ok(())
}

/// 传输编排器
pub struct TransferOrchestrator {
    store: Arc<dyn ObjectStore>,
    stage: String,
    /// 前置命令的工作目录
    work_dir: PathBuf,
    progress_tx: Option<ProgressSender>,
}

impl TransferOrchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, stage: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            store,
            stage: stage.into(),
            work_dir,
            progress_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.progress_tx = tx;
        self
    }

    fn enter(label: &str, state: TargetState) {
        debug!("目标 {} -> {}", label, state);
    }

    /// 把本地目录同步到存储桶前缀
    pub async fn sync(&self, target: &SyncTarget, bucket: &str) -> Result<SyncSummary> {
        let label = target.label();
        Self::enter(&label, TargetState::Idle);

        let result = self.sync_inner(target, bucket, &label).await;
        match &result {
            Ok(summary) => {
                Self::enter(&label, TargetState::Done);
                info!(
                    "同步完成: {} - 上传 {} ({} 字节), 未变化 {}, 删除 {}",
                    label,
                    summary.files_uploaded,
                    summary.bytes_uploaded,
                    summary.files_unchanged,
                    summary.objects_deleted
                );
            }
            Err(e) => {
                Self::enter(&label, TargetState::Failed);
                error!("同步失败: {} - {}", label, e);
            }
        }
        result
    }

    async fn sync_inner(
        &self,
        target: &SyncTarget,
        bucket: &str,
        label: &str,
    ) -> Result<SyncSummary> {
        if let Some(command) = &target.pre_command {
            Self::enter(label, TargetState::PreCommand);
            run_pre_command(command, &self.work_dir).await?;
        }

        Self::enter(label, TargetState::Diffing);
        let files = scan_local_tree(
            &target.local_dir,
            target.follow_symlinks,
            &target.rules,
            &self.stage,
        )
        .await?;
        let remote = self
            .store
            .list_objects(bucket, &target.list_prefix())
            .await?;
        let plan = plan_sync(target, &files, remote).await?;

        let mut summary = SyncSummary {
            files_scanned: files.len(),
            files_unchanged: plan.unchanged,
            files_excluded: plan.excluded,
            ..Default::default()
        };

        Self::enter(label, TargetState::Transferring);
        let total_bytes = plan.upload_bytes();
        // 全是空文件时按文件数计算进度
        let by_count = total_bytes == 0;
        let tracker = Arc::new(ProgressTracker::new(
            label,
            Phase::Upload,
            if by_count { plan.uploads.len() as u64 } else { total_bytes },
            self.progress_tx.clone(),
        ));

        let files = Arc::new(files);
        let uploads: Vec<(usize, String)> = plan
            .uploads
            .iter()
            .map(|u| (u.file_index, u.key.clone()))
            .collect();
        let store = self.store.clone();
        let bucket_name = bucket.to_string();
        let acl = target.acl.as_str().to_string();
        let default_type = target.default_content_type.clone();
        let upload_files = files.clone();

        let uploaded = run_bounded(uploads, tracker.clone(), move |(index, key)| {
            let store = store.clone();
            let files = upload_files.clone();
            let bucket = bucket_name.clone();
            let acl = acl.clone();
            let default_type = default_type.clone();
            async move {
                let file = &files[index];
                let request = build_put(&bucket, &key, file, &acl, default_type.as_deref());
                debug!("上传: {} -> s3://{}/{} ({} 字节)", file.relative, bucket, key, file.size);
                store.put_object(request).await?;
                Ok(if by_count { 1 } else { file.size })
            }
        })
        .await;

        tracker.finish(uploaded.is_ok());
        summary.files_uploaded = uploaded?;
        summary.bytes_uploaded = total_bytes;

        if target.delete_removed && !plan.orphans.is_empty() {
            Self::enter(label, TargetState::Deleting);
            summary.objects_deleted = self
                .delete_keys(label, bucket, plan.orphans.clone(), Phase::Delete, 1)
                .await?;
        }

        Ok(summary)
    }

    /// 删除前缀下的所有对象，不扫描本地目录
    pub async fn clear(&self, target: &SyncTarget, bucket: &str) -> Result<ClearSummary> {
        let label = target.label();
        info!("清空存储桶前缀: s3://{}/{}", bucket, target.list_prefix());

        let keys: Vec<String> = self
            .store
            .list_objects(bucket, &target.list_prefix())
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect();

        let deleted = self
            .delete_keys(&label, bucket, keys, Phase::Clear, DELETE_BATCH_SIZE)
            .await?;

        info!("清空完成: {} - 删除 {} 个对象", label, deleted);
        Ok(ClearSummary {
            objects_deleted: deleted,
        })
    }

    /// 按批删除，每批是一个传输任务；返回删除的对象数
    async fn delete_keys(
        &self,
        label: &str,
        bucket: &str,
        keys: Vec<String>,
        phase: Phase,
        batch_size: usize,
    ) -> Result<usize> {
        let total = keys.len();
        let tracker = Arc::new(ProgressTracker::new(
            label,
            phase,
            total as u64,
            self.progress_tx.clone(),
        ));
        let batches: Vec<Vec<String>> = keys
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();

        let store = self.store.clone();
        let bucket = bucket.to_string();
        let result = run_bounded(batches, tracker.clone(), move |batch: Vec<String>| {
            let store = store.clone();
            let bucket = bucket.clone();
            async move {
                debug!("删除: s3://{}/{:?}", bucket, batch);
                store.delete_objects(&bucket, &batch).await?;
                Ok(batch.len() as u64)
            }
        })
        .await;

        tracker.finish(result.is_ok());
        result?;
        Ok(total)
    }
}

/// 组装上传请求：确定 Content-Type 与 ACL，内容由存储层从文件流式读取
fn build_put(
    bucket: &str,
    key: &str,
    file: &LocalFile,
    acl: &str,
    default_type: Option<&str>,
) -> PutRequest {
    PutRequest {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source: file.path.clone(),
        size: file.size,
        content_type: file.content_type(default_type),
        // 规则里的 ACL 覆盖目标级设置
        acl: file.params.get_str("ACL").unwrap_or(acl).to_string(),
        params: file.params.clone(),
    }
}
