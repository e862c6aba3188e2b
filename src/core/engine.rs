//! 同步引擎 - 对所有选中的目标并发执行一个阶段，并汇总结果

use crate::core::metadata::{resync_metadata, MetadataSummary};
use crate::core::progress::{notify_finished, Phase, ProgressSender};
use crate::core::resolver::BucketResolver;
use crate::core::tags::sync_bucket_tags;
use crate::core::target::{SyncTarget, TargetEntry, TargetSet};
use crate::core::transfer::{ClearSummary, SyncSummary, TransferOrchestrator};
use crate::error::{Result, SyncError};
use crate::storage::ObjectStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 一次运行执行的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Sync,
    Metadata,
    Tags,
    Clear,
}

impl Operation {
    fn phase(self) -> Phase {
        match self {
            Operation::Sync => Phase::Upload,
            Operation::Metadata => Phase::Metadata,
            Operation::Tags => Phase::Tags,
            Operation::Clear => Phase::Clear,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Sync => "sync",
            Operation::Metadata => "metadata",
            Operation::Tags => "tags",
            Operation::Clear => "clear",
        };
        write!(f, "{}", name)
    }
}

/// 单个目标单个阶段的成功结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PhaseSummary {
    Sync(SyncSummary),
    Metadata(MetadataSummary),
    Tags { tag_count: usize },
    Clear(ClearSummary),
    /// 该阶段对此目标无事可做（例如没有配置 bucketTags）
    Skipped,
}

#[derive(Debug)]
pub struct TargetOutcome {
    /// 目标在配置中的位置；`--bucket` 没有匹配时为 None
    pub target_id: Option<usize>,
    pub target: String,
    pub operation: Operation,
    pub result: Result<PhaseSummary>,
}

impl TargetOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// 一次运行的汇总
#[derive(Debug)]
pub struct RunReport {
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// noSync 时为 true，此时 outcomes 为空
    pub skipped: bool,
    pub outcomes: Vec<TargetOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(TargetOutcome::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    resolver: Arc<BucketResolver>,
    stage: String,
    no_sync: bool,
    /// 前置命令的工作目录
    base_dir: PathBuf,
    progress_tx: Option<ProgressSender>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resolver: Arc<BucketResolver>,
        stage: impl Into<String>,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            resolver,
            stage: stage.into(),
            no_sync: false,
            base_dir,
            progress_tx: None,
        }
    }

    pub fn with_no_sync(mut self, no_sync: bool) -> Self {
        self.no_sync = no_sync;
        self
    }

    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.progress_tx = tx;
        self
    }

    /// 对选中的目标并发执行 `operation`；单个目标失败不影响其它目标
    pub async fn run(
        &self,
        targets: &TargetSet,
        operation: Operation,
        bucket: Option<&str>,
    ) -> RunReport {
        self.run_excluding(targets, operation, bucket, &HashSet::new())
            .await
    }

    /// 依次执行 sync、metadata、tags；某阶段失败的目标不再进入后续阶段，其它目标照常继续
    pub async fn deploy(&self, targets: &TargetSet, bucket: Option<&str>) -> Vec<RunReport> {
        let mut failed = HashSet::new();
        let mut reports = Vec::with_capacity(3);

        for operation in [Operation::Sync, Operation::Metadata, Operation::Tags] {
            let report = self
                .run_excluding(targets, operation, bucket, &failed)
                .await;
            failed.extend(report.failures().filter_map(|o| o.target_id));
            reports.push(report);
        }
        reports
    }

    async fn run_excluding(
        &self,
        targets: &TargetSet,
        operation: Operation,
        bucket: Option<&str>,
        excluded: &HashSet<usize>,
    ) -> RunReport {
        let started_at = Utc::now();

        if self.no_sync {
            info!("noSync 已开启，跳过 {}", operation);
            return RunReport {
                operation,
                started_at,
                finished_at: Utc::now(),
                skipped: true,
                outcomes: Vec::new(),
            };
        }

        let selected = targets.select(bucket);
        let mut outcomes = Vec::with_capacity(selected.len());

        if selected.is_empty() {
            if let Some(bucket) = bucket {
                outcomes.push(TargetOutcome {
                    target_id: None,
                    target: bucket.to_string(),
                    operation,
                    result: Err(SyncError::Configuration(format!(
                        "没有匹配存储桶 {} 的已启用目标",
                        bucket
                    ))),
                });
            } else {
                info!("没有需要处理的目标");
            }
        }

        let selected: Vec<&TargetEntry> = selected
            .into_iter()
            .filter(|entry| {
                let skip = excluded.contains(&entry.id());
                if skip {
                    info!("目标 {} 前一阶段失败，跳过 {}", entry.label(), operation);
                }
                !skip
            })
            .collect();

        info!("开始 {}: {} 个目标, stage = {}", operation, selected.len(), self.stage);

        let runs = selected
            .into_iter()
            .map(|entry| self.run_entry(entry, operation));
        outcomes.extend(join_all(runs).await);

        let report = RunReport {
            operation,
            started_at,
            finished_at: Utc::now(),
            skipped: false,
            outcomes,
        };

        let failed = report.failures().count();
        let elapsed = report.finished_at - report.started_at;
        if failed == 0 {
            info!(
                "{} 完成: {} 个目标, 耗时 {}ms",
                operation,
                report.outcomes.len(),
                elapsed.num_milliseconds()
            );
        } else {
            error!(
                "{} 失败: {}/{} 个目标出错",
                operation,
                failed,
                report.outcomes.len()
            );
        }
        report
    }

    async fn run_entry(&self, entry: &TargetEntry, operation: Operation) -> TargetOutcome {
        let label = entry.label();
        let result = match entry {
            TargetEntry::Valid(target) => self.run_target(target, operation).await,
            TargetEntry::Invalid(invalid) => {
                // 配置错误在加载时已记录，这里只转成该目标的失败结果
                Err(SyncError::Configuration(match &invalid.error {
                    SyncError::Configuration(message) => message.clone(),
                    other => other.to_string(),
                }))
            }
        };

        if let Err(e) = &result {
            warn!("目标 {} {} 失败 ({}): {}", label, operation, e.kind(), e);
            notify_finished(self.progress_tx.as_ref(), &label, operation.phase(), false);
        }

        TargetOutcome {
            target_id: Some(entry.id()),
            target: label,
            operation,
            result,
        }
    }

    async fn run_target(&self, target: &SyncTarget, operation: Operation) -> Result<PhaseSummary> {
        let bucket = self.resolver.resolve(target).await?;

        match operation {
            Operation::Sync => self
                .orchestrator()
                .sync(target, &bucket)
                .await
                .map(PhaseSummary::Sync),
            Operation::Clear => self
                .orchestrator()
                .clear(target, &bucket)
                .await
                .map(PhaseSummary::Clear),
            Operation::Metadata => resync_metadata(
                self.store.clone(),
                target,
                &bucket,
                &self.stage,
                self.progress_tx.clone(),
            )
            .await
            .map(PhaseSummary::Metadata),
            Operation::Tags => {
                let Some(desired) = target.bucket_tags.as_ref().filter(|t| !t.is_empty()) else {
                    return Ok(PhaseSummary::Skipped);
                };
                let merged = sync_bucket_tags(self.store.as_ref(), &bucket, desired).await?;
                notify_finished(self.progress_tx.as_ref(), &target.label(), Phase::Tags, true);
                Ok(PhaseSummary::Tags {
                    tag_count: merged.len(),
                })
            }
        }
    }

    fn orchestrator(&self) -> TransferOrchestrator {
        TransferOrchestrator::new(self.store.clone(), self.stage.clone(), self.base_dir.clone())
            .with_progress(self.progress_tx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::StaticOutputs;
    use crate::core::transfer::tests::MemoryStore;
    use crate::storage::Tag;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    fn engine(store: Arc<MemoryStore>, outputs: &[(&str, &str)], base: &Path) -> SyncEngine {
        let outputs: HashMap<String, String> = outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let resolver = Arc::new(BucketResolver::new(Arc::new(StaticOutputs::new(outputs))));
        SyncEngine::new(store, resolver, "dev", base.to_path_buf())
    }

    fn targets(values: serde_json::Value, base: &Path) -> TargetSet {
        TargetSet::from_values(values.as_array().unwrap(), base)
    }

    #[tokio::test]
    async fn test_one_failing_target_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("site")).unwrap();
        fs::write(dir.path().join("site/index.html"), "<html>").unwrap();

        let set = targets(
            json!([
                { "bucketName": "site", "localDir": "site" },
                { "bucketNameKey": "MissingOutput", "localDir": "site" },
                { "bucketName": "broken" }
            ]),
            dir.path(),
        );

        let store = Arc::new(MemoryStore::default());
        let report = engine(store.clone(), &[], dir.path())
            .run(&set, Operation::Sync, None)
            .await;

        assert!(!report.succeeded());
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes[0].is_ok());
        assert_eq!(
            report.outcomes[1].result.as_ref().unwrap_err().kind(),
            "resolution"
        );
        assert_eq!(
            report.outcomes[2].result.as_ref().unwrap_err().kind(),
            "configuration"
        );
        assert_eq!(store.keys("site"), vec!["index.html"]);
    }

    #[tokio::test]
    async fn test_disabled_target_issues_no_operations() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let set = targets(
            json!([{ "bucketName": "off", "localDir": ".", "enabled": false }]),
            dir.path(),
        );

        let store = Arc::new(MemoryStore::default());
        let engine = engine(store.clone(), &[], dir.path());
        for op in [Operation::Sync, Operation::Metadata, Operation::Tags, Operation::Clear] {
            let report = engine.run(&set, op, None).await;
            assert!(report.outcomes.is_empty());
            assert!(report.succeeded());
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(store.keys("off").is_empty());
    }

    #[tokio::test]
    async fn test_no_sync_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let set = targets(json!([{ "bucketName": "site", "localDir": "." }]), dir.path());

        let store = Arc::new(MemoryStore::default());
        let report = engine(store.clone(), &[], dir.path())
            .with_no_sync(true)
            .run(&set, Operation::Sync, None)
            .await;

        assert!(report.skipped);
        assert!(report.outcomes.is_empty());
        assert!(store.keys("site").is_empty());
    }

    #[tokio::test]
    async fn test_bucket_filter() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let set = targets(
            json!([
                { "bucketName": "one", "localDir": "." },
                { "bucketNameKey": "TwoBucket", "localDir": "." }
            ]),
            dir.path(),
        );

        let store = Arc::new(MemoryStore::default());
        let engine = engine(store.clone(), &[("TwoBucket", "two-resolved")], dir.path());

        let report = engine.run(&set, Operation::Sync, Some("TwoBucket")).await;
        assert!(report.succeeded());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(store.keys("two-resolved"), vec!["a.txt"]);
        assert!(store.keys("one").is_empty());

        let report = engine.run(&set, Operation::Sync, Some("nope")).await;
        assert!(!report.succeeded());
        assert_eq!(
            report.outcomes[0].result.as_ref().unwrap_err().kind(),
            "configuration"
        );
    }

    #[tokio::test]
    async fn test_tags_phase() {
        let dir = tempfile::tempdir().unwrap();
        let set = targets(
            json!([
                { "bucketName": "tagged", "localDir": ".", "bucketTags": { "env": "prod" } },
                { "bucketName": "plain", "localDir": "." }
            ]),
            dir.path(),
        );

        let store = Arc::new(MemoryStore::default());
        store
            .tags
            .lock()
            .unwrap()
            .insert("tagged".to_string(), vec![Tag::new("team", "web")]);

        let report = engine(store.clone(), &[], dir.path())
            .run(&set, Operation::Tags, None)
            .await;

        assert!(report.succeeded());
        assert_eq!(
            report.outcomes[0].result.as_ref().unwrap(),
            &PhaseSummary::Tags { tag_count: 2 }
        );
        assert_eq!(report.outcomes[1].result.as_ref().unwrap(), &PhaseSummary::Skipped);
        assert_eq!(
            store.tags.lock().unwrap().get("tagged").unwrap(),
            &vec![Tag::new("team", "web"), Tag::new("env", "prod")]
        );
        assert!(!store.tags.lock().unwrap().contains_key("plain"));
    }

    #[tokio::test]
    async fn test_deploy_failure_only_skips_failed_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), "1").unwrap();

        let set = targets(
            json!([
                {
                    "bucketName": "ok",
                    "localDir": ".",
                    "params": [{ "*.js": { "CacheControl": "max-age=60" } }],
                    "bucketTags": { "env": "dev" }
                },
                { "bucketName": "broken", "bucketTags": { "env": "dev" } },
                { "bucketNameKey": "MissingOutput", "localDir": ".", "bucketTags": { "a": "1" } }
            ]),
            dir.path(),
        );

        let store = Arc::new(MemoryStore::default());
        let reports = engine(store.clone(), &[], dir.path())
            .deploy(&set, None)
            .await;

        let ops: Vec<Operation> = reports.iter().map(|r| r.operation).collect();
        assert_eq!(ops, vec![Operation::Sync, Operation::Metadata, Operation::Tags]);
        assert_eq!(reports[0].failures().count(), 2);

        // 失败的目标不进入后续阶段，成功的目标照常继续
        for report in &reports[1..] {
            assert!(report.succeeded());
            let ids: Vec<_> = report.outcomes.iter().map(|o| o.target_id).collect();
            assert_eq!(ids, vec![Some(0)]);
        }

        let copies = store.copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].dest_key, "app.js");
        assert_eq!(
            store.tags.lock().unwrap().get("ok").unwrap(),
            &vec![Tag::new("env", "dev")]
        );
        assert!(!store.tags.lock().unwrap().contains_key("broken"));
    }

    #[tokio::test]
    async fn test_tag_failure_is_tag_operation_error() {
        let dir = tempfile::tempdir().unwrap();
        let set = targets(
            json!([{ "bucketName": "tagged", "localDir": ".", "bucketTags": { "a": "1" } }]),
            dir.path(),
        );

        let store = Arc::new(MemoryStore::default());
        *store.fail_tags.lock().unwrap() = true;

        let report = engine(store, &[], dir.path())
            .run(&set, Operation::Tags, None)
            .await;
        assert_eq!(
            report.outcomes[0].result.as_ref().unwrap_err().kind(),
            "tag-operation"
        );
    }
}
