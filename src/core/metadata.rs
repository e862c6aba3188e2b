//! 元数据重同步 - 不重新上传内容，原地复制并替换对象头

use crate::core::progress::{Phase, ProgressSender, ProgressTracker};
use crate::core::scanner::scan_local_tree;
use crate::core::target::SyncTarget;
use crate::core::transfer::run_bounded;
use crate::error::Result;
use crate::storage::{CopyRequest, ObjectStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSummary {
    pub files_scanned: usize,
    pub objects_updated: usize,
}

/// 对命中至少一条规则且未被环境排除的文件，按当前规则重写远程对象的元数据
pub async fn resync_metadata(
    store: Arc<dyn ObjectStore>,
    target: &SyncTarget,
    bucket: &str,
    stage: &str,
    progress: Option<ProgressSender>,
) -> Result<MetadataSummary> {
    let label = target.label();
    let files = scan_local_tree(&target.local_dir, target.follow_symlinks, &target.rules, stage).await?;

    let requests: Vec<CopyRequest> = files
        .iter()
        .filter(|f| f.matched && !f.excluded)
        .map(|f| {
            let key = target.key_for(&f.relative);
            CopyRequest {
                bucket: bucket.to_string(),
                source_key: key.clone(),
                dest_key: key,
                metadata_replace: true,
                content_type: f.content_type(target.default_content_type.as_deref()),
                acl: f
                    .params
                    .get_str("ACL")
                    .unwrap_or(target.acl.as_str())
                    .to_string(),
                params: f.params.clone(),
            }
        })
        .collect();

    info!("元数据同步: {} - {} 个对象", label, requests.len());

    let tracker = Arc::new(ProgressTracker::new(
        &label,
        Phase::Metadata,
        requests.len() as u64,
        progress,
    ));
    let result = run_bounded(requests, tracker.clone(), move |request: CopyRequest| {
        let store = store.clone();
        async move {
            debug!("更新元数据: s3://{}/{}", request.bucket, request.dest_key);
            store.copy_object(request).await?;
            Ok(1)
        }
    })
    .await;
    tracker.finish(result.is_ok());

    Ok(MetadataSummary {
        files_scanned: files.len(),
        objects_updated: result?,
    })
}
