//! 存储桶标签合并

use crate::error::Result;
use crate::storage::{ObjectStore, Tag, TagSet};
use std::collections::BTreeMap;
use tracing::info;

/// 把期望的标签合并进已有标签：同名覆盖，新键追加，其它键保持不变
pub fn merge_tags(existing: &TagSet, desired: &BTreeMap<String, String>) -> TagSet {
    let mut merged = existing.clone();
    for (key, value) in desired {
        match merged.iter_mut().find(|t| &t.key == key) {
            Some(tag) => tag.value = value.clone(),
            None => merged.push(Tag::new(key.clone(), value.clone())),
        }
    }
    merged
}

/// 读取 - 合并 - 写回；期间的外部修改按后写者为准
pub async fn sync_bucket_tags(
    store: &dyn ObjectStore,
    bucket: &str,
    desired: &BTreeMap<String, String>,
) -> Result<TagSet> {
    let existing = store.get_bucket_tags(bucket).await?;
    let merged = merge_tags(&existing, desired);
    store.put_bucket_tags(bucket, &merged).await?;

    info!(
        "存储桶 {} 标签已更新: 原有 {} 个, 现有 {} 个",
        bucket,
        existing.len(),
        merged.len()
    );
    Ok(merged)
}
