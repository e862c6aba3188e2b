use crate::core::scanner::LocalFile;
use crate::core::target::SyncTarget;
use crate::error::{Result, SyncError};
use crate::storage::RemoteObject;
use md5::{Digest, Md5};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// 需要上传的文件：新文件或内容不同
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpload {
    /// 在本地文件列表中的位置
    pub file_index: usize,
    pub key: String,
    pub size: u64,
}

/// 比较结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub uploads: Vec<PlannedUpload>,
    pub orphans: Vec<String>,
    pub unchanged: usize,
    pub excluded: usize,
}

impl SyncPlan {
    pub fn upload_bytes(&self) -> u64 {
        self.uploads.iter().map(|u| u.size).sum()
    }
}

const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// 计算内容 MD5（小写十六进制），与单段上传的 ETag 相同
pub fn content_md5(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 分块读取文件计算 MD5，不把整个文件读入内存
pub async fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 判断本地文件与远程对象是否相同
async fn is_unchanged(file: &LocalFile, remote: &RemoteObject) -> Result<bool> {
    if file.size != remote.size {
        debug!(
            "文件大小不同: {} (local={}, remote={})",
            file.relative, file.size, remote.size
        );
        return Ok(false);
    }

    match remote.etag.as_deref() {
        // 分段上传的 ETag 不是内容 MD5，只能按大小判断
        Some(etag) if etag.contains('-') => Ok(true),
        Some(etag) => {
            let local = file_md5(&file.path)
                .await
                .map_err(|e| SyncError::io(&file.path, e))?;
            Ok(local.eq_ignore_ascii_case(etag))
        }
        None => Ok(false),
    }
}

/// 对比本地文件与远程列表，得出需要上传的文件和孤立对象
pub async fn plan_sync(
    target: &SyncTarget,
    files: &[LocalFile],
    remote: Vec<RemoteObject>,
) -> Result<SyncPlan> {
    let remote: HashMap<String, RemoteObject> =
        remote.into_iter().map(|o| (o.key.clone(), o)).collect();
    let mut local_keys = HashSet::with_capacity(files.len());
    let mut plan = SyncPlan::default();

    for (index, file) in files.iter().enumerate() {
        let key = target.key_for(&file.relative);
        local_keys.insert(key.clone());

        // 被环境规则排除的文件不上传，但本地仍存在，远程对应对象不算孤立
        if file.excluded {
            plan.excluded += 1;
            continue;
        }

        let unchanged = match remote.get(&key) {
            Some(object) => is_unchanged(file, object).await?,
            None => false,
        };

        if unchanged {
            plan.unchanged += 1;
        } else {
            plan.uploads.push(PlannedUpload {
                file_index: index,
                key,
                size: file.size,
            });
        }
    }

    let mut orphans: Vec<String> = remote
        .into_keys()
        .filter(|key| !key.ends_with('/') && !local_keys.contains(key))
        .collect();
    orphans.sort();
    plan.orphans = orphans;

    debug!(
        "比较完成: {} 个上传, {} 个未变化, {} 个孤立对象, {} 个排除",
        plan.uploads.len(),
        plan.unchanged,
        plan.orphans.len(),
        plan.excluded
    );

    Ok(plan)
}
