//! 本地模拟存储 - 开发时代替真实的对象存储
//!
//! 每个存储桶是根目录下的一个子目录，标签保存在桶目录中的隐藏文件里。

use super::{CopyRequest, ObjectStore, PutRequest, RemoteObject, TagSet};
use crate::core::comparator::content_md5;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::AsyncReadExt;
use opendal::{Metakey, Operator};

/// 标签文件名，不会出现在列表中
const TAGS_FILE: &str = ".bucket-tags.json";

const WRITE_CHUNK_SIZE: usize = 1024 * 1024;

pub struct EmulatorStore {
    operator: Operator,
    name: String,
}

impl EmulatorStore {
    pub fn new(operator: Operator, name: impl Into<String>) -> Self {
        Self {
            operator,
            name: name.into(),
        }
    }

    /// 以本地目录为根创建
    pub fn on_disk(root: &str) -> Result<Self> {
        use opendal::services::Fs;

        std::fs::create_dir_all(root).map_err(|e| SyncError::io(root, e))?;
        let builder = Fs::default().root(root);
        let operator = Operator::new(builder)
            .map_err(|e| SyncError::Configuration(format!("无法初始化模拟存储: {}", e)))?
            .finish();

        Ok(Self::new(operator, format!("file://{}", root)))
    }

    fn object_path(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for EmulatorStore {
    async fn put_object(&self, request: PutRequest) -> Result<()> {
        let path = Self::object_path(&request.bucket, &request.key);
        let mut file = tokio::fs::File::open(&request.source)
            .await
            .map_err(|e| SyncError::io(&request.source, e))?;
        let mut writer = self
            .operator
            .writer(&path)
            .await
            .map_err(|e| SyncError::transfer(&request.key, e))?;

        let mut buf = vec![0u8; WRITE_CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| SyncError::io(&request.source, e))?;
            if n == 0 {
                break;
            }
            writer
                .write(buf[..n].to_vec())
                .await
                .map_err(|e| SyncError::transfer(&request.key, e))?;
        }
        writer
            .close()
            .await
            .map_err(|e| SyncError::transfer(&request.key, e))?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            // 删除不存在的对象不会报错
            self.operator
                .delete(&Self::object_path(bucket, key))
                .await
                .map_err(|e| SyncError::transfer(key, e))?;
        }
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let bucket_root = format!("{}/", bucket);
        let mut objects = Vec::new();

        let lister = self
            .operator
            .lister_with(&bucket_root)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::Mode)
            .await;

        let mut lister = match lister {
            Ok(l) => l,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(objects),
            Err(e) => return Err(SyncError::transfer(prefix, e)),
        };

        while let Some(entry) = lister
            .try_next()
            .await
            .map_err(|e| SyncError::transfer(prefix, e))?
        {
            let meta = entry.metadata();
            if meta.is_dir() {
                continue;
            }

            let Some(key) = entry.path().strip_prefix(&bucket_root) else {
                continue;
            };
            if key == TAGS_FILE || !key.starts_with(prefix) {
                continue;
            }

            // 文件系统没有 ETag，用内容 MD5 模拟单段上传的 ETag
            let data = self
                .operator
                .read(entry.path())
                .await
                .map_err(|e| SyncError::transfer(key, e))?;

            objects.push(RemoteObject {
                key: key.to_string(),
                size: meta.content_length(),
                etag: Some(content_md5(&data.to_vec())),
            });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn copy_object(&self, request: CopyRequest) -> Result<()> {
        let source = Self::object_path(&request.bucket, &request.source_key);
        let exists = self
            .operator
            .is_exist(&source)
            .await
            .map_err(|e| SyncError::transfer(&request.source_key, e))?;
        if !exists {
            return Err(SyncError::transfer(&request.source_key, "源对象不存在"));
        }

        // 文件系统不保存对象头，原地复制只需确认对象存在
        if request.source_key != request.dest_key {
            self.operator
                .copy(&source, &Self::object_path(&request.bucket, &request.dest_key))
                .await
                .map_err(|e| SyncError::transfer(&request.dest_key, e))?;
        }
        Ok(())
    }

    async fn get_bucket_tags(&self, bucket: &str) -> Result<TagSet> {
        match self.operator.read(&Self::object_path(bucket, TAGS_FILE)).await {
            Ok(data) => {
                serde_json::from_slice(&data.to_vec()).map_err(|e| SyncError::tags(bucket, e))
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(TagSet::new()),
            Err(e) => Err(SyncError::tags(bucket, e)),
        }
    }

    async fn put_bucket_tags(&self, bucket: &str, tags: &TagSet) -> Result<()> {
        let content = serde_json::to_vec_pretty(tags).map_err(|e| SyncError::tags(bucket, e))?;
        self.operator
            .write(&Self::object_path(bucket, TAGS_FILE), content)
            .await
            .map_err(|e| SyncError::tags(bucket, e))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
