pub mod emulator;
pub mod s3;

use crate::core::rules::ObjectParams;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use emulator::EmulatorStore;
pub use s3::S3Store;

// ============ 公共常量 ============

/// 单次批量删除请求允许的最大键数
pub const DELETE_BATCH_SIZE: usize = 1000;

/// 远程对象列表项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    /// 去掉引号的 ETag
    pub etag: Option<String>,
}

/// 单个存储桶标签
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 存储桶标签集合，保持存储端的列表顺序
pub type TagSet = Vec<Tag>;

/// 上传请求，内容在发送时从本地文件流式读取
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub bucket: String,
    pub key: String,
    pub source: PathBuf,
    pub size: u64,
    pub content_type: Option<String>,
    pub acl: String,
    pub params: ObjectParams,
}

/// 原地复制请求（用于只更新元数据）
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub bucket: String,
    pub source_key: String,
    pub dest_key: String,
    /// true 时完全替换对象元数据，而不是沿用源对象的
    pub metadata_replace: bool,
    pub content_type: Option<String>,
    pub acl: String,
    pub params: ObjectParams,
}

/// 从参数中提取的标准对象头
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectHeaders {
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub expires: Option<String>,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    pub website_redirect_location: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ObjectHeaders {
    pub fn from_params(params: &ObjectParams) -> Self {
        let mut headers = ObjectHeaders::default();

        for (key, value) in params.iter() {
            let text = || value_to_string(value);
            match key.as_str() {
                "CacheControl" => headers.cache_control = text(),
                "ContentDisposition" => headers.content_disposition = text(),
                "ContentEncoding" => headers.content_encoding = text(),
                "ContentLanguage" => headers.content_language = text(),
                "Expires" => headers.expires = text(),
                "StorageClass" => headers.storage_class = text(),
                "ServerSideEncryption" => headers.server_side_encryption = text(),
                "WebsiteRedirectLocation" => headers.website_redirect_location = text(),
                "Metadata" => {
                    if let Some(map) = value.as_object() {
                        for (k, v) in map {
                            if let Some(v) = value_to_string(v) {
                                headers.metadata.insert(k.to_lowercase(), v);
                            }
                        }
                    }
                }
                // 由调用方单独处理
                "ContentType" | "ACL" => {}
                other => tracing::debug!("忽略未知对象参数: {}", other),
            }
        }

        headers
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 对象存储能力接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 上传单个对象
    async fn put_object(&self, request: PutRequest) -> Result<()>;

    /// 批量删除对象
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;

    /// 列出前缀下的所有对象
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// 同一存储桶内复制对象
    async fn copy_object(&self, request: CopyRequest) -> Result<()>;

    /// 读取存储桶标签，没有标签时返回空集合
    async fn get_bucket_tags(&self, bucket: &str) -> Result<TagSet>;

    /// 整体写回存储桶标签
    async fn put_bucket_tags(&self, bucket: &str, tags: &TagSet) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 存储连接设置
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    /// 地址覆盖：`http(s)://` 指向兼容 S3 的服务，`file://` 指向本地模拟存储
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

/// 根据设置创建存储实例
pub async fn create_store(settings: &StoreSettings) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match settings.endpoint.as_deref() {
        Some(endpoint) if endpoint.starts_with("file://") => {
            let root = endpoint.trim_start_matches("file://");
            if root.is_empty() {
                return Err(SyncError::Configuration(
                    "file:// 地址必须包含目录".to_string(),
                ));
            }
            Arc::new(EmulatorStore::on_disk(root)?)
        }
        endpoint => Arc::new(S3Store::new(endpoint, settings.region.as_deref()).await),
    };

    tracing::info!("初始化存储: {} (region={:?})", store.name(), settings.region);
    Ok(store)
}
