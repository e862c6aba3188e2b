//! 存储桶解析 - 把目标的存储桶标识解析为具体名称
//!
//! 通过输出键解析的结果按目标缓存，同一次运行中每个目标最多查询一次外部输出。

use crate::core::target::{BucketIdentity, SyncTarget};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("输出 {0} 不存在")]
    OutputNotFound(String),
    #[error("查询输出失败: {0}")]
    Lookup(String),
}

/// 外部输出查询能力
#[async_trait]
pub trait OutputResolver: Send + Sync {
    async fn resolve_output(&self, key: &str) -> std::result::Result<String, OutputError>;
}

/// 基于配置中 `outputs` 表的静态实现
#[derive(Debug, Clone, Default)]
pub struct StaticOutputs {
    outputs: HashMap<String, String>,
}

impl StaticOutputs {
    pub fn new(outputs: HashMap<String, String>) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl OutputResolver for StaticOutputs {
    async fn resolve_output(&self, key: &str) -> std::result::Result<String, OutputError> {
        self.outputs
            .get(key)
            .cloned()
            .ok_or_else(|| OutputError::OutputNotFound(key.to_string()))
    }
}

/// 带单次查询缓存的解析器
pub struct BucketResolver {
    outputs: Arc<dyn OutputResolver>,
    cache: Mutex<HashMap<usize, Arc<OnceCell<String>>>>,
}

impl BucketResolver {
    pub fn new(outputs: Arc<dyn OutputResolver>) -> Self {
        Self {
            outputs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 同一目标的并发调用共享一次查询；查询失败不缓存
    pub async fn resolve(&self, target: &SyncTarget) -> Result<String> {
        let key = match &target.bucket {
            BucketIdentity::Name(name) => return Ok(name.clone()),
            BucketIdentity::OutputKey(key) => key,
        };

        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.entry(target.id).or_default().clone()
        };

        let name = cell
            .get_or_try_init(|| async {
                debug!("查询输出键: {}", key);
                let name = self.outputs.resolve_output(key).await.map_err(|e| {
                    SyncError::Resolution(format!("目标 #{} ({}): {}", target.id, key, e))
                })?;
                if name.is_empty() {
                    return Err(SyncError::Resolution(format!("输出 {} 为空", key)));
                }
                info!("输出键 {} 解析为存储桶 {}", key, name);
                Ok(name)
            })
            .await?;

        Ok(name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOutputs {
        inner: StaticOutputs,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OutputResolver for CountingOutputs {
        async fn resolve_output(&self, key: &str) -> std::result::Result<String, OutputError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.resolve_output(key).await
        }
    }

    fn counting(pairs: &[(&str, &str)]) -> Arc<CountingOutputs> {
        let outputs = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(CountingOutputs {
            inner: StaticOutputs::new(outputs),
            calls: AtomicUsize::new(0),
        })
    }

    fn target(id: usize, name: Option<&str>, key: Option<&str>) -> SyncTarget {
        let raw = TargetConfig {
            bucket_name: name.map(str::to_string),
            bucket_name_key: key.map(str::to_string),
            local_dir: Some("dist".into()),
            enabled: true,
            delete_removed: true,
            ..Default::default()
        };
        SyncTarget::from_config(id, raw, Path::new("/work")).unwrap()
    }

    #[tokio::test]
    async fn test_literal_name_skips_lookup() {
        let outputs = counting(&[]);
        let resolver = BucketResolver::new(outputs.clone());
        let name = resolver.resolve(&target(0, Some("site"), None)).await.unwrap();
        assert_eq!(name, "site");
        assert_eq!(outputs.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_output_key_cached_per_target() {
        let outputs = counting(&[("SiteBucket", "site-prod-123")]);
        let resolver = BucketResolver::new(outputs.clone());
        let t = target(0, None, Some("SiteBucket"));

        assert_eq!(resolver.resolve(&t).await.unwrap(), "site-prod-123");
        assert_eq!(resolver.resolve(&t).await.unwrap(), "site-prod-123");
        assert_eq!(outputs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_lookup() {
        let outputs = counting(&[("SiteBucket", "site")]);
        let resolver = BucketResolver::new(outputs.clone());
        let t = target(3, None, Some("SiteBucket"));

        let (a, b, c) = tokio::join!(resolver.resolve(&t), resolver.resolve(&t), resolver.resolve(&t));
        assert_eq!(a.unwrap(), "site");
        assert_eq!(b.unwrap(), "site");
        assert_eq!(c.unwrap(), "site");
        assert_eq!(outputs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_output_is_resolution_error() {
        let outputs = counting(&[]);
        let resolver = BucketResolver::new(outputs);
        let err = resolver
            .resolve(&target(0, None, Some("Missing")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Resolution(_)));
    }
}
