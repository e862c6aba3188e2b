//! 应用配置模块

use crate::error::{Result, SyncError};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "bucketsync.json";

/// 运行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// 当前环境，用于 OnlyForEnv 规则
    #[serde(default = "default_stage")]
    pub stage: String,
    /// 跳过本次运行的所有同步操作
    #[serde(default)]
    pub no_sync: bool,
    /// 对象存储地址覆盖
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// 输出键 -> 值，供 bucketNameKey 解析
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// 目标原样保留，逐个解析，单个目标出错不影响其它目标
    #[serde(default)]
    pub targets: Vec<Value>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_stage() -> String {
    "dev".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            stage: default_stage(),
            no_sync: false,
            endpoint: None,
            region: None,
            outputs: HashMap::new(),
            targets: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SyncError::Configuration(format!("配置文件格式错误: {}", e)))
    }
}

/// 单个同步目标的原始配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub bucket_name: Option<String>,
    /// 外部输出键，运行时解析为存储桶名
    pub bucket_name_key: Option<String>,
    #[serde(default)]
    pub bucket_prefix: String,
    pub local_dir: Option<PathBuf>,
    #[serde(default)]
    pub acl: Option<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_true")]
    pub delete_removed: bool,
    pub default_content_type: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub pre_command: Option<String>,
    /// `[{ "<glob>": { ... } }, ...]`
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub bucket_tags: Option<BTreeMap<String, String>>,
}

fn default_true() -> bool {
    true
}

impl TargetConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| SyncError::Configuration(format!("目标配置格式错误: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_defaults() {
        let config = AppConfig::parse(r#"{ "targets": [] }"#).unwrap();
        assert_eq!(config.stage, "dev");
        assert!(!config.no_sync);
        assert!(config.endpoint.is_none());
        assert!(config.log.enabled);
    }

    #[test]
    fn test_target_defaults() {
        let value = serde_json::json!({ "bucketName": "site", "localDir": "dist" });
        let target = TargetConfig::from_value(&value).unwrap();
        assert_eq!(target.bucket_name.as_deref(), Some("site"));
        assert!(target.delete_removed);
        assert!(target.enabled);
        assert!(!target.follow_symlinks);
        assert_eq!(target.bucket_prefix, "");
        assert!(target.params.is_empty());
    }

    #[test]
    fn test_bad_target_is_isolated() {
        let config = AppConfig::parse(
            r#"{
                "stage": "prod",
                "noSync": true,
                "targets": [
                    { "bucketName": "ok", "localDir": "a" },
                    { "bucketName": "bad", "enabled": "yes" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.stage, "prod");
        assert!(config.no_sync);
        assert!(TargetConfig::from_value(&config.targets[0]).is_ok());
        assert!(matches!(
            TargetConfig::from_value(&config.targets[1]),
            Err(SyncError::Configuration(_))
        ));
    }
}
