//! 同步目标与目标集合

use crate::config::TargetConfig;
use crate::core::rules::RuleSet;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// 存储桶标识：直接给出名称，或引用外部输出键
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketIdentity {
    Name(String),
    OutputKey(String),
}

impl BucketIdentity {
    /// 直接名称或输出键本身
    pub fn label(&self) -> &str {
        match self {
            BucketIdentity::Name(name) => name,
            BucketIdentity::OutputKey(key) => key,
        }
    }
}

impl fmt::Display for BucketIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketIdentity::Name(name) => write!(f, "{}", name),
            BucketIdentity::OutputKey(key) => write!(f, "${{{}}}", key),
        }
    }
}

/// 预设访问控制
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessControl {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    AwsExecRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
}

impl AccessControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessControl::Private => "private",
            AccessControl::PublicRead => "public-read",
            AccessControl::PublicReadWrite => "public-read-write",
            AccessControl::AuthenticatedRead => "authenticated-read",
            AccessControl::AwsExecRead => "aws-exec-read",
            AccessControl::BucketOwnerRead => "bucket-owner-read",
            AccessControl::BucketOwnerFullControl => "bucket-owner-full-control",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        serde_json::from_value(Value::String(value.to_string()))
            .map_err(|_| SyncError::Configuration(format!("未知的 ACL: {}", value)))
    }
}

/// 一个同步单元：本地目录 <-> 存储桶前缀
#[derive(Debug, Clone)]
pub struct SyncTarget {
    /// 在配置中的位置，用于区分同名目标
    pub id: usize,
    pub bucket: BucketIdentity,
    /// 不带首尾斜杠
    pub prefix: String,
    pub local_dir: PathBuf,
    pub acl: AccessControl,
    pub follow_symlinks: bool,
    pub delete_removed: bool,
    pub default_content_type: Option<String>,
    pub enabled: bool,
    pub pre_command: Option<String>,
    pub rules: RuleSet,
    pub bucket_tags: Option<BTreeMap<String, String>>,
}

impl SyncTarget {
    /// 校验并构造，相对路径基于 `base_dir`
    pub fn from_config(id: usize, raw: TargetConfig, base_dir: &Path) -> Result<Self> {
        let bucket = match (raw.bucket_name, raw.bucket_name_key) {
            (Some(name), None) if !name.is_empty() => BucketIdentity::Name(name),
            (None, Some(key)) if !key.is_empty() => BucketIdentity::OutputKey(key),
            (Some(_), Some(_)) => {
                return Err(SyncError::Configuration(
                    "bucketName 与 bucketNameKey 只能设置一个".to_string(),
                ))
            }
            _ => {
                return Err(SyncError::Configuration(
                    "缺少 bucketName 或 bucketNameKey".to_string(),
                ))
            }
        };

        let local_dir = raw
            .local_dir
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| SyncError::Configuration(format!("目标 {} 缺少 localDir", bucket)))?;
        let local_dir = if local_dir.is_absolute() {
            local_dir
        } else {
            base_dir.join(local_dir)
        };

        let acl = match raw.acl.as_deref() {
            Some(value) => AccessControl::parse(value)?,
            None => AccessControl::default(),
        };

        Ok(Self {
            id,
            bucket,
            prefix: normalize_prefix(&raw.bucket_prefix),
            local_dir,
            acl,
            follow_symlinks: raw.follow_symlinks,
            delete_removed: raw.delete_removed,
            default_content_type: raw.default_content_type,
            enabled: raw.enabled,
            pre_command: raw.pre_command.filter(|c| !c.trim().is_empty()),
            rules: RuleSet::from_values(&raw.params)?,
            bucket_tags: raw.bucket_tags,
        })
    }

    /// 日志中使用的名称
    pub fn label(&self) -> String {
        if self.prefix.is_empty() {
            self.bucket.to_string()
        } else {
            format!("{}/{}", self.bucket, self.prefix)
        }
    }

    /// 相对路径对应的对象键
    pub fn key_for(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }

    /// 列举远程对象时使用的前缀
    pub fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }
}

/// 去掉首尾斜杠，对象键不以 `/` 开头
pub fn normalize_prefix(prefix: &str) -> String {
    prefix.trim().trim_matches('/').to_string()
}

/// 无效目标：只影响自己
#[derive(Debug)]
pub struct InvalidTarget {
    pub id: usize,
    pub label: String,
    pub error: SyncError,
}

#[derive(Debug)]
pub enum TargetEntry {
    Valid(SyncTarget),
    Invalid(InvalidTarget),
}

impl TargetEntry {
    pub fn id(&self) -> usize {
        match self {
            TargetEntry::Valid(t) => t.id,
            TargetEntry::Invalid(t) => t.id,
        }
    }

    pub fn label(&self) -> String {
        match self {
            TargetEntry::Valid(t) => t.label(),
            TargetEntry::Invalid(t) => t.label.clone(),
        }
    }

    fn matches_bucket(&self, bucket: &str) -> bool {
        match self {
            TargetEntry::Valid(t) => t.bucket.label() == bucket,
            TargetEntry::Invalid(t) => t.label == bucket,
        }
    }
}

/// 有序的目标集合，禁用的目标在构建时直接丢弃
#[derive(Debug, Default)]
pub struct TargetSet {
    entries: Vec<TargetEntry>,
}

impl TargetSet {
    pub fn from_values(values: &[Value], base_dir: &Path) -> Self {
        let mut entries = Vec::new();

        for (id, value) in values.iter().enumerate() {
            let raw = match TargetConfig::from_value(value) {
                Ok(raw) => raw,
                Err(error) => {
                    // 连 enabled 都读不出来时，无法判断是否禁用
                    let enabled = value.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                    if enabled {
                        entries.push(TargetEntry::Invalid(InvalidTarget {
                            id,
                            label: raw_label(value, id),
                            error,
                        }));
                    }
                    continue;
                }
            };

            if !raw.enabled {
                tracing::debug!("跳过已禁用的目标 #{}", id);
                continue;
            }

            let label = raw
                .bucket_name
                .clone()
                .or_else(|| raw.bucket_name_key.clone())
                .unwrap_or_else(|| format!("target#{}", id));

            match SyncTarget::from_config(id, raw, base_dir) {
                Ok(target) => entries.push(TargetEntry::Valid(target)),
                Err(error) => {
                    tracing::warn!("目标 {} 配置无效: {}", label, error);
                    entries.push(TargetEntry::Invalid(InvalidTarget { id, label, error }));
                }
            }
        }

        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 所有启用的目标
    pub fn iter(&self) -> impl Iterator<Item = &TargetEntry> {
        self.entries.iter()
    }

    /// 只选出指定存储桶的目标，`None` 表示全部
    pub fn select(&self, bucket: Option<&str>) -> Vec<&TargetEntry> {
        match bucket {
            Some(bucket) => self
                .entries
                .iter()
                .filter(|e| e.matches_bucket(bucket))
                .collect(),
            None => self.entries.iter().collect(),
        }
    }
}

fn raw_label(value: &Value, id: usize) -> String {
    ["bucketName", "bucketNameKey"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("target#{}", id))
}
