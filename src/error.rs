//! 错误类型
//!
//! 每一类错误只影响出错的同步目标，其它目标照常执行。

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 缺少 localDir、缺少存储桶标识、规则格式不正确等
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 输出键查找失败
    #[error("无法解析存储桶: {0}")]
    Resolution(String),

    /// 上传、删除、复制或列举失败
    #[error("传输失败 [{key}]: {message}")]
    Transfer { key: String, message: String },

    /// 读取或写入存储桶标签失败
    #[error("存储桶标签操作失败 [{bucket}]: {message}")]
    TagOperation { bucket: String, message: String },

    /// 前置命令返回非零状态
    #[error("前置命令执行失败 `{command}`: {status}")]
    PreCommand { command: String, status: String },

    #[error("本地文件错误 {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn transfer(key: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Transfer {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn tags(bucket: impl Into<String>, message: impl ToString) -> Self {
        SyncError::TagOperation {
            bucket: bucket.into(),
            message: message.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// 错误类别，用于汇总日志
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::Resolution(_) => "resolution",
            SyncError::Transfer { .. } => "transfer",
            SyncError::TagOperation { .. } => "tag-operation",
            SyncError::PreCommand { .. } => "pre-command",
            SyncError::Io { .. } => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
