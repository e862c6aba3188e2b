use crate::core::rules::{ObjectParams, RuleSet};
use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 本地文件及其规则匹配结果
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
    /// 相对同步根目录，使用 `/` 分隔
    pub relative: String,
    pub size: u64,
    pub params: ObjectParams,
    /// 至少命中一条规则
    pub matched: bool,
    /// OnlyForEnv 与当前环境不符
    pub excluded: bool,
}

impl LocalFile {
    /// 规则中的 ContentType 优先，其次按文件名推断，最后使用目标的默认值
    pub fn content_type(&self, default: Option<&str>) -> Option<String> {
        if let Some(explicit) = self.params.get_str("ContentType") {
            return Some(explicit.to_string());
        }
        mime_guess::from_path(&self.path)
            .first_raw()
            .map(str::to_string)
            .or_else(|| default.map(str::to_string))
    }
}

/// 规范化路径分隔符（统一使用 /）
fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// 递归列出目录下的所有文件，跳过无法读取的条目；结果按路径排序
pub async fn list_files_recursive(dir: &Path, follow_symlinks: bool) -> Result<Vec<PathBuf>> {
    let metadata = tokio::fs::metadata(dir)
        .await
        .map_err(|e| SyncError::io(dir, e))?;
    if !metadata.is_dir() {
        return Err(SyncError::Configuration(format!(
            "localDir 不是目录: {}",
            dir.display()
        )));
    }

    let root = dir.to_path_buf();

    // 使用 spawn_blocking 避免阻塞 async runtime
    let mut files: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .follow_links(follow_symlinks)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("跳过无法读取的条目: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    })
    .await
    .map_err(|e| SyncError::io(dir, std::io::Error::other(e)))?;

    files.sort();
    Ok(files)
}

/// 扫描本地目录并对每个文件应用规则
pub async fn scan_local_tree(
    dir: &Path,
    follow_symlinks: bool,
    rules: &RuleSet,
    stage: &str,
) -> Result<Vec<LocalFile>> {
    info!("开始扫描本地目录: {}", dir.display());

    let paths = list_files_recursive(dir, follow_symlinks).await?;
    let mut files = Vec::with_capacity(paths.len());
    let mut excluded_count = 0;

    for path in paths {
        let Some(relative) = path.strip_prefix(dir).ok().and_then(|p| p.to_str()) else {
            warn!("跳过无法转换的路径: {}", path.display());
            continue;
        };
        let relative = normalize_path(relative);

        let size = match tokio::fs::metadata(&path).await {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("跳过无法读取的文件: {} ({})", path.display(), e);
                continue;
            }
        };

        let result = rules.evaluate(&relative, stage);
        if !result.included {
            debug!("按环境排除文件: {}", relative);
            excluded_count += 1;
        }

        files.push(LocalFile {
            path,
            relative,
            size,
            params: result.params,
            matched: result.matched,
            excluded: !result.included,
        });
    }

    info!(
        "扫描完成: {} 个文件, {} 个按环境排除",
        files.len(),
        excluded_count
    );

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;

    #[tokio::test]
    async fn test_list_files_sorted_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("js/vendor")).unwrap();
        fs::write(dir.path().join("index.html"), "<html>").unwrap();
        fs::write(dir.path().join("js/app.js"), "1").unwrap();
        fs::write(dir.path().join("js/vendor/lib.js"), "2").unwrap();

        let files = list_files_recursive(dir.path(), false).await.unwrap();
        let relative: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(relative, vec!["index.html", "js/app.js", "js/vendor/lib.js"]);
        assert!(files.iter().all(|p| p.is_absolute()));
    }

    #[tokio::test]
    async fn test_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_files_recursive(&dir.path().join("nope"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }

    #[tokio::test]
    async fn test_scan_applies_rules() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html>").unwrap();
        fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        fs::write(dir.path().join("robots.txt"), "x").unwrap();

        let rules = RuleSet::from_values(&[
            json!({ "*.js": { "CacheControl": "public, max-age=31536000" } }),
            json!({ "robots.txt": { "OnlyForEnv": "prod" } }),
        ])
        .unwrap();

        let files = scan_local_tree(dir.path(), false, &rules, "dev").await.unwrap();
        assert_eq!(files.len(), 3);

        let app = files.iter().find(|f| f.relative == "app.js").unwrap();
        assert_eq!(app.size, 14);
        assert!(app.matched);
        assert_eq!(
            app.params.get_str("CacheControl"),
            Some("public, max-age=31536000")
        );

        let robots = files.iter().find(|f| f.relative == "robots.txt").unwrap();
        assert!(robots.excluded);

        let index = files.iter().find(|f| f.relative == "index.html").unwrap();
        assert!(!index.matched);
        assert!(!index.excluded);
    }

    #[test]
    fn test_content_type_precedence() {
        let mut file = LocalFile {
            path: PathBuf::from("/site/index.html"),
            relative: "index.html".to_string(),
            size: 0,
            params: ObjectParams::new(),
            matched: false,
            excluded: false,
        };
        assert_eq!(
            file.content_type(Some("application/octet-stream")).as_deref(),
            Some("text/html")
        );

        file.params.insert("ContentType", json!("text/plain"));
        assert_eq!(file.content_type(None).as_deref(), Some("text/plain"));

        let unknown = LocalFile {
            path: PathBuf::from("/site/LICENSE"),
            relative: "LICENSE".to_string(),
            params: ObjectParams::new(),
            ..file
        };
        assert_eq!(
            unknown.content_type(Some("text/plain")).as_deref(),
            Some("text/plain")
        );
        assert_eq!(unknown.content_type(None), None);
    }
}
