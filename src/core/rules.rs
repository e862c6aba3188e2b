//! 规则匹配 - 按声明顺序把 glob 规则的参数合并到每个文件上

use crate::error::{Result, SyncError};
use globset::{GlobBuilder, GlobMatcher};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 保留的控制键：只在指定环境下包含该文件，永远不会传给存储层
pub const ONLY_FOR_ENV: &str = "OnlyForEnv";

/// 对象参数（缓存头、自定义头、ACL 等），键对本模块不透明
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectParams(BTreeMap<String, Value>);

impl ObjectParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// 取字符串值，非字符串值返回 None
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// 浅合并：同名键由 `other` 覆盖
    pub fn merge_from(&mut self, other: &ObjectParams) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, Value)> for ObjectParams {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 单条规则：相对 localDir 的 glob 模式 + 参数
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    /// `*` 不跨越 `/`，任意深度需写成 `**/*.js`
    matcher: GlobMatcher,
    only_for_env: Option<String>,
    params: ObjectParams,
}

impl Rule {
    pub fn new(pattern: &str, props: Map<String, Value>) -> Result<Self> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|e| SyncError::Configuration(format!("无效的规则模式 `{}`: {}", pattern, e)))?;

        let mut only_for_env = None;
        let mut params = ObjectParams::new();
        for (key, value) in props {
            if key == ONLY_FOR_ENV {
                let env = value.as_str().ok_or_else(|| {
                    SyncError::Configuration(format!(
                        "规则 `{}` 的 {} 必须是字符串",
                        pattern, ONLY_FOR_ENV
                    ))
                })?;
                only_for_env = Some(env.to_string());
            } else {
                params.insert(key, value);
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
            only_for_env,
            params,
        })
    }

    /// 从配置中的 `{ "<glob>": { ... } }` 解析
    pub fn from_value(value: &Value) -> Result<Self> {
        let entry = value
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| {
                SyncError::Configuration(format!("规则必须是只有一个键的对象: {}", value))
            })?;

        let (pattern, props) = entry
            .iter()
            .next()
            .ok_or_else(|| SyncError::Configuration("规则为空".to_string()))?;

        let props = props.as_object().cloned().ok_or_else(|| {
            SyncError::Configuration(format!("规则 `{}` 的参数必须是对象", pattern))
        })?;

        Self::new(pattern, props)
    }

    /// `relative` 使用 `/` 分隔，相对同步根目录
    pub fn matches(&self, relative: &str) -> bool {
        self.matcher.is_match(relative)
    }
}

/// 规则匹配结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleMatch {
    /// 合并后的参数，不含控制键
    pub params: ObjectParams,
    /// 至少命中一条规则
    pub matched: bool,
    /// OnlyForEnv 与当前环境不符时为 false
    pub included: bool,
}

/// 有序规则集合
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn from_values(values: &[Value]) -> Result<Self> {
        let rules = values
            .iter()
            .map(Rule::from_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// 按声明顺序应用所有命中的规则，后面的规则覆盖前面的同名键
    pub fn evaluate(&self, relative: &str, stage: &str) -> RuleMatch {
        let mut params = ObjectParams::new();
        let mut only_for_env: Option<&str> = None;
        let mut matched = false;

        for rule in self.rules.iter().filter(|r| r.matches(relative)) {
            matched = true;
            tracing::trace!("规则 {} 命中 {}", rule.pattern, relative);
            params.merge_from(&rule.params);
            if let Some(env) = rule.only_for_env.as_deref() {
                only_for_env = Some(env);
            }
        }

        let included = only_for_env.map_or(true, |env| env == stage);

        RuleMatch {
            params,
            matched,
            included,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rules(value: Value) -> RuleSet {
        RuleSet::from_values(value.as_array().unwrap()).unwrap()
    }

    #[test]
    fn test_later_rule_wins() {
        let set = rules(json!([
            { "*.js": { "CacheControl": "no-cache", "ContentEncoding": "gzip" } },
            { "app.js": { "CacheControl": "public, max-age=31536000" } }
        ]));

        let result = set.evaluate("app.js", "dev");
        assert!(result.matched);
        assert!(result.included);
        assert_eq!(
            result.params.get_str("CacheControl"),
            Some("public, max-age=31536000")
        );
        assert_eq!(result.params.get_str("ContentEncoding"), Some("gzip"));
    }

    #[test]
    fn test_cache_control_only_for_matching_files() {
        let set = rules(json!([
            { "*.js": { "CacheControl": "public, max-age=31536000" } }
        ]));

        let js = set.evaluate("app.js", "dev");
        assert_eq!(
            js.params.get_str("CacheControl"),
            Some("public, max-age=31536000")
        );

        let html = set.evaluate("index.html", "dev");
        assert!(!html.matched);
        assert!(html.included);
        assert!(html.params.is_empty());
    }

    #[test]
    fn test_only_for_env_stripped_when_only_key() {
        let set = rules(json!([{ "index.html": { "OnlyForEnv": "prod" } }]));

        let result = set.evaluate("index.html", "prod");
        assert!(result.included);
        assert!(result.params.is_empty());
        assert!(!result.params.contains_key(ONLY_FOR_ENV));
    }

    #[test]
    fn test_only_for_env_mismatch_excludes() {
        let set = rules(json!([
            { "robots.txt": { "OnlyForEnv": "prod", "CacheControl": "no-cache" } }
        ]));

        let result = set.evaluate("robots.txt", "dev");
        assert!(!result.included);
        assert!(!result.params.contains_key(ONLY_FOR_ENV));

        let included = set.evaluate("robots.txt", "prod");
        assert!(included.included);
        assert_eq!(included.params.get_str("CacheControl"), Some("no-cache"));
        assert_eq!(included.params.len(), 1);
    }

    #[test]
    fn test_later_only_for_env_overrides_earlier() {
        let set = rules(json!([
            { "**": { "OnlyForEnv": "prod" } },
            { "*.html": { "OnlyForEnv": "dev" } }
        ]));

        assert!(set.evaluate("index.html", "dev").included);
        assert!(!set.evaluate("index.html", "prod").included);
        assert!(!set.evaluate("app.js", "dev").included);
    }

    #[test]
    fn test_glob_forms() {
        let set = rules(json!([
            { "assets/**": { "CacheControl": "immutable" } },
            { "**/*.css": { "ContentType": "text/css" } }
        ]));

        let deep = set.evaluate("assets/img/logo.png", "dev");
        assert_eq!(deep.params.get_str("CacheControl"), Some("immutable"));

        let nested_css = set.evaluate("styles/site.css", "dev");
        assert_eq!(nested_css.params.get_str("ContentType"), Some("text/css"));
        assert!(!nested_css.params.contains_key("CacheControl"));

        let root_css = set.evaluate("site.css", "dev");
        assert_eq!(root_css.params.get_str("ContentType"), Some("text/css"));

        assert!(!set.evaluate("index.html", "dev").matched);
    }

    #[test]
    fn test_single_star_stays_at_root() {
        let set = rules(json!([
            { "*.js": { "CacheControl": "x" } },
            { "index.html": { "OnlyForEnv": "prod" } }
        ]));

        let nested = set.evaluate("assets/app.js", "dev");
        assert!(!nested.matched);
        assert!(nested.params.is_empty());
        assert!(set.evaluate("app.js", "dev").matched);

        let docs = set.evaluate("docs/index.html", "dev");
        assert!(!docs.matched);
        assert!(docs.included);
        assert!(!set.evaluate("index.html", "dev").included);
    }

    #[test]
    fn test_anchored_pattern_does_not_match_base_name() {
        let set = rules(json!([{ "js/*.js": { "CacheControl": "x" } }]));
        assert!(set.evaluate("js/app.js", "dev").matched);
        assert!(!set.evaluate("vendor/js/app.js", "dev").matched);
        assert!(!set.evaluate("app.js", "dev").matched);
    }

    #[test]
    fn test_malformed_rules_rejected() {
        let bad = [
            json!({ "*.js": {}, "*.css": {} }),
            json!("*.js"),
            json!({ "*.js": "no-cache" }),
            json!({ "[": {} }),
            json!({ "*.js": { "OnlyForEnv": 1 } }),
        ];
        for value in bad {
            let err = Rule::from_value(&value).unwrap_err();
            assert!(matches!(err, SyncError::Configuration(_)), "{value}");
        }
    }
}
