//! Configuration for the page cache.
//!
//! Settings are read once, at layer construction, from a [`ConfigSource`]
//! addressed by dotted paths such as `pgcache.lifetime`. The typed result,
//! [`PageCacheConfig`], is immutable afterwards and shared by every request.
//!
//! ```
//! use tower_page_cache::config::{JsonConfig, PageCacheConfig};
//!
//! let source = JsonConfig::new(serde_json::json!({
//!     "pgcache": { "lifetime": 600, "cache": { "query": false } },
//!     "browsercache.html.compression": true,
//! }));
//! let config = PageCacheConfig::from_source(&source);
//! assert_eq!(config.lifetime.as_secs(), 600);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CacheError;

/// Read-only key/value configuration addressed by dotted paths.
pub trait ConfigSource: Send + Sync {
    fn get_boolean(&self, key: &str) -> Option<bool>;
    fn get_integer(&self, key: &str) -> Option<i64>;
    fn get_string(&self, key: &str) -> Option<String>;
    fn get_array(&self, key: &str) -> Option<Vec<String>>;

    /// Returns a structured block (group definitions, engine settings).
    fn get_section(&self, _key: &str) -> Option<Value> {
        None
    }
}

/// [`ConfigSource`] over a JSON document.
///
/// A dotted path resolves through nested objects, and a literal dotted key
/// at any nesting level resolves as well, so `{"pgcache.lifetime": 60}` and
/// `{"pgcache": {"lifetime": 60}}` are equivalent.
#[derive(Debug, Clone, Default)]
pub struct JsonConfig {
    root: Value,
}

impl JsonConfig {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        serde_json::from_str(raw)
            .map(Self::new)
            .map_err(|err| CacheError::Config(err.to_string()))
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        lookup(&self.root, key)
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(found) = value.get(path) {
        return Some(found);
    }
    for (idx, _) in path.match_indices('.') {
        if let Some(child) = value.get(&path[..idx]) {
            if let Some(found) = lookup(child, &path[idx + 1..]) {
                return Some(found);
            }
        }
    }
    None
}

impl ConfigSource for JsonConfig {
    fn get_boolean(&self, key: &str) -> Option<bool> {
        match self.lookup(key)? {
            Value::Bool(flag) => Some(*flag),
            Value::Number(number) => number.as_i64().map(|n| n != 0),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn get_integer(&self, key: &str) -> Option<i64> {
        match self.lookup(key)? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            Value::Bool(flag) => Some(i64::from(*flag)),
            _ => None,
        }
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self.lookup(key)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }

    fn get_array(&self, key: &str) -> Option<Vec<String>> {
        match self.lookup(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(text.clone()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect(),
            ),
            // Textarea style: one entry per line.
            Value::String(text) => Some(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_owned)
                    .collect(),
            ),
            _ => None,
        }
    }

    fn get_section(&self, key: &str) -> Option<Value> {
        self.lookup(key).cloned()
    }
}

/// Case-insensitive regular expressions compiled once from configuration.
///
/// A pattern that fails to compile is logged and dropped, so it behaves as
/// a pattern that never matches.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for pattern in patterns {
            match compile(pattern.as_ref()) {
                Ok(Some(regex)) => compiled.push(regex),
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "ignoring page cache pattern"),
            }
        }
        Self { patterns: compiled }
    }

    /// Strict variant of [`PatternSet::new`] that reports the first bad pattern.
    pub fn try_new<I, S>(patterns: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for pattern in patterns {
            if let Some(regex) = compile(pattern.as_ref())? {
                compiled.push(regex);
            }
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.patterns.iter().any(|regex| regex.is_match(haystack))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>, CacheError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|source| CacheError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })
}

/// Storage engine selected by `pgcache.engine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Engine {
    /// Hash-keyed records on local disk.
    #[default]
    File,
    /// Raw pages on disk at URL-shaped paths for direct web-server serving.
    FileGeneric,
    Memcached,
    /// Raw pages in Memcached under URL-shaped keys read by a reverse proxy.
    NginxMemcached,
    Redis,
    /// Process-local store.
    Memory,
}

impl Engine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "file_generic" => Some(Self::FileGeneric),
            "memcached" => Some(Self::Memcached),
            "nginx_memcached" => Some(Self::NginxMemcached),
            "redis" => Some(Self::Redis),
            "memory" | "apc" | "apcu" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Enhanced mode: the engine serves bytes without calling back into
    /// the application.
    pub fn is_enhanced(self) -> bool {
        matches!(self, Self::FileGeneric)
    }

    /// Whether keys are URL-shaped paths rather than hashes.
    pub fn uses_path_keys(self) -> bool {
        matches!(self, Self::FileGeneric | Self::NginxMemcached)
    }
}

/// Browser cache header policy for cached HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserCachePolicy {
    Cache,
    #[default]
    CachePublicMaxage,
    CacheValidation,
    CacheNoproxy,
    CacheMaxage,
    NoCache,
    NoStore,
}

impl BrowserCachePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "cache" => Some(Self::Cache),
            "cache_public_maxage" => Some(Self::CachePublicMaxage),
            "cache_validation" => Some(Self::CacheValidation),
            "cache_noproxy" => Some(Self::CacheNoproxy),
            "cache_maxage" => Some(Self::CacheMaxage),
            "no_cache" => Some(Self::NoCache),
            "no_store" => Some(Self::NoStore),
            _ => None,
        }
    }
}

/// `browsercache.*` settings for HTML responses.
#[derive(Debug, Clone)]
pub struct BrowserCacheConfig {
    pub enabled: bool,
    pub gzip: bool,
    pub deflate: bool,
    pub brotli: bool,
    pub last_modified: bool,
    pub expires: bool,
    pub cache_control: bool,
    pub policy: BrowserCachePolicy,
    pub lifetime: Duration,
    pub etag: bool,
    pub powered_by: bool,
}

impl Default for BrowserCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gzip: true,
            deflate: false,
            brotli: false,
            last_modified: true,
            expires: false,
            cache_control: true,
            policy: BrowserCachePolicy::default(),
            lifetime: Duration::from_secs(3600),
            etag: true,
            powered_by: false,
        }
    }
}

/// A cookie group: requests carrying a matching cookie get their own
/// variant, or are refused when `cache` is off.
#[derive(Debug, Clone)]
pub struct CookieGroup {
    pub name: String,
    pub enabled: bool,
    pub cache: bool,
    pattern: Option<Regex>,
}

impl CookieGroup {
    /// Builds a group from cookie entries: `name` matches any value,
    /// `name=value` matches exactly (both as case-insensitive regex
    /// fragments).
    pub fn new<I, S>(name: impl Into<String>, cookies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alternatives: Vec<String> = cookies
            .into_iter()
            .map(|entry| entry.as_ref().trim().to_owned())
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let entry = entry.replace('+', " ");
                if entry.contains('=') {
                    entry
                } else {
                    format!("{entry}=.*")
                }
            })
            .collect();
        let name = name.into();
        let pattern = if alternatives.is_empty() {
            None
        } else {
            let source = format!("^({})$", alternatives.join("|"));
            match compile(&source) {
                Ok(regex) => regex,
                Err(err) => {
                    tracing::warn!(group = %name, error = %err, "ignoring cookie group pattern");
                    None
                }
            }
        };
        Self {
            name,
            enabled: true,
            cache: true,
            pattern,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Tests a `name=value` cookie pair.
    pub fn matches(&self, pair: &str) -> bool {
        self.pattern.as_ref().is_some_and(|regex| regex.is_match(pair))
    }
}

/// A user-agent or referrer class.
#[derive(Debug, Clone)]
pub struct ClassifierGroup {
    pub name: String,
    pub enabled: bool,
    patterns: PatternSet,
}

impl ClassifierGroup {
    pub fn new<I, S>(name: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            enabled: true,
            patterns: PatternSet::new(patterns),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn matches(&self, value: &str) -> bool {
        self.enabled && !value.is_empty() && self.patterns.is_match(value)
    }
}

#[derive(Debug, Clone)]
pub struct FileEngineConfig {
    pub cache_dir: PathBuf,
}

impl Default for FileEngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache/page"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemcachedEngineConfig {
    pub servers: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub persistent: bool,
    pub timeout: Duration,
    pub namespace: String,
}

impl Default for MemcachedEngineConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:11211".to_owned()],
            username: None,
            password: None,
            persistent: true,
            timeout: Duration::from_secs(1),
            namespace: "page_cache".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisEngineConfig {
    pub servers: Vec<String>,
    pub password: Option<String>,
    pub database: i64,
    pub verify_tls: bool,
    pub timeout: Duration,
    pub persistent: bool,
    pub namespace: String,
}

impl Default for RedisEngineConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:6379".to_owned()],
            password: None,
            database: 0,
            verify_tls: true,
            timeout: Duration::from_secs(1),
            persistent: true,
            namespace: "page_cache".to_owned(),
        }
    }
}

/// Opaque per-engine blocks handed to the backend factory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub use_expired_data: bool,
    /// How long an expired record stays readable as stale.
    pub stale_retention: Duration,
    pub memory_capacity: u64,
    pub file: FileEngineConfig,
    pub memcached: MemcachedEngineConfig,
    pub redis: RedisEngineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_expired_data: false,
            stale_retention: Duration::from_secs(3600),
            memory_capacity: 10_000,
            file: FileEngineConfig::default(),
            memcached: MemcachedEngineConfig::default(),
            redis: RedisEngineConfig::default(),
        }
    }
}

/// Typed page cache configuration.
#[derive(Debug, Clone)]
pub struct PageCacheConfig {
    pub engine: Engine,
    pub lifetime: Duration,
    pub debug: bool,
    pub late_init: bool,
    pub late_caching: bool,
    pub serve_stale: bool,

    pub cache_ssl: bool,
    pub cache_query: bool,
    pub cache_404: bool,
    pub cache_home: bool,
    pub cache_feed: bool,
    pub cache_rest: bool,
    pub rest_prefix: String,
    pub nginx_handle_xml: bool,
    pub cache_headers: Vec<String>,

    pub reject_front_page: bool,
    pub reject_request_head: bool,
    pub reject_logged: bool,
    pub reject_logged_roles: bool,
    pub reject_roles: Vec<String>,
    pub role_salt: String,
    pub reject_uri: PatternSet,
    pub reject_ua: Vec<String>,
    pub reject_cookie: Vec<String>,
    pub reject_categories: Vec<String>,
    pub reject_tags: Vec<String>,
    pub reject_authors: Vec<String>,
    pub reject_custom: PatternSet,

    pub accept_files: PatternSet,
    pub accept_qs: Vec<String>,
    pub sitemap: PatternSet,

    pub cookie_groups: Vec<CookieGroup>,
    pub mobile_groups: Vec<ClassifierGroup>,
    pub referrer_groups: Vec<ClassifierGroup>,

    pub browser: BrowserCacheConfig,

    pub dynamic_secret: Option<String>,
    pub dynamic_include_root: Option<PathBuf>,

    pub engines: EngineConfig,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            lifetime: Duration::from_secs(3600),
            debug: false,
            late_init: false,
            late_caching: false,
            serve_stale: false,
            cache_ssl: true,
            cache_query: false,
            cache_404: false,
            cache_home: true,
            cache_feed: false,
            cache_rest: false,
            rest_prefix: "/wp-json/".to_owned(),
            nginx_handle_xml: false,
            cache_headers: vec![
                "content-type".to_owned(),
                "x-pingback".to_owned(),
                "link".to_owned(),
            ],
            reject_front_page: false,
            reject_request_head: false,
            reject_logged: true,
            reject_logged_roles: false,
            reject_roles: Vec::new(),
            role_salt: String::new(),
            reject_uri: PatternSet::default(),
            reject_ua: Vec::new(),
            reject_cookie: Vec::new(),
            reject_categories: Vec::new(),
            reject_tags: Vec::new(),
            reject_authors: Vec::new(),
            reject_custom: PatternSet::default(),
            accept_files: PatternSet::default(),
            accept_qs: Vec::new(),
            sitemap: PatternSet::new([r"([a-z0-9_\-]*?)sitemap([a-z0-9_\-]*)?\.xml"]),
            cookie_groups: Vec::new(),
            mobile_groups: Vec::new(),
            referrer_groups: Vec::new(),
            browser: BrowserCacheConfig::default(),
            dynamic_secret: None,
            dynamic_include_root: None,
            engines: EngineConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct CookieGroupDef {
    #[serde(default = "yes")]
    enabled: bool,
    #[serde(default = "yes")]
    cache: bool,
    #[serde(default)]
    cookies: Vec<String>,
}

#[derive(Deserialize)]
struct ClassifierGroupDef {
    #[serde(default = "yes")]
    enabled: bool,
    #[serde(default, alias = "agents", alias = "referrers")]
    patterns: Vec<String>,
}

fn yes() -> bool {
    true
}

/// Accepts `{"name": {...}}` or `[{"name": "...", ...}]`.
fn named_sections<T: DeserializeOwned>(section: Value) -> Vec<(String, T)> {
    let entries: Vec<(String, Value)> = match section {
        Value::Object(map) => map.into_iter().collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?.to_owned();
                Some((name, item))
            })
            .collect(),
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|(name, value)| match serde_json::from_value(value) {
            Ok(def) => Some((name, def)),
            Err(err) => {
                tracing::warn!(group = %name, error = %err, "ignoring malformed group definition");
                None
            }
        })
        .collect()
}

fn classifier_groups(source: &dyn ConfigSource, enabled_key: &str, groups_key: &str) -> Vec<ClassifierGroup> {
    if !source.get_boolean(enabled_key).unwrap_or(false) {
        return Vec::new();
    }
    source
        .get_section(groups_key)
        .map(named_sections::<ClassifierGroupDef>)
        .unwrap_or_default()
        .into_iter()
        .map(|(name, def)| ClassifierGroup::new(name, def.patterns).with_enabled(def.enabled))
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

impl PageCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every recognised key from `source`, falling back to defaults.
    /// Strict variant of [`PageCacheConfig::from_source`]: fails on the
    /// first regular expression that does not compile instead of dropping it.
    pub fn try_from_source(source: &dyn ConfigSource) -> Result<Self, CacheError> {
        for key in ["pgcache.reject.uri", "pgcache.reject.custom", "pgcache.accept.files"] {
            PatternSet::try_new(source.get_array(key).unwrap_or_default())?;
        }
        if let Some(pattern) = source.get_string("pgcache.purge.sitemap_regex") {
            PatternSet::try_new([pattern])?;
        }
        Ok(Self::from_source(source))
    }

    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| source.get_boolean(key).unwrap_or(default);
        let list = |key: &str| source.get_array(key).unwrap_or_default();
        let seconds = |key: &str, default: Duration| {
            source
                .get_integer(key)
                .map(|secs| Duration::from_secs(secs.max(0) as u64))
                .unwrap_or(default)
        };

        let engine = match source.get_string("pgcache.engine") {
            Some(raw) => Engine::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(engine = %raw, "unknown page cache engine, using file");
                Engine::File
            }),
            None => defaults.engine,
        };

        let cookie_groups = if flag("pgcache.cookiegroups.enabled", false) {
            source
                .get_section("pgcache.cookiegroups.groups")
                .map(named_sections::<CookieGroupDef>)
                .unwrap_or_default()
                .into_iter()
                .map(|(name, def)| {
                    CookieGroup::new(name, def.cookies)
                        .with_enabled(def.enabled)
                        .with_cache(def.cache)
                })
                .collect()
        } else {
            Vec::new()
        };

        let browser = BrowserCacheConfig {
            enabled: flag("browsercache.enabled", defaults.browser.enabled),
            gzip: flag("browsercache.html.compression", defaults.browser.gzip),
            deflate: flag("browsercache.html.deflate", defaults.browser.deflate),
            brotli: flag("browsercache.html.brotli", defaults.browser.brotli),
            last_modified: flag("browsercache.html.last_modified", defaults.browser.last_modified),
            expires: flag("browsercache.html.expires", defaults.browser.expires),
            cache_control: flag("browsercache.html.cache.control", defaults.browser.cache_control),
            policy: source
                .get_string("browsercache.html.cache.policy")
                .and_then(|raw| BrowserCachePolicy::parse(&raw))
                .unwrap_or(defaults.browser.policy),
            lifetime: seconds("browsercache.html.lifetime", defaults.browser.lifetime),
            etag: flag("browsercache.html.etag", defaults.browser.etag),
            powered_by: flag("browsercache.html.w3tc", defaults.browser.powered_by),
        };

        let sitemap = match non_empty(source.get_string("pgcache.purge.sitemap_regex")) {
            Some(pattern) => PatternSet::new([pattern]),
            None => defaults.sitemap.clone(),
        };

        let engines = EngineConfig {
            use_expired_data: flag("pgcache.use_expired_data", false),
            stale_retention: seconds("pgcache.stale_retention", defaults.engines.stale_retention),
            memory_capacity: source
                .get_integer("pgcache.memory.capacity")
                .map(|n| n.max(1) as u64)
                .unwrap_or(defaults.engines.memory_capacity),
            file: FileEngineConfig {
                cache_dir: source
                    .get_string("pgcache.file.cache_dir")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| defaults.engines.file.cache_dir.clone()),
            },
            memcached: MemcachedEngineConfig {
                servers: source
                    .get_array("pgcache.memcached.servers")
                    .filter(|servers| !servers.is_empty())
                    .unwrap_or_else(|| defaults.engines.memcached.servers.clone()),
                username: non_empty(source.get_string("pgcache.memcached.username")),
                password: non_empty(source.get_string("pgcache.memcached.password")),
                persistent: flag("pgcache.memcached.persistent", true),
                timeout: source
                    .get_integer("pgcache.memcached.timeout_ms")
                    .map(|ms| Duration::from_millis(ms.max(0) as u64))
                    .unwrap_or(defaults.engines.memcached.timeout),
                namespace: source
                    .get_string("pgcache.memcached.namespace")
                    .unwrap_or_else(|| defaults.engines.memcached.namespace.clone()),
            },
            redis: RedisEngineConfig {
                servers: source
                    .get_array("pgcache.redis.servers")
                    .filter(|servers| !servers.is_empty())
                    .unwrap_or_else(|| defaults.engines.redis.servers.clone()),
                password: non_empty(source.get_string("pgcache.redis.password")),
                database: source.get_integer("pgcache.redis.dbid").unwrap_or(0),
                verify_tls: flag("pgcache.redis.verify_tls", true),
                timeout: source
                    .get_integer("pgcache.redis.timeout_ms")
                    .map(|ms| Duration::from_millis(ms.max(0) as u64))
                    .unwrap_or(defaults.engines.redis.timeout),
                persistent: flag("pgcache.redis.persistent", true),
                namespace: source
                    .get_string("pgcache.redis.namespace")
                    .unwrap_or_else(|| defaults.engines.redis.namespace.clone()),
            },
        };

        Self {
            engine,
            lifetime: seconds("pgcache.lifetime", defaults.lifetime),
            debug: flag("pgcache.debug", defaults.debug),
            late_init: flag("pgcache.late_init", defaults.late_init),
            late_caching: flag("pgcache.late_caching", defaults.late_caching),
            serve_stale: flag("pgcache.serve_stale", defaults.serve_stale),
            cache_ssl: flag("pgcache.cache.ssl", defaults.cache_ssl),
            cache_query: flag("pgcache.cache.query", defaults.cache_query),
            cache_404: flag("pgcache.cache.404", defaults.cache_404),
            cache_home: flag("pgcache.cache.home", defaults.cache_home),
            cache_feed: flag("pgcache.cache.feed", defaults.cache_feed),
            cache_rest: source
                .get_string("pgcache.rest")
                .map(|mode| mode.trim() == "cache")
                .unwrap_or(defaults.cache_rest),
            rest_prefix: non_empty(source.get_string("pgcache.rest_prefix"))
                .unwrap_or_else(|| defaults.rest_prefix.clone()),
            nginx_handle_xml: flag("pgcache.cache.nginx_handle_xml", defaults.nginx_handle_xml),
            cache_headers: source
                .get_array("pgcache.cache.headers")
                .unwrap_or_else(|| defaults.cache_headers.clone()),
            reject_front_page: flag("pgcache.reject.front_page", defaults.reject_front_page),
            reject_request_head: flag("pgcache.reject.request_head", defaults.reject_request_head),
            reject_logged: flag("pgcache.reject.logged", defaults.reject_logged),
            reject_logged_roles: flag("pgcache.reject.logged_roles", defaults.reject_logged_roles),
            reject_roles: list("pgcache.reject.roles"),
            role_salt: source.get_string("pgcache.reject.roles_salt").unwrap_or_default(),
            reject_uri: PatternSet::new(list("pgcache.reject.uri")),
            reject_ua: list("pgcache.reject.ua"),
            reject_cookie: list("pgcache.reject.cookie"),
            reject_categories: list("pgcache.reject.categories"),
            reject_tags: list("pgcache.reject.tags"),
            reject_authors: list("pgcache.reject.authors"),
            reject_custom: PatternSet::new(list("pgcache.reject.custom")),
            accept_files: PatternSet::new(list("pgcache.accept.files")),
            accept_qs: list("pgcache.accept.qs"),
            sitemap,
            cookie_groups,
            mobile_groups: classifier_groups(source, "mobile.enabled", "mobile.rgroups"),
            referrer_groups: classifier_groups(source, "referrer.enabled", "referrer.rgroups"),
            browser,
            dynamic_secret: non_empty(source.get_string("dynamic.secret")),
            dynamic_include_root: non_empty(source.get_string("dynamic.include_root"))
                .map(PathBuf::from),
            engines,
        }
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_late_init(mut self, enabled: bool) -> Self {
        self.late_init = enabled;
        self
    }

    pub fn with_late_caching(mut self, enabled: bool) -> Self {
        self.late_caching = enabled;
        self
    }

    pub fn with_cache_query(mut self, enabled: bool) -> Self {
        self.cache_query = enabled;
        self
    }

    pub fn with_cache_404(mut self, enabled: bool) -> Self {
        self.cache_404 = enabled;
        self
    }

    pub fn with_cache_rest(mut self, enabled: bool) -> Self {
        self.cache_rest = enabled;
        self
    }

    pub fn with_gzip(mut self, enabled: bool) -> Self {
        self.browser.gzip = enabled;
        self
    }

    pub fn with_brotli(mut self, enabled: bool) -> Self {
        self.browser.brotli = enabled;
        self
    }

    pub fn with_browser_policy(mut self, policy: BrowserCachePolicy) -> Self {
        self.browser.policy = policy;
        self
    }

    pub fn with_cookie_groups(mut self, groups: Vec<CookieGroup>) -> Self {
        self.cookie_groups = groups;
        self
    }

    pub fn with_mobile_groups(mut self, groups: Vec<ClassifierGroup>) -> Self {
        self.mobile_groups = groups;
        self
    }

    pub fn with_referrer_groups(mut self, groups: Vec<ClassifierGroup>) -> Self {
        self.referrer_groups = groups;
        self
    }

    pub fn with_dynamic_secret(mut self, secret: impl Into<String>) -> Self {
        self.dynamic_secret = Some(secret.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn with_dynamic_include_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dynamic_include_root = Some(root.into());
        self
    }

    pub fn with_reject_uri<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.reject_uri = PatternSet::new(patterns);
        self
    }

    pub fn with_accept_qs<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept_qs = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_serve_stale(mut self, enabled: bool) -> Self {
        self.serve_stale = enabled;
        self
    }

    /// Compression is off in debug mode regardless of browser-cache flags.
    pub(crate) fn compression_allowed(&self) -> bool {
        !self.debug && self.browser.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_paths_resolve_nested_and_literal_keys() {
        let source = JsonConfig::new(json!({
            "pgcache": { "lifetime": 120, "cache.query": "1" },
            "browsercache.html.etag": false,
        }));

        assert_eq!(source.get_integer("pgcache.lifetime"), Some(120));
        assert_eq!(source.get_boolean("pgcache.cache.query"), Some(true));
        assert_eq!(source.get_boolean("browsercache.html.etag"), Some(false));
        assert_eq!(source.get_string("pgcache.missing"), None);
    }

    #[test]
    fn arrays_accept_textarea_strings() {
        let source = JsonConfig::new(json!({
            "pgcache.reject.ua": "bot\n\n  crawler  \n",
            "pgcache.accept.qs": ["utm_source", "ref=home"],
        }));

        assert_eq!(
            source.get_array("pgcache.reject.ua"),
            Some(vec!["bot".to_owned(), "crawler".to_owned()])
        );
        assert_eq!(source.get_array("pgcache.accept.qs").map(|v| v.len()), Some(2));
    }

    #[test]
    fn from_source_reads_typed_settings() {
        let source = JsonConfig::new(json!({
            "pgcache": {
                "engine": "file_generic",
                "lifetime": 600,
                "rest": "cache",
                "cookiegroups": {
                    "enabled": true,
                    "groups": {
                        "members": { "cookies": ["role=member"], "cache": true },
                        "admins": { "cookies": ["role_admin"], "cache": false }
                    }
                }
            },
            "browsercache.html.cache.policy": "no_store",
            "mobile": { "enabled": true, "rgroups": { "phone": { "agents": ["iphone"] } } },
        }));

        let config = PageCacheConfig::from_source(&source);
        assert_eq!(config.engine, Engine::FileGeneric);
        assert_eq!(config.lifetime, Duration::from_secs(600));
        assert!(config.cache_rest);
        assert_eq!(config.browser.policy, BrowserCachePolicy::NoStore);
        assert_eq!(config.cookie_groups.len(), 2);
        assert!(config.cookie_groups[1].matches("role_admin=yes"));
        assert!(!config.cookie_groups[1].cache);
        assert_eq!(config.mobile_groups.len(), 1);
        assert!(config.mobile_groups[0].matches("Mozilla (iPhone)"));
    }

    #[test]
    fn malformed_pattern_never_matches() {
        let set = PatternSet::new(["(unclosed", "wp-admin"]);
        assert!(!set.is_match("(unclosed"));
        assert!(set.is_match("/WP-ADMIN/index"));
        assert!(PatternSet::try_new(["(unclosed"]).is_err());
    }

    #[test]
    fn strict_loading_reports_bad_patterns() {
        let source = JsonConfig::parse(r#"{"pgcache": {"reject": {"uri": ["wp-admin", "(unclosed"]}}}"#)
            .expect("valid json");
        let err = PageCacheConfig::try_from_source(&source).expect_err("bad pattern");
        assert!(matches!(err, CacheError::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));

        let source = JsonConfig::parse(r#"{"pgcache": {"reject": {"uri": ["wp-admin"]}}}"#).expect("valid json");
        let config = PageCacheConfig::try_from_source(&source).expect("valid patterns");
        assert!(config.reject_uri.is_match("/wp-admin/"));
    }

    #[test]
    fn cookie_group_entries_match_name_and_value() {
        let group = CookieGroup::new("plus", ["plan=gold+tier", "beta"]);
        assert!(group.matches("plan=gold tier"));
        assert!(group.matches("BETA=whatever"));
        assert!(!group.matches("plan=silver"));
    }
}
