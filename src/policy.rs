//! Read and write cacheability rules.
//!
//! Both evaluations are pure functions of the request context, the
//! configuration and (for writes) the captured page. They short-circuit on
//! the first failing rule and report a human-readable reason together with
//! a coarse [`ProcessStatus`].

use http::header::{CONTENT_ENCODING, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use sha2::{Digest, Sha256};

use crate::config::PageCacheConfig;
use crate::request::{ExecutionContext, PageFacts, RequestContext};
use crate::telemetry::ProcessStatus;
use crate::POWERED_BY;

const AUTO_REJECT_URIS: [&str; 2] = ["wp-login", "wp-register"];
const FORBIDDEN_COOKIE_PREFIXES: [&str; 2] = ["wp-postpass", "comment_author"];
const TEST_COOKIE: &str = "wordpress_test_cookie";
const LOGGED_IN_COOKIE_PREFIX: &str = "wordpress_logged_in";
const ROLE_COOKIE_PREFIX: &str = "w3tc_logged_";

/// Headers kept on every stored page regardless of configuration.
pub const ALWAYS_CACHED_HEADERS: [&str; 3] = ["location", "x-wp-total", "x-wp-totalpages"];

/// Headers that may legitimately repeat and are stored as ordered lists.
pub const REPEATING_HEADERS: [&str; 3] = ["link", "cookie", "set-cookie"];

const CACHEABLE_CONTENT_TYPES: [&str; 9] = [
    "application/json",
    "text/html",
    "text/xml",
    "text/xsl",
    "application/xhtml+xml",
    "application/rss+xml",
    "application/atom+xml",
    "application/rdf+xml",
    "application/xml",
];

/// Outcome of a cacheability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub cacheable: bool,
    pub reason: String,
    pub status: Option<ProcessStatus>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            cacheable: true,
            reason: String::new(),
            status: None,
        }
    }

    pub fn reject(reason: impl Into<String>, status: ProcessStatus) -> Self {
        Self {
            cacheable: false,
            reason: reason.into(),
            status: Some(status),
        }
    }

    /// Status to report for this decision when the request is not served
    /// from cache.
    pub fn miss_status(&self) -> ProcessStatus {
        self.status.unwrap_or(ProcessStatus::MissConfiguration)
    }
}

/// Fixed outcome for execution contexts that bypass the cache entirely.
pub fn excluded_context(context: ExecutionContext) -> Option<Decision> {
    let (reason, status) = match context {
        ExecutionContext::Http | ExecutionContext::Console => return None,
        ExecutionContext::DoNotCache => ("Page declared itself uncacheable", ProcessStatus::MissThirdParty),
        ExecutionContext::Ajax => ("Ajax request", ProcessStatus::MissAjax),
        ExecutionContext::Api => ("API call", ProcessStatus::MissApiCall),
        ExecutionContext::Admin => ("Administrative request", ProcessStatus::MissWpAdmin),
    };
    Some(Decision::reject(reason, status))
}

/// Can this request be answered from cache?
///
/// `preprocessed_query` is the query left after ignorable parameters were
/// stripped.
pub fn can_read(ctx: &RequestContext, config: &PageCacheConfig, preprocessed_query: Option<&str>) -> Decision {
    if ctx.facts().context == ExecutionContext::Console {
        return Decision::reject("Console mode", ProcessStatus::MissConfiguration);
    }

    if ctx.facts().session_active {
        return Decision::reject("Session started", ProcessStatus::MissConfiguration);
    }

    if ctx.is_tls() && !config.cache_ssl {
        return Decision::reject("SSL caching disabled", ProcessStatus::MissConfiguration);
    }

    let method = ctx.method();
    if [
        Method::DELETE,
        Method::PUT,
        Method::OPTIONS,
        Method::TRACE,
        Method::CONNECT,
        Method::POST,
        Method::PATCH,
    ]
    .contains(method)
    {
        return Decision::reject(
            format!("Requested method is {method}"),
            ProcessStatus::MissRequestMethod,
        );
    }

    if ctx.is_head() && (config.engine.is_enhanced() || config.reject_request_head) {
        return Decision::reject("Requested method is HEAD", ProcessStatus::MissRequestMethod);
    }

    let has_query = preprocessed_query.is_some_and(|query| !query.is_empty());
    if has_query && (!config.cache_query || config.engine.is_enhanced()) {
        let rest_exception = config.cache_rest && ctx.is_rest(&config.rest_prefix);
        if !rest_exception {
            return Decision::reject("Requested URI contains query", ProcessStatus::MissQueryString);
        }
    }

    if !passed_accept_files(ctx, config) && !passed_reject_uri(ctx, config) {
        return Decision::reject("Requested URI is rejected", ProcessStatus::MissConfiguration);
    }

    if !passed_reject_ua(ctx, config) {
        return Decision::reject("User agent is rejected", ProcessStatus::MissConfiguration);
    }

    if !passed_reject_cookie(ctx, config) {
        return Decision::reject("Cookie is rejected", ProcessStatus::MissConfiguration);
    }

    if config.reject_logged {
        if is_logged_in(ctx) {
            return Decision::reject("User is logged in", ProcessStatus::MissLoggedIn);
        }
    } else if config.reject_logged_roles && has_rejected_role(ctx, config) {
        return Decision::reject("Rejected user role is logged in", ProcessStatus::MissLoggedIn);
    }

    Decision::allow()
}

fn passed_accept_files(ctx: &RequestContext, config: &PageCacheConfig) -> bool {
    config.accept_files.is_match(ctx.path())
}

fn passed_reject_uri(ctx: &RequestContext, config: &PageCacheConfig) -> bool {
    let uri = ctx.request_uri();
    let lowered = uri.to_ascii_lowercase();
    if AUTO_REJECT_URIS.iter().any(|marker| lowered.contains(marker)) {
        return false;
    }
    !config.reject_uri.is_match(&uri)
}

fn passed_reject_ua(ctx: &RequestContext, config: &PageCacheConfig) -> bool {
    let agent = ctx.user_agent().to_ascii_lowercase();
    if agent.is_empty() {
        return true;
    }
    let rejected = config
        .reject_ua
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(POWERED_BY))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| agent.contains(&entry.to_ascii_lowercase()));
    !rejected
}

fn passed_reject_cookie(ctx: &RequestContext, config: &PageCacheConfig) -> bool {
    for (name, _) in ctx.cookies() {
        if name == TEST_COOKIE {
            continue;
        }
        if FORBIDDEN_COOKIE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            return false;
        }
        let lowered = name.to_ascii_lowercase();
        if config
            .reject_cookie
            .iter()
            .map(|entry| entry.trim().to_ascii_lowercase())
            .any(|entry| !entry.is_empty() && lowered.contains(&entry))
        {
            return false;
        }
    }
    true
}

/// Whether the request carries the logged-in marker cookie.
pub fn is_logged_in(ctx: &RequestContext) -> bool {
    ctx.cookies()
        .iter()
        .any(|(name, _)| name.starts_with(LOGGED_IN_COOKIE_PREFIX))
}

fn has_rejected_role(ctx: &RequestContext, config: &PageCacheConfig) -> bool {
    let markers: Vec<String> = config
        .reject_roles
        .iter()
        .map(|role| role_marker(&config.role_salt, role))
        .collect();
    ctx.cookies().iter().any(|(name, _)| {
        name.strip_prefix(ROLE_COOKIE_PREFIX)
            .is_some_and(|rest| markers.iter().any(|marker| rest.contains(marker.as_str())))
    })
}

/// Name fragment of the cookie the application sets for a logged-in role.
pub fn role_marker(salt: &str, role: &str) -> String {
    hex::encode(Sha256::digest(format!("{salt}{role}").as_bytes()))
}

/// The captured response as seen by the write evaluation.
#[derive(Debug, Clone, Copy)]
pub struct CapturedPage<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub facts: &'a PageFacts,
    pub has_dynamic: bool,
    /// The `Location` target derives the same key as the request.
    pub redirects_to_self: bool,
}

/// Can the captured response be stored?
pub fn can_write(
    ctx: &RequestContext,
    config: &PageCacheConfig,
    read: &Decision,
    page: &CapturedPage<'_>,
) -> Decision {
    if !read.cacheable {
        return read.clone();
    }

    if page.facts.do_not_cache || ctx.facts().context == ExecutionContext::DoNotCache {
        return Decision::reject("Page declared itself uncacheable", ProcessStatus::MissThirdParty);
    }

    if ctx.is_rest(&config.rest_prefix) && !config.cache_rest {
        return Decision::reject("REST request", ProcessStatus::MissApiCall);
    }

    if page.status == StatusCode::NOT_FOUND && !config.cache_404 {
        return Decision::reject("Page is 404", ProcessStatus::Miss404);
    }

    if !config.cache_home && (page.facts.front_page || page.facts.posts_page) {
        let reason = if page.facts.front_page {
            "Page is front page"
        } else {
            "Page is posts page"
        };
        return Decision::reject(reason, ProcessStatus::MissConfiguration);
    }

    if config.reject_front_page && page.facts.front_page {
        return Decision::reject("Page is front page", ProcessStatus::MissConfiguration);
    }

    if page.facts.feed && !config.cache_feed {
        return Decision::reject("Page is feed", ProcessStatus::MissConfiguration);
    }

    if config.engine.is_enhanced() && page.has_dynamic {
        return Decision::reject("Response has dynamic tags", ProcessStatus::MissMfunc);
    }

    if !passed_accept_files(ctx, config) {
        if let Some(decision) = rejected_by_content_rules(config, page.facts) {
            return decision;
        }
    }

    if page.headers.contains_key(CONTENT_ENCODING) {
        return Decision::reject("Response is compressed", ProcessStatus::MissCompressed);
    }

    let has_location = page.headers.contains_key(LOCATION);
    if page.body.is_empty() && !has_location {
        return Decision::reject("Empty response", ProcessStatus::MissEmptyResponse);
    }

    if has_location && page.redirects_to_self {
        return Decision::reject(
            "Normalization redirect",
            ProcessStatus::MissNormalizationRedirect,
        );
    }

    if ctx.is_head() {
        return Decision::reject("HEAD request", ProcessStatus::MissRequestMethod);
    }

    Decision::allow()
}

fn rejected_by_content_rules(config: &PageCacheConfig, facts: &PageFacts) -> Option<Decision> {
    let listed = |list: &[String], value: &str| list.iter().any(|entry| entry.eq_ignore_ascii_case(value));

    if facts.single {
        if facts.categories.iter().any(|c| listed(&config.reject_categories, c)) {
            return Some(Decision::reject("Page has rejected category", ProcessStatus::MissConfiguration));
        }
        if facts.tags.iter().any(|t| listed(&config.reject_tags, t)) {
            return Some(Decision::reject("Page has rejected tag", ProcessStatus::MissConfiguration));
        }
    }

    if facts
        .author
        .as_deref()
        .is_some_and(|author| listed(&config.reject_authors, author))
    {
        return Some(Decision::reject("Page has rejected author", ProcessStatus::MissConfiguration));
    }

    if facts
        .custom_fields
        .iter()
        .any(|(key, value)| config.reject_custom.is_match(&format!("{key}={value}")))
    {
        return Some(Decision::reject(
            "Page has rejected custom field",
            ProcessStatus::MissConfiguration,
        ));
    }

    None
}

/// Only markup, feeds, JSON and bodyless redirects are considered.
pub fn is_cacheable_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.is_empty() || CACHEABLE_CONTENT_TYPES.contains(&essence.as_str())
}

/// Header names (lower-case) eligible for storage.
pub fn cached_header_names(config: &PageCacheConfig) -> Vec<String> {
    let mut names: Vec<String> = ALWAYS_CACHED_HEADERS.iter().map(|h| (*h).to_owned()).collect();
    for header in &config.cache_headers {
        let header = header.trim().to_ascii_lowercase();
        if !header.is_empty() && !names.contains(&header) {
            names.push(header);
        }
    }
    names
}

pub fn repeating_header_names() -> Vec<String> {
    REPEATING_HEADERS.iter().map(|h| (*h).to_owned()).collect()
}

/// Projects `headers` onto the allow-list. Repeating headers keep every
/// value in order; others keep their last value.
pub fn headers_to_cache(headers: &HeaderMap, cached: &[String], repeating: &[String]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for name in cached {
        let values: Vec<&str> = headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        if repeating.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            out.extend(values.iter().map(|value| (name.clone(), (*value).to_owned())));
        } else if let Some(value) = values.last() {
            out.push((name.clone(), (*value).to_owned()));
        }
    }
    out
}
