//! Per-request facts consumed by the cache decision engine.
//!
//! [`RequestContext`] is built once from the inbound request and passed by
//! reference into every policy and key function. Upstream middleware can
//! describe the execution context with a [`RequestFacts`] request
//! extension, and the page-generating service describes what it rendered
//! with a [`PageFacts`] response extension.

use std::sync::OnceLock;

use http::header::{ACCEPT_ENCODING, COOKIE, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH, REFERER, USER_AGENT};
use http::{Extensions, HeaderMap, Method, Request, Uri};

/// Where the current request is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionContext {
    #[default]
    Http,
    /// Non-HTTP invocation (CLI, scheduled job).
    Console,
    Ajax,
    /// XML-RPC or application API call.
    Api,
    /// Administrative or cron context.
    Admin,
    /// The application asked for this request never to be cached.
    DoNotCache,
}

/// Request extension describing facts the HTTP layer cannot see.
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    pub context: ExecutionContext,
    pub session_active: bool,
    pub preview: bool,
}

impl RequestFacts {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }
}

/// Response extension describing the rendered page.
#[derive(Debug, Clone, Default)]
pub struct PageFacts {
    /// Set by the application to veto storing this page.
    pub do_not_cache: bool,
    pub front_page: bool,
    pub posts_page: bool,
    pub feed: bool,
    pub single: bool,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub custom_fields: Vec<(String, String)>,
}

/// Immutable view of an inbound request.
#[derive(Debug)]
pub struct RequestContext {
    host: String,
    path: String,
    query: Option<String>,
    method: Method,
    cookies: Vec<(String, String)>,
    user_agent: String,
    referrer: String,
    tls: bool,
    accept_encoding: String,
    if_modified_since: Option<String>,
    if_none_match: Option<String>,
    facts: RequestFacts,
    preprocessed_uri: OnceLock<String>,
}

impl RequestContext {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self::build(
            request.method(),
            request.uri(),
            request.headers(),
            request.extensions(),
        )
    }

    pub fn from_parts(parts: &http::request::Parts) -> Self {
        Self::build(&parts.method, &parts.uri, &parts.headers, &parts.extensions)
    }

    fn build(method: &Method, uri: &Uri, headers: &HeaderMap, extensions: &Extensions) -> Self {
        let host = header_str(headers, HOST.as_str())
            .map(str::to_owned)
            .or_else(|| uri.authority().map(|authority| authority.to_string()))
            .unwrap_or_default();

        Self {
            host,
            path: uri.path().to_owned(),
            query: uri.query().filter(|q| !q.is_empty()).map(str::to_owned),
            method: method.clone(),
            cookies: parse_cookies(headers),
            user_agent: header_str(headers, USER_AGENT.as_str()).unwrap_or_default().to_owned(),
            referrer: header_str(headers, REFERER.as_str()).unwrap_or_default().to_owned(),
            tls: detect_tls(uri, headers),
            accept_encoding: header_str(headers, ACCEPT_ENCODING.as_str())
                .unwrap_or_default()
                .to_owned(),
            if_modified_since: header_str(headers, IF_MODIFIED_SINCE.as_str()).map(str::to_owned),
            if_none_match: header_str(headers, IF_NONE_MATCH.as_str()).map(str::to_owned),
            facts: extensions.get::<RequestFacts>().cloned().unwrap_or_default(),
            preprocessed_uri: OnceLock::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Raw path plus query, as received.
    pub fn request_uri(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn referrer(&self) -> &str {
        &self.referrer
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn accept_encoding(&self) -> &str {
        &self.accept_encoding
    }

    pub fn if_modified_since(&self) -> Option<&str> {
        self.if_modified_since.as_deref()
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    pub fn facts(&self) -> &RequestFacts {
        &self.facts
    }

    pub fn is_rest(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.path.contains(prefix)
    }

    /// Path plus the query left after dropping ignorable parameters.
    ///
    /// Computed on first use and memoized; `ignored` must be the same list
    /// for the lifetime of the context.
    pub fn preprocessed_uri(&self, ignored: &[String]) -> &str {
        self.preprocessed_uri.get_or_init(|| {
            let query = self
                .query
                .as_deref()
                .map(|query| strip_query_params(query, ignored))
                .unwrap_or_default();
            if query.is_empty() {
                self.path.clone()
            } else {
                format!("{}?{}", self.path, query)
            }
        })
    }

    /// `host + preprocessed uri`, the URL part of every page key.
    pub fn page_url(&self, ignored: &[String]) -> String {
        format!("{}{}", self.host, self.preprocessed_uri(ignored))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| value.to_owned());
            Some((name.trim().to_owned(), value))
        })
        .collect()
}

fn detect_tls(uri: &Uri, headers: &HeaderMap) -> bool {
    if uri.scheme_str() == Some("https") {
        return true;
    }
    if header_str(headers, "x-forwarded-proto")
        .and_then(|value| value.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
    {
        return true;
    }
    if header_str(headers, "x-forwarded-ssl").is_some_and(|value| value.eq_ignore_ascii_case("on")) {
        return true;
    }
    header_str(headers, "forwarded").is_some_and(|value| {
        value
            .split([';', ','])
            .filter_map(|part| part.trim().split_once('='))
            .any(|(key, proto)| {
                key.eq_ignore_ascii_case("proto") && proto.trim_matches('"').eq_ignore_ascii_case("https")
            })
    })
}

/// Removes query parameters named in `ignored`.
///
/// A rule of `name` drops every `name` parameter; `name=value` drops only
/// that exact pair. Comparison ignores ASCII case; `+` in a rule stands for
/// an encoded space.
pub fn strip_query_params(query: &str, ignored: &[String]) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| !ignored.iter().any(|rule| param_matches(pair, rule)))
        .collect::<Vec<_>>()
        .join("&")
}

fn param_matches(pair: &str, rule: &str) -> bool {
    let rule = rule.trim();
    if rule.is_empty() {
        return false;
    }
    let (name, value) = match pair.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (pair, None),
    };
    match rule.split_once('=') {
        Some((rule_name, rule_value)) => {
            name.eq_ignore_ascii_case(rule_name)
                && value.is_some_and(|value| {
                    value.eq_ignore_ascii_case(rule_value)
                        || value.eq_ignore_ascii_case(&rule_value.replace('+', "%20"))
                })
        }
        None => name.eq_ignore_ascii_case(rule),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(uri: &str, headers: &[(&str, &str)]) -> RequestContext {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        RequestContext::from_request(&builder.body(()).expect("request"))
    }

    #[test]
    fn strips_ignored_parameters() {
        let ignored = vec!["utm_source".to_owned(), "ref=home".to_owned()];
        assert_eq!(
            strip_query_params("a=1&UTM_SOURCE=x&&ref=home&ref=other", &ignored),
            "a=1&ref=other"
        );
        assert_eq!(strip_query_params("utm_source", &ignored), "");
    }

    #[test]
    fn preprocessed_uri_drops_empty_query() {
        let ctx = context("/blog/?utm_source=feed", &[("host", "example.com")]);
        let ignored = vec!["utm_source".to_owned()];
        assert_eq!(ctx.preprocessed_uri(&ignored), "/blog/");
        assert_eq!(ctx.page_url(&ignored), "example.com/blog/");
        assert_eq!(ctx.request_uri(), "/blog/?utm_source=feed");
    }

    #[test]
    fn cookies_are_split_and_decoded() {
        let ctx = context(
            "/",
            &[("cookie", "a=1; comment_author_x=J%20Doe"), ("cookie", "flag")],
        );
        assert_eq!(
            ctx.cookies(),
            &[
                ("a".to_owned(), "1".to_owned()),
                ("comment_author_x".to_owned(), "J Doe".to_owned()),
                ("flag".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn tls_detected_from_forwarding_headers() {
        assert!(context("https://example.com/", &[]).is_tls());
        assert!(context("/", &[("x-forwarded-proto", "https, http")]).is_tls());
        assert!(context("/", &[("forwarded", "for=1.2.3.4;proto=https")]).is_tls());
        assert!(!context("/", &[("host", "example.com")]).is_tls());
    }

    #[test]
    fn facts_default_to_plain_http() {
        let ctx = context("/", &[]);
        assert_eq!(ctx.facts().context, ExecutionContext::Http);

        let mut request = Request::new(());
        request
            .extensions_mut()
            .insert(RequestFacts::new(ExecutionContext::Ajax));
        let ctx = RequestContext::from_request(&request);
        assert_eq!(ctx.facts().context, ExecutionContext::Ajax);
    }
}
