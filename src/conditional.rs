//! Response headers, validators and the 304 short circuit.
//!
//! [`prepare`] renders the browser-cache headers for a page and decides
//! between 200/404 and 304. [`ResponseWriter`] is the explicit output sink
//! the orchestrator writes through: it refuses a second header block and
//! never carries a body for HEAD requests or 304 responses.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use http::header::{
    CONTENT_ENCODING, CACHE_CONTROL, CONTENT_LENGTH, ETAG, EXPIRES, LAST_MODIFIED, PRAGMA, VARY,
};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::Full;

use crate::compression::{self, Compression};
use crate::config::{BrowserCachePolicy, PageCacheConfig};
use crate::key::KeyExtension;
use crate::request::RequestContext;
use crate::POWERED_BY;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Formats seconds since the epoch as an IMF-fixdate.
pub fn http_date(unix_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .unwrap_or_default()
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

pub fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT)
        .map(|naive| naive.and_utc().timestamp())
        .or_else(|_| DateTime::parse_from_rfc2822(value).map(|parsed| parsed.timestamp()))
        .ok()
}

/// `If-Modified-Since` matches when it names exactly `time`. Anything from
/// the last `;` on (a length hint some clients append) is ignored.
pub fn check_modified_since(header: Option<&str>, time: i64) -> bool {
    let Some(header) = header.filter(|value| !value.trim().is_empty()) else {
        return false;
    };
    let header = match header.rfind(';') {
        Some(idx) => &header[..idx],
        None => header,
    };
    parse_http_date(header) == Some(time)
}

/// `If-None-Match` matches when any listed tag equals the quoted `etag`.
pub fn check_match(header: Option<&str>, etag: &str) -> bool {
    let quoted = format!("\"{etag}\"");
    header.is_some_and(|value| value.split(',').any(|candidate| candidate.trim() == quoted))
}

/// `(Pragma, Cache-Control)` for a browser-cache policy.
pub fn cache_control(policy: BrowserCachePolicy, max_age: i64) -> (&'static str, String) {
    match policy {
        BrowserCachePolicy::Cache => ("public", "public".to_owned()),
        BrowserCachePolicy::CachePublicMaxage => ("public", format!("max-age={max_age}, public")),
        BrowserCachePolicy::CacheValidation => (
            "public",
            "public, must-revalidate, proxy-revalidate".to_owned(),
        ),
        BrowserCachePolicy::CacheNoproxy => ("public", "private, must-revalidate".to_owned()),
        BrowserCachePolicy::CacheMaxage => (
            "public",
            format!("max-age={max_age}, public, must-revalidate, proxy-revalidate"),
        ),
        BrowserCachePolicy::NoCache => ("no-cache", "private, no-cache".to_owned()),
        BrowserCachePolicy::NoStore => ("no-store", "no-store".to_owned()),
    }
}

/// Composes `Vary` from the axes that selected this variant.
pub fn vary(extension: &KeyExtension, compression_negotiable: bool, logged_in: bool) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if compression_negotiable {
        parts.push("Accept-Encoding");
    }
    if !extension.useragent.is_empty() {
        parts.push("User-Agent");
        parts.push("Cookie");
    }
    if (logged_in || !extension.cookie.is_empty()) && !parts.contains(&"Cookie") {
        parts.push("Cookie");
    }
    (!parts.is_empty()).then(|| parts.join(","))
}

/// What the sender needs to know about the page being emitted.
#[derive(Debug, Clone, Copy)]
pub struct SendParams<'a> {
    pub status: StatusCode,
    /// Creation time of the page; `None` while it is being generated.
    pub time: Option<i64>,
    pub etag: &'a str,
    pub compression: Compression,
    pub extension: &'a KeyExtension,
    pub logged_in: bool,
    pub cached_headers: &'a [(String, String)],
}

/// Status line and header block ready for [`ResponseWriter::send_headers`].
#[derive(Debug)]
pub struct Prepared {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub not_modified: bool,
}

/// Renders the header block and resolves validators.
pub fn prepare(config: &PageCacheConfig, ctx: &RequestContext, params: SendParams<'_>) -> Prepared {
    let now = unix_now();
    let time = params.time.unwrap_or(now);
    let expires = time + config.browser.lifetime.as_secs() as i64;
    let max_age = (expires - now).max(0);

    let (status, not_modified) = if params.status == StatusCode::NOT_FOUND {
        (StatusCode::NOT_FOUND, false)
    } else if (params.time.is_some() && check_modified_since(ctx.if_modified_since(), time))
        || check_match(ctx.if_none_match(), params.etag)
    {
        (StatusCode::NOT_MODIFIED, true)
    } else {
        (params.status, false)
    };

    let mut headers = HeaderMap::new();
    for (name, value) in params.cached_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let browser = &config.browser;
    if browser.enabled {
        if browser.last_modified {
            insert(&mut headers, LAST_MODIFIED, &http_date(time));
        }
        if browser.expires {
            insert(&mut headers, EXPIRES, &http_date(expires));
        }
        if browser.cache_control {
            let (pragma, control) = cache_control(browser.policy, max_age);
            insert(&mut headers, PRAGMA, pragma);
            insert(&mut headers, CACHE_CONTROL, &control);
        }
        if browser.etag {
            insert(&mut headers, ETAG, &format!("\"{}\"", params.etag));
        }
        if browser.powered_by {
            insert(&mut headers, HeaderName::from_static("x-powered-by"), POWERED_BY);
        }
    }

    let negotiable = !compression::enabled_compressions(config).is_empty();
    if let Some(vary) = vary(params.extension, negotiable, params.logged_in) {
        insert(&mut headers, VARY, &vary);
    }

    headers.remove(CONTENT_ENCODING);
    if !not_modified {
        if let Some(encoding) = params.compression.content_encoding() {
            insert(&mut headers, CONTENT_ENCODING, encoding);
        }
    }

    if params.extension.preview {
        insert(&mut headers, PRAGMA, "private");
        insert(&mut headers, CACHE_CONTROL, "private");
    }

    Prepared {
        status,
        headers,
        not_modified,
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Output sink for one request.
#[derive(Debug)]
pub struct ResponseWriter {
    head_only: bool,
    headers_sent: bool,
    suppress_body: bool,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl ResponseWriter {
    pub fn new(head_only: bool) -> Self {
        Self {
            head_only,
            headers_sent: false,
            suppress_body: false,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Sends the status line and headers. A second call is skipped and
    /// returns `false`.
    pub fn send_headers(&mut self, status: StatusCode, headers: HeaderMap) -> bool {
        if self.headers_sent {
            tracing::debug!(%status, "headers already sent, skipping");
            return false;
        }
        self.headers_sent = true;
        self.status = status;
        self.headers = headers;
        self.suppress_body = status == StatusCode::NOT_MODIFIED;
        true
    }

    pub fn send_prepared(&mut self, prepared: Prepared) -> bool {
        self.send_headers(prepared.status, prepared.headers)
    }

    pub fn write(&mut self, chunk: &[u8]) {
        if !self.head_only && !self.suppress_body {
            self.body.extend_from_slice(chunk);
        }
    }

    pub fn finish(mut self) -> Response<Full<Bytes>> {
        if self.head_only || self.suppress_body {
            self.headers.remove(CONTENT_LENGTH);
        }
        let mut response = Response::new(Full::from(self.body.freeze()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
