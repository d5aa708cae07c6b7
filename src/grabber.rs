//! The content grabber: serves pages from cache and captures generated ones.
//!
//! A request goes through [`ContentGrabber::process`] before the page is
//! generated. In the late init and late caching modes it comes back through
//! [`ContentGrabber::delayed_cache_print`] once the application knows more
//! about the visitor. A generated response is handed to
//! [`ContentGrabber::capture`], which decides whether to store it and
//! renders what the client receives.
//!
//! Each step consumes the [`RequestState`], so a request can be answered
//! only once.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, VARY};
use http::response::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Response};
use http_body::Body as _;
use http_body_util::Full;

use crate::backend::{CachedPage, PageStore};
use crate::compression::{self, Compression};
use crate::conditional::{self, Prepared, ResponseWriter, SendParams};
use crate::config::PageCacheConfig;
use crate::dynamic::DynamicProcessor;
use crate::hooks::Hooks;
use crate::key::{self, Group, KeyExtension};
use crate::logging::{CacheEvent, LoggingConfig};
use crate::policy::{self, CapturedPage, Decision};
use crate::request::{self, PageFacts, RequestContext};
use crate::telemetry::{self, ProcessStatus};

/// Literal a page may contain to show why it was not cached.
pub const REJECT_REASON_PLACEHOLDER: &str = "{w3tc_pagecache_reject_reason}";

/// Where a request goes next.
#[derive(Debug)]
pub enum Outcome {
    /// Answered from cache.
    Respond(Response<Full<Bytes>>),
    /// Generate the page and pass it to [`ContentGrabber::capture`].
    Generate(RequestState),
    /// Continue with [`ContentGrabber::delayed_cache_print`] once the
    /// application has initialized.
    Deferred(RequestState),
}

/// Per-request state carried between lifecycle points.
#[derive(Debug)]
pub struct RequestState {
    ctx: RequestContext,
    started: Instant,
    decision: Decision,
    excluded: bool,
    extension: KeyExtension,
    ignored: Vec<String>,
    page_key: String,
    old_exists: bool,
    late_init: bool,
    late_caching: bool,
    pending: Option<CachedPage>,
}

impl RequestState {
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn is_caching(&self) -> bool {
        self.decision.cacheable
    }

    /// Key of the variant looked up or stored; empty before one is derived.
    pub fn page_key(&self) -> &str {
        &self.page_key
    }

    pub fn extension(&self) -> &KeyExtension {
        &self.extension
    }

    fn reject(&mut self, reason: impl Into<String>, status: ProcessStatus) {
        self.decision = Decision::reject(reason, status);
    }
}

/// Orchestrates lookups, captures and stores against one [`PageStore`].
#[derive(Clone)]
pub struct ContentGrabber {
    store: Arc<dyn PageStore>,
    config: Arc<PageCacheConfig>,
    hooks: Hooks,
    dynamic: DynamicProcessor,
    logging: LoggingConfig,
    status_header: Option<HeaderName>,
}

impl std::fmt::Debug for ContentGrabber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentGrabber")
            .field("engine", &self.config.engine)
            .field("hooks", &self.hooks)
            .field("dynamic", &self.dynamic.is_enabled())
            .field("status_header", &self.status_header)
            .finish()
    }
}

impl ContentGrabber {
    pub fn new(store: Arc<dyn PageStore>, config: Arc<PageCacheConfig>) -> Self {
        let dynamic = DynamicProcessor::from_config(&config, Default::default());
        Self {
            store,
            config,
            hooks: Hooks::default(),
            dynamic,
            logging: LoggingConfig::default(),
            status_header: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_dynamic(mut self, dynamic: DynamicProcessor) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Adds a header naming the outcome to every response.
    pub fn with_status_header(mut self, name: Option<HeaderName>) -> Self {
        self.status_header = name;
        self
    }

    pub fn config(&self) -> &PageCacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Entry point, called before the page is generated.
    pub async fn process(&self, ctx: RequestContext) -> Outcome {
        let config = &*self.config;
        let mut state = RequestState {
            started: Instant::now(),
            decision: Decision::allow(),
            excluded: false,
            extension: KeyExtension::default(),
            ignored: self.hooks.ignored_query_params(config),
            page_key: String::new(),
            old_exists: false,
            late_init: config.late_init && !config.engine.is_enhanced(),
            late_caching: config.late_caching && !config.engine.is_enhanced(),
            pending: None,
            ctx,
        };

        if let Some(decision) = policy::excluded_context(state.ctx.facts().context) {
            tracing::debug!(reason = %decision.reason, "request bypasses page cache");
            state.decision = decision;
            state.excluded = true;
            return Outcome::Generate(state);
        }

        let decision = {
            let query = state
                .ctx
                .preprocessed_uri(&state.ignored)
                .split_once('?')
                .map(|(_, query)| query);
            policy::can_read(&state.ctx, config, query)
        };
        state.decision = decision;

        let extension = key::key_extension(&state.ctx, config);
        state.extension = self.hooks.apply_key_extension(&state.ctx, extension);
        if state.decision.cacheable && !state.extension.cache {
            let reason = state.extension.reason.clone();
            state.reject(reason, ProcessStatus::MissConfiguration);
        }

        tracing::debug!(
            uri = %state.ctx.request_uri(),
            can_cache = state.decision.cacheable,
            reason = %state.decision.reason,
            "page cache read evaluated"
        );

        if !state.decision.cacheable {
            return Outcome::Generate(state);
        }
        if state.late_caching {
            return Outcome::Deferred(state);
        }

        match self.extract_cached_page(&mut state).await {
            Some(page) if state.late_init => {
                state.pending = Some(page);
                Outcome::Deferred(state)
            }
            Some(page) => Outcome::Respond(self.serve_cached(state, page).await),
            None => Outcome::Generate(state),
        }
    }

    /// Second entry point for the late modes, called once the application
    /// has initialized and the late-init hook can judge the visitor.
    pub async fn delayed_cache_print(&self, mut state: RequestState) -> Outcome {
        if !state.decision.cacheable || !(state.late_caching || state.late_init) {
            return Outcome::Generate(state);
        }

        if let Some(reason) = self.hooks.late_init(&state.ctx) {
            tracing::debug!(%reason, "late evaluation refused cache");
            state.pending = None;
            state.reject(reason, ProcessStatus::MissConfiguration);
            return Outcome::Generate(state);
        }

        let page = if state.late_caching {
            self.extract_cached_page(&mut state).await
        } else {
            state.pending.take()
        };
        match page {
            Some(page) => Outcome::Respond(self.serve_cached(state, page).await),
            None => Outcome::Generate(state),
        }
    }

    /// Inspects a generated response, stores it when allowed and renders
    /// the response for the client.
    pub async fn capture(&self, mut state: RequestState, mut parts: Parts, body: Bytes) -> Response<Full<Bytes>> {
        if state.excluded {
            let status = state.decision.miss_status();
            return self.finish(&state, status, pass_through(&state, parts, body));
        }

        let content_type = header_string(&parts.headers, &CONTENT_TYPE).unwrap_or_default();
        if !policy::is_cacheable_content_type(&content_type) {
            tracing::debug!(%content_type, "response content type is not cached");
            if state.decision.cacheable {
                state.reject("Content type is not cacheable", ProcessStatus::MissConfiguration);
            }
            let status = state.decision.miss_status();
            return self.finish(&state, status, pass_through(&state, parts, body));
        }

        let facts = parts.extensions.get::<PageFacts>().cloned().unwrap_or_default();
        let has_dynamic = self.dynamic.has_dynamic(&body);
        let cached_headers = policy::headers_to_cache(
            &parts.headers,
            &self.hooks.cached_headers(&self.config),
            &self.hooks.repeating_headers(),
        );
        let redirects_to_self = header_string(&parts.headers, &LOCATION)
            .is_some_and(|location| self.redirects_to_self(&state, &location));

        let computed = policy::can_write(
            &state.ctx,
            &self.config,
            &state.decision,
            &CapturedPage {
                status: parts.status,
                headers: &parts.headers,
                body: &body,
                facts: &facts,
                has_dynamic,
                redirects_to_self,
            },
        );
        state.decision = self.hooks.apply_can_write(&state.ctx, computed);
        tracing::debug!(
            can_cache = state.decision.cacheable,
            reason = %state.decision.reason,
            "page cache write evaluated"
        );

        let body = match replace_placeholder(&body, &state.decision.reason) {
            Some(replaced) => {
                parts.headers.remove(CONTENT_LENGTH);
                replaced
            }
            None => body,
        };

        if state.decision.cacheable {
            return self.store_and_send(state, parts, body, cached_headers, has_dynamic).await;
        }

        if state.old_exists && !state.decision.reason.is_empty() {
            self.delete_variants(&state).await;
        }

        let status = state.decision.miss_status();
        let response = if has_dynamic {
            self.send_dynamic_uncached(&state, parts, body).await
        } else {
            pass_through(&state, parts, body)
        };
        self.finish(&state, status, response)
    }

    async fn extract_cached_page(&self, state: &mut RequestState) -> Option<CachedPage> {
        let url = state.ctx.page_url(&state.ignored);
        let group = state.extension.group.clone();

        let key = self.derive_key(&state.extension, &url);
        if key.is_empty() {
            state.reject("Page key cleared by collaborator", ProcessStatus::MissThirdParty);
            return None;
        }
        state.page_key = key.clone();
        if let Some(page) = self.lookup(state, &key, &group).await {
            return Some(page);
        }

        // A compressed variant may be missing while the plain one exists.
        if state.extension.compression.is_identity() {
            return None;
        }
        let identity = state.extension.with_compression(Compression::Identity);
        let key = self.derive_key(&identity, &url);
        if key.is_empty() {
            return None;
        }
        let page = self.lookup(state, &key, &group).await?;
        state.page_key = key;
        Some(page)
    }

    async fn lookup(&self, state: &mut RequestState, key: &str, group: &Group) -> Option<CachedPage> {
        match self.store.get_with_staleness(key, group).await {
            Ok(Some(lookup)) if lookup.stale => {
                state.old_exists = true;
                if self.config.serve_stale {
                    tracing::debug!(key, "serving stale page");
                    Some(lookup.page)
                } else {
                    None
                }
            }
            Ok(Some(lookup)) => Some(lookup.page),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key, error = %err, "page cache lookup failed, treating as miss");
                None
            }
        }
    }

    fn derive_key(&self, extension: &KeyExtension, url: &str) -> String {
        self.hooks
            .apply_page_key(extension, key::page_key(extension, url, &self.config))
    }

    async fn serve_cached(&self, state: RequestState, page: CachedPage) -> Response<Full<Bytes>> {
        let head = state.ctx.is_head();
        let (payload, etag, compression, time) = if page.has_dynamic {
            let client = state.extension.compression;
            if head {
                (Bytes::new(), compression::etag(&page.body), client, None)
            } else {
                let source = match page.compression.decompress(&page.body) {
                    Ok(source) => source,
                    Err(err) => {
                        tracing::warn!(error = %err, "cached dynamic page could not be decoded");
                        page.body.clone()
                    }
                };
                let rendered = self.dynamic.render(&source).await;
                let etag = compression::etag(&rendered);
                let (payload, compression) = encode_for_client(rendered, client);
                (payload, etag, compression, None)
            }
        } else {
            (
                page.body.clone(),
                compression::etag(&page.body),
                page.compression,
                Some(page.time),
            )
        };

        let prepared = conditional::prepare(
            &self.config,
            &state.ctx,
            SendParams {
                status: page.status_code(),
                time,
                etag: &etag,
                compression,
                extension: &state.extension,
                logged_in: policy::is_logged_in(&state.ctx),
                cached_headers: &page.headers,
            },
        );
        tracing::debug!(key = %state.page_key, not_modified = prepared.not_modified, "serving page from cache");

        let mut writer = ResponseWriter::new(head);
        writer.send_prepared(prepared);
        writer.write(&payload);
        self.finish(&state, ProcessStatus::Hit, writer.finish())
    }

    async fn store_and_send(
        &self,
        mut state: RequestState,
        parts: Parts,
        body: Bytes,
        cached_headers: Vec<(String, String)>,
        has_dynamic: bool,
    ) -> Response<Full<Bytes>> {
        let config = &*self.config;
        let enhanced = config.engine.is_enhanced();

        if enhanced && parts.headers.contains_key(LOCATION) {
            self.delete_variants(&state).await;
            state.reject("Redirect in enhanced mode", ProcessStatus::MissConfiguration);
            let status = state.decision.miss_status();
            return self.finish(&state, status, pass_through(&state, parts, body));
        }

        let content_type = if enhanced {
            self.hooks.check_rules();
            header_string(&parts.headers, &CONTENT_TYPE).unwrap_or_default()
        } else {
            String::new()
        };

        let url = state.ctx.page_url(&state.ignored);
        let group = state.extension.group.clone();
        let client = state.extension.compression;
        let time = conditional::unix_now();
        let mut stored = false;
        let mut variants = Vec::new();

        for scheme in compression::compressions_to_store(config, has_dynamic) {
            let mut extension = state.extension.with_compression(scheme);
            extension.content_type = content_type.clone();
            let key = self.derive_key(&extension, &url);
            if key.is_empty() {
                continue;
            }
            let encoded = match scheme.compress(&body) {
                Ok(encoded) => encoded,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "failed to compress page variant");
                    continue;
                }
            };
            let page = CachedPage {
                status: parts.status.as_u16(),
                headers: cached_headers.clone(),
                body: encoded.clone(),
                time,
                compression: scheme,
                has_dynamic,
            };
            match self.store.set(&key, &group, &page, config.lifetime).await {
                Ok(true) => {
                    stored = true;
                    tracing::debug!(key = %key, compression = scheme.label(), "stored page variant");
                }
                Ok(false) => tracing::debug!(key = %key, "page variant not stored"),
                Err(err) => tracing::warn!(key = %key, error = %err, "failed to store page variant"),
            }
            if scheme == client || state.page_key.is_empty() {
                state.page_key = key;
            }
            variants.push((scheme, encoded));
        }

        let status = if stored {
            ProcessStatus::MissFill
        } else {
            ProcessStatus::MissThirdParty
        };

        let head = state.ctx.is_head();
        let (payload, etag, compression, time) = if has_dynamic {
            if head {
                (Bytes::new(), compression::etag(&body), client, None)
            } else {
                let rendered = self.dynamic.render(&body).await;
                let etag = compression::etag(&rendered);
                let (payload, compression) = encode_for_client(rendered, client);
                (payload, etag, compression, None)
            }
        } else {
            let (payload, compression) = match variants.into_iter().find(|(scheme, _)| *scheme == client) {
                Some((scheme, encoded)) => (encoded, scheme),
                None => encode_for_client(body, client),
            };
            let etag = compression::etag(&payload);
            (payload, etag, compression, Some(time))
        };

        let prepared = conditional::prepare(
            config,
            &state.ctx,
            SendParams {
                status: parts.status,
                time,
                etag: &etag,
                compression,
                extension: &state.extension,
                logged_in: policy::is_logged_in(&state.ctx),
                cached_headers: &[],
            },
        );
        let response = write_over(parts.headers, prepared, &payload, head);
        self.finish(&state, status, response)
    }

    /// A page that is not cached but carries dynamic fragments still gets
    /// its fragments rendered and the negotiated encoding applied.
    async fn send_dynamic_uncached(&self, state: &RequestState, parts: Parts, body: Bytes) -> Response<Full<Bytes>> {
        let head = state.ctx.is_head();
        let mut headers = parts.headers;
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_ENCODING);

        let rendered = if head { body } else { self.dynamic.render(&body).await };
        let (payload, compression) = encode_for_client(rendered, state.extension.compression);
        if let Some(encoding) = compression.content_encoding() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        }
        let negotiable = !compression::enabled_compressions(&self.config).is_empty();
        if let Some(vary) = conditional::vary(&state.extension, negotiable, policy::is_logged_in(&state.ctx)) {
            if let Ok(value) = HeaderValue::from_str(&vary) {
                headers.insert(VARY, value);
            }
        }

        let mut writer = ResponseWriter::new(head);
        writer.send_headers(parts.status, headers);
        writer.write(&payload);
        writer.finish()
    }

    /// Hard-deletes every variant of the page, ignoring stale retention.
    async fn delete_variants(&self, state: &RequestState) {
        let url = state.ctx.page_url(&state.ignored);
        let group = &state.extension.group;
        for scheme in compression::compressions_to_store(&self.config, false) {
            let key = self.derive_key(&state.extension.with_compression(scheme), &url);
            if key.is_empty() {
                continue;
            }
            match self.store.hard_delete(&key, group).await {
                Ok(true) => tracing::debug!(key = %key, "deleted old page variant"),
                Ok(false) => {}
                Err(err) => tracing::warn!(key = %key, error = %err, "failed to delete page variant"),
            }
        }
    }

    fn redirects_to_self(&self, state: &RequestState, location: &str) -> bool {
        let target = location_url(&state.ctx, location, &state.ignored);
        let current = state.ctx.page_url(&state.ignored);
        key::page_key(&state.extension, &current, &self.config)
            == key::page_key(&state.extension, &target, &self.config)
    }

    fn finish(&self, state: &RequestState, status: ProcessStatus, mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
        let elapsed = state.started.elapsed();
        let size = response.body().size_hint().exact().unwrap_or_default() as usize;
        telemetry::record_request(status, elapsed, size);

        if self.config.debug {
            tracing::info!(
                outcome = %status,
                reason = %state.decision.reason,
                uri = %state.ctx.request_uri(),
                "page cache request"
            );
        }

        if self.logging.enabled {
            CacheEvent::new(status, state.page_key.clone())
                .with_method(state.ctx.method().clone())
                .with_uri(state.ctx.request_uri())
                .with_status(response.status())
                .with_size(size)
                .with_latency(elapsed)
                .with_reason(state.decision.reason.clone())
                .log(&self.logging);
        }

        if let Some(name) = &self.status_header {
            response
                .headers_mut()
                .insert(name.clone(), HeaderValue::from_static(status.as_str()));
        }
        response
    }
}

/// Returns the application's response as generated, minus the body for
/// HEAD requests.
fn pass_through(state: &RequestState, parts: Parts, body: Bytes) -> Response<Full<Bytes>> {
    let body = if state.ctx.is_head() { Bytes::new() } else { body };
    Response::from_parts(parts, Full::from(body))
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Compresses for the client, falling back to identity when the encoder
/// fails.
fn encode_for_client(body: Bytes, compression: Compression) -> (Bytes, Compression) {
    match compression.compress(&body) {
        Ok(encoded) => (encoded, compression),
        Err(err) => {
            tracing::warn!(error = %err, compression = compression.label(), "falling back to identity");
            (body, Compression::Identity)
        }
    }
}

/// Sends `payload` with the application's headers overlaid by the
/// prepared cache headers.
fn write_over(mut headers: HeaderMap, prepared: Prepared, payload: &[u8], head: bool) -> Response<Full<Bytes>> {
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_ENCODING);

    let mut current: Option<HeaderName> = None;
    for (name, value) in prepared.headers {
        if let Some(name) = name {
            headers.remove(&name);
            current = Some(name);
        }
        if let Some(name) = &current {
            headers.append(name.clone(), value);
        }
    }

    let mut writer = ResponseWriter::new(head);
    writer.send_headers(prepared.status, headers);
    writer.write(payload);
    writer.finish()
}

/// `host + path?query` for a redirect target, in the shape of
/// [`RequestContext::page_url`].
fn location_url(ctx: &RequestContext, location: &str, ignored: &[String]) -> String {
    let location = location.trim();
    let absolute = location
        .split_once("://")
        .filter(|(scheme, _)| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        })
        .map(|(_, rest)| rest)
        .or_else(|| location.strip_prefix("//"));

    let url = match absolute {
        Some(rest) => rest.to_owned(),
        None if location.starts_with('/') => format!("{}{}", ctx.host(), location),
        None => {
            let dir = ctx.path().rsplit_once('/').map(|(dir, _)| dir).unwrap_or_default();
            format!("{}{}/{}", ctx.host(), dir, location)
        }
    };

    match url.split_once('?') {
        Some((path, query)) => {
            let query = request::strip_query_params(query, ignored);
            if query.is_empty() {
                path.to_owned()
            } else {
                format!("{path}?{query}")
            }
        }
        None => url,
    }
}

/// Replaces every placeholder with ` (reason)`, or nothing when the reason
/// is empty. Returns `None` when the body has no placeholder.
fn replace_placeholder(body: &[u8], reason: &str) -> Option<Bytes> {
    let needle = REJECT_REASON_PLACEHOLDER.as_bytes();
    let mut idx = find(body, needle)?;
    let replacement = if reason.is_empty() {
        String::new()
    } else {
        format!(" ({reason})")
    };

    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;
    loop {
        out.extend_from_slice(&rest[..idx]);
        out.extend_from_slice(replacement.as_bytes());
        rest = &rest[idx + needle.len()..];
        match find(rest, needle) {
            Some(next) => idx = next,
            None => break,
        }
    }
    out.extend_from_slice(rest);
    Some(Bytes::from(out))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
