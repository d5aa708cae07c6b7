//! Extension points for collaborating subsystems.
//!
//! Every hook is an optional value transform. An unset hook leaves the
//! computed value untouched.
//!
//! ```
//! use tower_page_cache::hooks::Hooks;
//!
//! let hooks = Hooks::new()
//!     .with_ignored_query_params(|mut params| {
//!         params.push("fbclid".to_owned());
//!         params
//!     })
//!     .with_can_write(|_ctx, decision| decision.cacheable);
//! assert!(hooks.has_can_write());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::config::PageCacheConfig;
use crate::error::CacheError;
use crate::key::KeyExtension;
use crate::policy::{self, Decision};
use crate::request::RequestContext;
use crate::telemetry::ProcessStatus;

/// Reason recorded when a can-write override flips the computed decision.
pub const OVERRIDDEN_REASON: &str = "Overridden by collaborator";

type CanWriteFn = Arc<dyn Fn(&RequestContext, &Decision) -> bool + Send + Sync>;
type KeyExtensionFn = Arc<dyn Fn(&RequestContext, KeyExtension) -> KeyExtension + Send + Sync>;
type PageKeyFn = Arc<dyn Fn(&KeyExtension, String) -> String + Send + Sync>;
type ListFn = Arc<dyn Fn(Vec<String>) -> Vec<String> + Send + Sync>;
type LateInitFn = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;
type RulesCheckFn = Arc<dyn Fn() -> Result<(), CacheError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    can_write: Option<CanWriteFn>,
    key_extension: Option<KeyExtensionFn>,
    page_key: Option<PageKeyFn>,
    ignored_query_params: Option<ListFn>,
    cached_headers: Option<ListFn>,
    repeating_headers: Option<ListFn>,
    late_init: Option<LateInitFn>,
    rules_check: Option<RulesCheckFn>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("can_write", &self.can_write.is_some())
            .field("key_extension", &self.key_extension.is_some())
            .field("page_key", &self.page_key.is_some())
            .field("ignored_query_params", &self.ignored_query_params.is_some())
            .field("cached_headers", &self.cached_headers.is_some())
            .field("repeating_headers", &self.repeating_headers.is_some())
            .field("late_init", &self.late_init.is_some())
            .field("rules_check", &self.rules_check.is_some())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the final can-write boolean.
    pub fn with_can_write<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestContext, &Decision) -> bool + Send + Sync + 'static,
    {
        self.can_write = Some(Arc::new(hook));
        self
    }

    /// Relabels the variant axes, or vetoes caching by clearing
    /// [`KeyExtension::cache`].
    pub fn with_key_extension<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestContext, KeyExtension) -> KeyExtension + Send + Sync + 'static,
    {
        self.key_extension = Some(Arc::new(hook));
        self
    }

    /// Rewrites a derived page key. An empty result means "do not cache".
    pub fn with_page_key<F>(mut self, hook: F) -> Self
    where
        F: Fn(&KeyExtension, String) -> String + Send + Sync + 'static,
    {
        self.page_key = Some(Arc::new(hook));
        self
    }

    pub fn with_ignored_query_params<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<String>) -> Vec<String> + Send + Sync + 'static,
    {
        self.ignored_query_params = Some(Arc::new(hook));
        self
    }

    pub fn with_cached_headers<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<String>) -> Vec<String> + Send + Sync + 'static,
    {
        self.cached_headers = Some(Arc::new(hook));
        self
    }

    pub fn with_repeating_headers<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<String>) -> Vec<String> + Send + Sync + 'static,
    {
        self.repeating_headers = Some(Arc::new(hook));
        self
    }

    /// Second evaluation for the late init and late caching modes. A
    /// returned reason vetoes serving from cache for this request.
    pub fn with_late_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        self.late_init = Some(Arc::new(hook));
        self
    }

    /// Verifies the front-end server rules enhanced mode depends on.
    pub fn with_rules_check<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), CacheError> + Send + Sync + 'static,
    {
        self.rules_check = Some(Arc::new(hook));
        self
    }

    pub fn has_can_write(&self) -> bool {
        self.can_write.is_some()
    }

    pub(crate) fn apply_can_write(&self, ctx: &RequestContext, computed: Decision) -> Decision {
        let Some(hook) = &self.can_write else {
            return computed;
        };
        let overridden = hook(ctx, &computed);
        if overridden == computed.cacheable {
            return computed;
        }
        Decision {
            cacheable: overridden,
            reason: OVERRIDDEN_REASON.to_owned(),
            status: (!overridden).then_some(ProcessStatus::MissThirdParty),
        }
    }

    pub(crate) fn apply_key_extension(&self, ctx: &RequestContext, extension: KeyExtension) -> KeyExtension {
        match &self.key_extension {
            Some(hook) => hook(ctx, extension),
            None => extension,
        }
    }

    pub(crate) fn apply_page_key(&self, extension: &KeyExtension, key: String) -> String {
        match &self.page_key {
            Some(hook) => hook(extension, key),
            None => key,
        }
    }

    pub(crate) fn ignored_query_params(&self, config: &PageCacheConfig) -> Vec<String> {
        let params = config.accept_qs.clone();
        match &self.ignored_query_params {
            Some(hook) => hook(params),
            None => params,
        }
    }

    pub(crate) fn cached_headers(&self, config: &PageCacheConfig) -> Vec<String> {
        let names = policy::cached_header_names(config);
        match &self.cached_headers {
            Some(hook) => hook(names),
            None => names,
        }
    }

    pub(crate) fn repeating_headers(&self) -> Vec<String> {
        let names = policy::repeating_header_names();
        match &self.repeating_headers {
            Some(hook) => hook(names),
            None => names,
        }
    }

    pub(crate) fn late_init(&self, ctx: &RequestContext) -> Option<String> {
        self.late_init.as_ref().and_then(|hook| hook(ctx))
    }

    /// Runs the rules check. Failures are logged and swallowed: the cache
    /// stays writable while the front-end rules are repaired.
    pub(crate) fn check_rules(&self) {
        if let Some(hook) = &self.rules_check {
            if let Err(err) = hook() {
                tracing::debug!(error = %err, "page cache rules check failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> RequestContext {
        RequestContext::from_request(&Request::builder().uri("/").body(()).expect("request"))
    }

    #[test]
    fn unset_hooks_pass_values_through() {
        let hooks = Hooks::new();
        let decision = Decision::reject("Page is 404", ProcessStatus::Miss404);
        assert_eq!(hooks.apply_can_write(&ctx(), decision.clone()), decision);
        assert_eq!(hooks.apply_page_key(&KeyExtension::default(), "k".into()), "k");
        assert_eq!(
            hooks.cached_headers(&PageCacheConfig::default()),
            policy::cached_header_names(&PageCacheConfig::default())
        );
        assert!(hooks.late_init(&ctx()).is_none());
    }

    #[test]
    fn disagreeing_override_replaces_reason() {
        let hooks = Hooks::new().with_can_write(|_, _| true);
        let decision = hooks.apply_can_write(&ctx(), Decision::reject("Page is 404", ProcessStatus::Miss404));
        assert!(decision.cacheable);
        assert_eq!(decision.reason, OVERRIDDEN_REASON);

        let veto = Hooks::new().with_can_write(|_, _| false);
        let decision = veto.apply_can_write(&ctx(), Decision::allow());
        assert!(!decision.cacheable);
        assert_eq!(decision.status, Some(ProcessStatus::MissThirdParty));

        let agreeing = Hooks::new().with_can_write(|_, decision| decision.cacheable);
        let decision = agreeing.apply_can_write(&ctx(), Decision::reject("Page is 404", ProcessStatus::Miss404));
        assert_eq!(decision.reason, "Page is 404");
    }

    #[test]
    fn list_hooks_transform_defaults() {
        let hooks = Hooks::new()
            .with_ignored_query_params(|mut params| {
                params.push("fbclid".to_owned());
                params
            })
            .with_repeating_headers(|_| vec!["x-trace".to_owned()]);
        let config = PageCacheConfig::default().with_accept_qs(["utm_source"]);
        assert_eq!(hooks.ignored_query_params(&config), vec!["utm_source", "fbclid"]);
        assert_eq!(hooks.repeating_headers(), vec!["x-trace"]);
    }

    #[test]
    fn rules_check_failure_is_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hooks = Hooks::new().with_rules_check(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Config("rules file missing".into()))
        });
        hooks.check_rules();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
